//! Message parts.
//!
//! A `Frame` is one opaque part of a multipart message. Frames own their
//! bytes; cloning is a reference-count bump.

use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

/// One part of a multipart message.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame(Bytes);

/// A multipart message. Delivered whole or not at all.
pub type Message = Vec<Frame>;

impl Frame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Interpret the frame as UTF-8. `None` if it is not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Frame {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Frame {
    fn from(s: &'static [u8]) -> Self {
        Self(Bytes::from_static(s))
    }
}

impl<const N: usize> From<&'static [u8; N]> for Frame {
    fn from(s: &'static [u8; N]) -> Self {
        Self(Bytes::from_static(s))
    }
}

impl From<&'static str> for Frame {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&String> for Frame {
    fn from(s: &String) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) if s.chars().all(|c| !c.is_control()) => write!(f, "Frame({s:?})"),
            _ => write!(f, "Frame(0x{})", hex_prefix(&self.0)),
        }
    }
}

fn hex_prefix(b: &[u8]) -> String {
    let mut out = String::with_capacity(b.len().min(16) * 2);
    for byte in b.iter().take(16) {
        out.push_str(&format!("{byte:02x}"));
    }
    if b.len() > 16 {
        out.push_str("..");
    }
    out
}

/// Build a message from anything frame-like.
///
/// ```
/// use switchyard_core::frame::message;
/// let m = message([&b"a"[..], &b"b"[..]]);
/// assert_eq!(m.len(), 2);
/// ```
pub fn message<I, T>(parts: I) -> Message
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    parts
        .into_iter()
        .map(|p| Frame::new(Bytes::copy_from_slice(p.as_ref())))
        .collect()
}
