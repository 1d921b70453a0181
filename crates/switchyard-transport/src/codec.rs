//! Message framing and the connection greeting.
//!
//! Each multipart message is one `LengthDelimitedCodec` frame with the body
//!
//!   [u32 part count] ( [u32 part length] [part bytes] )*
//!
//! so the peer either reads the whole message or nothing. The first message
//! on every connection is a greeting naming the socket kind and its routing
//! identity.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use switchyard_core::{Frame, Message};

use crate::error::TransportError;
use crate::stream::BoxStream;

/// Largest encoded message accepted from a peer.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

const GREETING_MAGIC: &[u8] = b"SWYD\x01";
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

pub type Connection = Framed<BoxStream, LengthDelimitedCodec>;

pub fn framed(stream: BoxStream) -> Connection {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE_BYTES)
        .new_framed(stream)
}

pub fn encode(msg: &[Frame]) -> Bytes {
    let len = 4 + msg.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32_le(msg.len() as u32);
    for part in msg {
        buf.put_u32_le(part.len() as u32);
        buf.put_slice(part);
    }
    buf.freeze()
}

pub fn decode(mut buf: Bytes) -> Result<Message, TransportError> {
    let truncated = || TransportError::Protocol("truncated message".into());
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let count = buf.get_u32_le() as usize;
    // Every part costs at least its 4-byte length.
    if count > buf.remaining() / 4 {
        return Err(truncated());
    }
    let mut msg = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(truncated());
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(truncated());
        }
        msg.push(Frame::new(buf.split_to(len)));
    }
    if buf.has_remaining() {
        return Err(TransportError::Protocol(format!(
            "{} stray bytes after message",
            buf.remaining()
        )));
    }
    Ok(msg)
}

// ── Greeting ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketKind {
    Router = 1,
    Dealer = 2,
    Pub = 3,
    Sub = 4,
}

impl SocketKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(SocketKind::Router),
            2 => Some(SocketKind::Dealer),
            3 => Some(SocketKind::Pub),
            4 => Some(SocketKind::Sub),
            _ => None,
        }
    }

    /// Whether a socket of this kind may talk to a peer of kind `other`.
    pub fn accepts(self, other: SocketKind) -> bool {
        use SocketKind::*;
        matches!(
            (self, other),
            (Router, Router) | (Router, Dealer) | (Dealer, Router) | (Pub, Sub) | (Sub, Pub)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub kind: SocketKind,
    pub routing_id: Bytes,
}

/// Exchange greetings. Fails if the peer is silent, speaks another protocol,
/// or is a socket kind this one cannot talk to.
pub async fn handshake(
    conn: &mut Connection,
    kind: SocketKind,
    routing_id: &Bytes,
) -> Result<Greeting, TransportError> {
    let hello: Message = vec![
        Frame::from(GREETING_MAGIC),
        Frame::new(Bytes::copy_from_slice(&[kind as u8])),
        Frame::new(routing_id.clone()),
    ];
    conn.send(encode(&hello)).await?;

    let reply = tokio::time::timeout(GREETING_TIMEOUT, conn.next())
        .await
        .map_err(|_| TransportError::Timeout)?
        .ok_or_else(|| TransportError::Protocol("closed before greeting".into()))??;
    let reply = decode(reply.freeze())?;

    let [magic, peer_kind, peer_id] = reply.as_slice() else {
        return Err(TransportError::Protocol("malformed greeting".into()));
    };
    if &**magic != GREETING_MAGIC {
        return Err(TransportError::Protocol("bad greeting magic".into()));
    }
    let peer_kind = match &**peer_kind {
        [b] => SocketKind::from_u8(*b),
        _ => None,
    }
    .ok_or_else(|| TransportError::Protocol("unknown socket kind".into()))?;
    if !kind.accepts(peer_kind) {
        return Err(TransportError::Protocol(format!(
            "{kind:?} socket cannot talk to {peer_kind:?}"
        )));
    }
    Ok(Greeting {
        kind: peer_kind,
        routing_id: peer_id.as_bytes().clone(),
    })
}

// ── Pump ──────────────────────────────────────────────────────────────────────

/// Where a connection's outbound messages come from. `None` ends the
/// connection.
pub trait Outbound: Send {
    fn next(&mut self) -> BoxFuture<'_, Option<Message>>;
}

impl Outbound for mpsc::Receiver<Message> {
    fn next(&mut self) -> BoxFuture<'_, Option<Message>> {
        Box::pin(self.recv())
    }
}

/// Drive one connection until it fails, `outbound` closes, `deliver`
/// returns false, or `cancel` fires.
///
/// Outbound messages are written in order; inbound messages are handed to
/// `deliver` one at a time, so a slow consumer pushes back on the peer.
pub async fn pump<O, F, Fut>(
    conn: Connection,
    outbound: &mut O,
    cancel: &CancellationToken,
    mut deliver: F,
) -> Result<(), TransportError>
where
    O: Outbound + ?Sized,
    F: FnMut(Message) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let (mut sink, mut stream) = conn.split();

    let writer = async {
        while let Some(msg) = outbound.next().await {
            sink.send(encode(&msg)).await?;
        }
        Ok::<_, TransportError>(())
    };

    let reader = async {
        while let Some(frame) = stream.next().await {
            let msg = decode(frame?.freeze())?;
            if !deliver(msg).await {
                break;
            }
        }
        Ok::<_, TransportError>(())
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(()),
        r = writer => r,
        r = reader => r,
    }
}
