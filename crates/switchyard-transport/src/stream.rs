//! Byte streams behind every socket: TCP, TLS over TCP, and in-process pipes.
//!
//! inproc:// endpoints live in a process-wide table of listeners. Connecting
//! creates a duplex pipe and hands the far end to the listener.

use std::io;
use std::sync::LazyLock;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::tls::TlsClient;

/// Buffer size of each direction of an inproc pipe.
const INPROC_PIPE_BYTES: usize = 256 * 1024;

pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

static INPROC: LazyLock<DashMap<String, mpsc::Sender<DuplexStream>>> = LazyLock::new(DashMap::new);

// ── Listening ─────────────────────────────────────────────────────────────────

pub enum Listener {
    Tcp {
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    },
    Inproc {
        name: String,
        tx: mpsc::Sender<DuplexStream>,
        rx: mpsc::Receiver<DuplexStream>,
    },
}

/// An accepted connection that has not finished its TLS handshake yet.
pub struct Incoming {
    raw: Raw,
    tls: Option<TlsAcceptor>,
    pub peer: String,
}

enum Raw {
    Tcp(TcpStream),
    Inproc(DuplexStream),
}

impl Incoming {
    /// Complete the TLS handshake if the listener requires one.
    pub async fn establish(self) -> io::Result<BoxStream> {
        match (self.raw, self.tls) {
            (Raw::Tcp(s), Some(acceptor)) => Ok(Box::new(acceptor.accept(s).await?)),
            (Raw::Tcp(s), None) => Ok(Box::new(s)),
            (Raw::Inproc(s), _) => Ok(Box::new(s)),
        }
    }
}

/// Bind an endpoint. Returns the listener and the endpoint with any
/// OS-assigned port filled in.
pub async fn listen(
    endpoint: &Endpoint,
    tls: Option<TlsAcceptor>,
) -> Result<(Listener, Endpoint), TransportError> {
    match endpoint {
        Endpoint::Inproc(name) => {
            let (tx, rx) = mpsc::channel(64);
            match INPROC.entry(name.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    Err(TransportError::AddressInUse(endpoint.to_string()))
                }
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(tx.clone());
                    Ok((
                        Listener::Inproc {
                            name: name.clone(),
                            tx,
                            rx,
                        },
                        endpoint.clone(),
                    ))
                }
            }
        }
        Endpoint::Tcp { .. } | Endpoint::Tls { .. } => {
            if endpoint.is_tls() && tls.is_none() {
                return Err(TransportError::Tls(format!(
                    "{endpoint} needs a server certificate"
                )));
            }
            let addr = endpoint.bind_addr().unwrap_or_default();
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| TransportError::Bind {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            let port = listener.local_addr()?.port();
            let tls = if endpoint.is_tls() { tls } else { None };
            Ok((Listener::Tcp { listener, tls }, endpoint.with_port(port)))
        }
    }
}

impl Listener {
    pub async fn accept(&mut self) -> io::Result<Incoming> {
        match self {
            Listener::Tcp { listener, tls } => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Incoming {
                    raw: Raw::Tcp(stream),
                    tls: tls.clone(),
                    peer: addr.to_string(),
                })
            }
            Listener::Inproc { name, rx, .. } => {
                let pipe = rx
                    .recv()
                    .await
                    .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "inproc listener gone"))?;
                Ok(Incoming {
                    raw: Raw::Inproc(pipe),
                    tls: None,
                    peer: format!("inproc://{name}"),
                })
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Inproc { name, tx, .. } = self {
            INPROC.remove_if(name.as_str(), |_, registered| registered.same_channel(tx));
        }
    }
}

/// Release an inproc name right away, before the accept task notices the
/// socket closed.
pub(crate) fn release_inproc(endpoint: &Endpoint) {
    if let Endpoint::Inproc(name) = endpoint {
        INPROC.remove(name);
    }
}

// ── Connecting ────────────────────────────────────────────────────────────────

pub async fn connect(endpoint: &Endpoint, tls: Option<&TlsClient>) -> Result<BoxStream, TransportError> {
    match endpoint {
        Endpoint::Inproc(name) => {
            let listener = INPROC
                .get(name)
                .map(|e| e.value().clone())
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no inproc listener"))?;
            let (near, far) = tokio::io::duplex(INPROC_PIPE_BYTES);
            listener
                .send(far)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "inproc listener closed"))?;
            Ok(Box::new(near))
        }
        Endpoint::Tcp { .. } | Endpoint::Tls { .. } => {
            let (host, port) = endpoint
                .connect_addr()
                .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string(), "no address"))?;
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            if !endpoint.is_tls() {
                return Ok(Box::new(stream));
            }
            let client = tls.ok_or_else(|| {
                TransportError::Tls(format!("{endpoint} needs a client TLS configuration"))
            })?;
            let name = client.server_name(&host)?;
            let stream = client.connector().connect(name, stream).await?;
            Ok(Box::new(stream))
        }
    }
}
