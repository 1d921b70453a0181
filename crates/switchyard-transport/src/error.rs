use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint {0:?}: {1}")]
    InvalidEndpoint(String, &'static str),

    #[error("bind {endpoint} failed: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("inproc endpoint {0} is already bound")]
    AddressInUse(String),

    #[error("no connected peer with routing id {0}")]
    HostUnreachable(String),

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("socket is closed")]
    Closed,

    #[error("tls: {0}")]
    Tls(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
