use switchyard_core::config::ConfigError;
use switchyard_transport::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("endpoints were never bound")]
    EndpointsUnset,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("service {0:?} is not registered")]
    NotRegistered(String),

    #[error("no receivers available for {0:?}")]
    NoReceiversAvailable(String),

    #[error("unknown topic {0:?}")]
    UnknownTopic(String),

    #[error("topic {0:?} already exists")]
    TopicExists(String),

    #[error("registry rejected request (code {code}): {message}")]
    Rejected { code: u8, message: String },

    #[error("closed")]
    Closed,

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::WouldBlock => Error::WouldBlock,
            TransportError::Timeout => Error::Timeout,
            TransportError::Closed => Error::Closed,
            TransportError::InvalidEndpoint(ep, _) => Error::InvalidEndpoint(ep),
            other => Error::Transport(other),
        }
    }
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Transient conditions a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Timeout)
    }
}
