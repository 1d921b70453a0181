//! switchyard-transport — a small multipart message transport.
//!
//! Four socket roles carry opaque multipart messages over tcp://, tls:// and
//! inproc:// endpoints:
//!
//! - `RouterSocket` addresses each peer by routing identity.
//! - `DealerSocket` holds one reconnecting connection with a fixed identity.
//! - `PubSocket` fans messages out to subscribers by first-frame prefix.
//! - `SubSocket` connects to many publishers and forwards its prefixes upstream.
//!
//! Every logical message travels as one length-delimited frame, so a
//! message is delivered whole or not at all.

pub mod codec;
pub mod dealer;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod publisher;
pub mod router;
pub mod stream;
pub mod subscriber;
pub mod tls;

mod queue;

pub use dealer::DealerSocket;
pub use endpoint::Endpoint;
pub use error::TransportError;
pub use options::{SocketOption, SocketOptions};
pub use publisher::{PubSocket, Reservation};
pub use router::{PeerEvent, RouterSocket};
pub use subscriber::SubSocket;
pub use tls::TlsClient;
