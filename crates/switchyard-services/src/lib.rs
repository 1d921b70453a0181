//! switchyard-services — the overlay roles.
//!
//! - `Registry`: authoritative directory, federates with peer registries.
//! - `Discovery`: client-side cache of one registry's broadcast feed.
//! - `Receiver`: a provider that registers a request socket.
//! - `Gateway`: load balancer over the receivers a Discovery reports.
//! - `SpotNode` / `Spot`: topic pub/sub between peer nodes.
//!
//! Every role wraps transport sockets plus one background task and is torn
//! down with an idempotent `close()`.

pub mod balancer;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod receiver;
pub mod registration;
pub mod registry;
pub mod spot;
pub mod topic;

pub use discovery::{Discovery, DiscoverySocket};
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewaySocket};
pub use receiver::{Receiver, ReceiverSocket};
pub use registration::{RegisterResult, RegisterStatus, RegistrationHandle};
pub use registry::{Registry, RegistrySocket};
pub use spot::{Spot, SpotNode, SpotSocket};

pub use switchyard_core::{Frame, LbStrategy, Message, ServiceType, TopicMode, Wait};
pub use switchyard_transport::{SocketOption, TlsClient};

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
