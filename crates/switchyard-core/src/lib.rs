//! switchyard-core — shared types, wire format, and configuration.
//! All other Switchyard crates depend on this one.

pub mod config;
pub mod frame;
pub mod types;
pub mod wire;

pub use frame::{Frame, Message};
pub use types::{LbStrategy, ServiceType, TopicMode, Wait};
