//! Small enums shared by every role.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

// ── Service type ──────────────────────────────────────────────────────────────

/// What kind of provider a directory record describes.
///
/// A Discovery instance is created for one type and ignores records of the
/// other, so gateway receivers and spot nodes can share a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ServiceType {
    /// A receiver serving gateway requests.
    Gateway = 1,
    /// A spot node publishing topics.
    Spot = 2,
}

impl TryFrom<u16> for ServiceType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ServiceType::Gateway),
            2 => Ok(ServiceType::Spot),
            other => Err(WireError::UnknownServiceType(other)),
        }
    }
}

impl From<ServiceType> for u16 {
    fn from(t: ServiceType) -> u16 {
        t as u16
    }
}

// ── Load balancing ────────────────────────────────────────────────────────────

/// Gateway selection strategy, set per service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbStrategy {
    /// Cycle through ready connections in the order they became ready.
    #[default]
    RoundRobin,
    /// Smooth weighted round-robin over advertised weights.
    Weighted,
}

// ── Topic mode ────────────────────────────────────────────────────────────────

/// Delivery mode for a spot topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TopicMode {
    /// Bounded FIFO. Full queues push back on the publisher; nothing is dropped.
    #[default]
    Queue = 0,
    /// Fixed-depth ring per subscriber. Full rings overwrite the oldest entry.
    RingBuffer = 1,
}

impl TryFrom<u8> for TopicMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TopicMode::Queue),
            1 => Ok(TopicMode::RingBuffer),
            other => Err(WireError::UnknownTopicMode(other)),
        }
    }
}

impl From<TopicMode> for u8 {
    fn from(m: TopicMode) -> u8 {
        m as u8
    }
}

// ── Wait mode ─────────────────────────────────────────────────────────────────

/// How long a send or receive may wait for capacity or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail immediately with `WouldBlock`.
    DontWait,
    /// Wait until the operation completes or the socket closes.
    Block,
    /// Wait at most this long, then fail with `Timeout`.
    Timeout(Duration),
}

impl Wait {
    pub fn millis(ms: u64) -> Self {
        Wait::Timeout(Duration::from_millis(ms))
    }
}

impl Default for Wait {
    fn default() -> Self {
        Wait::Block
    }
}
