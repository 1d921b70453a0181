//! Per-socket tunables.

use std::time::Duration;

use switchyard_core::config::TransportConfig;

/// A single option change, applied with `set_option` on any socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Outbound queue depth for connections opened afterwards.
    SendHighWater(usize),
    /// Delay between reconnection attempts.
    ReconnectInterval(Duration),
    /// Router only: a new connection with a known routing id replaces the
    /// old one instead of being refused.
    Handover(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub send_hwm: usize,
    /// Inbound queue depth. Fixed when the socket is created.
    pub recv_hwm: usize,
    pub reconnect_interval: Duration,
    pub handover: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl SocketOptions {
    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self {
            send_hwm: cfg.send_hwm.max(1),
            recv_hwm: cfg.recv_hwm.max(1),
            reconnect_interval: Duration::from_millis(cfg.reconnect_interval_ms),
            handover: false,
        }
    }

    pub fn apply(&mut self, option: SocketOption) {
        match option {
            SocketOption::SendHighWater(n) => self.send_hwm = n.max(1),
            SocketOption::ReconnectInterval(d) => self.reconnect_interval = d,
            SocketOption::Handover(on) => self.handover = on,
        }
    }
}
