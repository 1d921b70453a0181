//! Configuration system for Switchyard.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SWITCHYARD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/switchyard/config.toml
//!   3. ~/.config/switchyard/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::LbStrategy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub registry: RegistryConfig,
    pub receiver: ReceiverConfig,
    pub gateway: GatewayConfig,
    pub spot: SpotConfig,
    pub transport: TransportConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Where directory snapshots are published.
    pub broadcast_endpoint: String,
    /// Where providers send register/heartbeat/unregister requests.
    pub request_endpoint: String,
    /// Federation id. 0 = pick a random id at start.
    pub id: u32,
    /// Broadcast endpoints of peer registries to merge from.
    pub peers: Vec<String>,
    pub heartbeat_interval_ms: u64,
    /// Records not refreshed within this window are purged.
    pub heartbeat_timeout_ms: u64,
    /// Snapshot cadence. 0 = follow heartbeat_interval_ms.
    pub broadcast_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Strategy for services that never had one set explicitly.
    pub default_strategy: LbStrategy,
    /// How long a dropped receiver stays out of the pool.
    pub down_backoff_ms: u64,
    /// Pool reconciliation tick.
    pub refresh_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotConfig {
    /// Per-spot capacity for QUEUE topics.
    pub queue_capacity: usize,
    /// Per-topic ring depth for RINGBUFFER topics.
    pub ring_capacity: usize,
    /// Discovery-driven peer refresh tick.
    pub peer_refresh_ms: u64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Outbound queue depth per connection.
    pub send_hwm: usize,
    /// Inbound queue depth per socket.
    pub recv_hwm: usize,
    pub reconnect_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain presented on tls:// binds. Empty = TLS server off.
    pub cert_path: String,
    pub key_path: String,
    /// PEM CA bundle for verifying tls:// peers. Empty = system roots only.
    pub ca_path: String,
    /// Name to verify against the peer certificate. Empty = endpoint host.
    pub hostname: String,
    /// Also trust the bundled web PKI roots.
    pub trust_system: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_DOWN_BACKOFF_MS: u64 = 500;
pub const DEFAULT_REFRESH_MS: u64 = 500;
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;
pub const DEFAULT_RING_CAPACITY: usize = 1_024;
pub const DEFAULT_SEND_HWM: usize = 1_000;
pub const DEFAULT_RECV_HWM: usize = 1_000;
pub const DEFAULT_RECONNECT_MS: u64 = 100;

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_endpoint: "tcp://127.0.0.1:5550".into(),
            request_endpoint: "tcp://127.0.0.1:5551".into(),
            id: 0,
            peers: Vec::new(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            broadcast_interval_ms: 0,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_strategy: LbStrategy::RoundRobin,
            down_backoff_ms: DEFAULT_DOWN_BACKOFF_MS,
            refresh_interval_ms: DEFAULT_REFRESH_MS,
        }
    }
}

impl Default for SpotConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ring_capacity: DEFAULT_RING_CAPACITY,
            peer_refresh_ms: DEFAULT_REFRESH_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_hwm: DEFAULT_SEND_HWM,
            recv_hwm: DEFAULT_RECV_HWM,
            reconnect_interval_ms: DEFAULT_RECONNECT_MS,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("switchyard")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SwitchyardConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, still applying env overrides.
    /// A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            SwitchyardConfig::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SWITCHYARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SwitchyardConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SWITCHYARD_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Split out so tests need not
    /// touch the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SWITCHYARD_REGISTRY__BROADCAST_ENDPOINT") {
            self.registry.broadcast_endpoint = v;
        }
        if let Some(v) = lookup("SWITCHYARD_REGISTRY__REQUEST_ENDPOINT") {
            self.registry.request_endpoint = v;
        }
        if let Some(v) = lookup("SWITCHYARD_REGISTRY__ID") {
            self.registry.id = parse_num("SWITCHYARD_REGISTRY__ID", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_REGISTRY__PEERS") {
            self.registry.peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("SWITCHYARD_REGISTRY__HEARTBEAT_INTERVAL_MS") {
            self.registry.heartbeat_interval_ms =
                parse_num("SWITCHYARD_REGISTRY__HEARTBEAT_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_REGISTRY__HEARTBEAT_TIMEOUT_MS") {
            self.registry.heartbeat_timeout_ms =
                parse_num("SWITCHYARD_REGISTRY__HEARTBEAT_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_REGISTRY__BROADCAST_INTERVAL_MS") {
            self.registry.broadcast_interval_ms =
                parse_num("SWITCHYARD_REGISTRY__BROADCAST_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_RECEIVER__HEARTBEAT_INTERVAL_MS") {
            self.receiver.heartbeat_interval_ms =
                parse_num("SWITCHYARD_RECEIVER__HEARTBEAT_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_GATEWAY__DEFAULT_STRATEGY") {
            self.gateway.default_strategy = match v.trim() {
                "round_robin" => LbStrategy::RoundRobin,
                "weighted" => LbStrategy::Weighted,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "SWITCHYARD_GATEWAY__DEFAULT_STRATEGY",
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = lookup("SWITCHYARD_GATEWAY__DOWN_BACKOFF_MS") {
            self.gateway.down_backoff_ms = parse_num("SWITCHYARD_GATEWAY__DOWN_BACKOFF_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_GATEWAY__REFRESH_INTERVAL_MS") {
            self.gateway.refresh_interval_ms =
                parse_num("SWITCHYARD_GATEWAY__REFRESH_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_SPOT__QUEUE_CAPACITY") {
            self.spot.queue_capacity = parse_num("SWITCHYARD_SPOT__QUEUE_CAPACITY", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_SPOT__RING_CAPACITY") {
            self.spot.ring_capacity = parse_num("SWITCHYARD_SPOT__RING_CAPACITY", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_SPOT__PEER_REFRESH_MS") {
            self.spot.peer_refresh_ms = parse_num("SWITCHYARD_SPOT__PEER_REFRESH_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_SPOT__HEARTBEAT_INTERVAL_MS") {
            self.spot.heartbeat_interval_ms =
                parse_num("SWITCHYARD_SPOT__HEARTBEAT_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_TRANSPORT__SEND_HWM") {
            self.transport.send_hwm = parse_num("SWITCHYARD_TRANSPORT__SEND_HWM", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_TRANSPORT__RECV_HWM") {
            self.transport.recv_hwm = parse_num("SWITCHYARD_TRANSPORT__RECV_HWM", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_TRANSPORT__RECONNECT_INTERVAL_MS") {
            self.transport.reconnect_interval_ms =
                parse_num("SWITCHYARD_TRANSPORT__RECONNECT_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("SWITCHYARD_TLS__CERT_PATH") {
            self.tls.cert_path = v;
        }
        if let Some(v) = lookup("SWITCHYARD_TLS__KEY_PATH") {
            self.tls.key_path = v;
        }
        if let Some(v) = lookup("SWITCHYARD_TLS__CA_PATH") {
            self.tls.ca_path = v;
        }
        if let Some(v) = lookup("SWITCHYARD_TLS__HOSTNAME") {
            self.tls.hostname = v;
        }
        if let Some(v) = lookup("SWITCHYARD_TLS__TRUST_SYSTEM") {
            self.tls.trust_system = v == "true" || v == "1";
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_uses_protocol_timings() {
        let config = SwitchyardConfig::default();
        assert_eq!(config.registry.heartbeat_interval_ms, 5_000);
        assert_eq!(config.registry.heartbeat_timeout_ms, 15_000);
        assert_eq!(config.spot.ring_capacity, 1_024);
        assert_eq!(config.gateway.default_strategy, LbStrategy::RoundRobin);
        assert!(!config.tls.trust_system);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = SwitchyardConfig::parse(
            r#"
            [registry]
            id = 9
            peers = ["tcp://10.0.0.2:5550"]

            [gateway]
            default_strategy = "weighted"
            "#,
        )
        .unwrap();
        assert_eq!(config.registry.id, 9);
        assert_eq!(config.registry.peers.len(), 1);
        assert_eq!(config.registry.heartbeat_timeout_ms, 15_000);
        assert_eq!(config.gateway.default_strategy, LbStrategy::Weighted);
        assert_eq!(config.spot.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn overrides_apply_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("SWITCHYARD_REGISTRY__ID", "77"),
            ("SWITCHYARD_REGISTRY__PEERS", "tcp://a:1, tcp://b:2,"),
            ("SWITCHYARD_TLS__TRUST_SYSTEM", "1"),
            ("SWITCHYARD_TLS__HOSTNAME", "registry.internal"),
            ("SWITCHYARD_RECEIVER__HEARTBEAT_INTERVAL_MS", "250"),
            ("SWITCHYARD_GATEWAY__DEFAULT_STRATEGY", "weighted"),
            ("SWITCHYARD_GATEWAY__DOWN_BACKOFF_MS", "40"),
            ("SWITCHYARD_GATEWAY__REFRESH_INTERVAL_MS", "900"),
            ("SWITCHYARD_SPOT__QUEUE_CAPACITY", "16"),
            ("SWITCHYARD_SPOT__RING_CAPACITY", "8"),
            ("SWITCHYARD_SPOT__PEER_REFRESH_MS", "300"),
            ("SWITCHYARD_SPOT__HEARTBEAT_INTERVAL_MS", "700"),
            ("SWITCHYARD_TRANSPORT__RECV_HWM", "64"),
        ]
        .into_iter()
        .collect();

        let mut config = SwitchyardConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.registry.id, 77);
        assert_eq!(config.registry.peers, vec!["tcp://a:1", "tcp://b:2"]);
        assert!(config.tls.trust_system);
        assert_eq!(config.tls.hostname, "registry.internal");
        assert_eq!(config.receiver.heartbeat_interval_ms, 250);
        assert_eq!(config.gateway.default_strategy, LbStrategy::Weighted);
        assert_eq!(config.gateway.down_backoff_ms, 40);
        assert_eq!(config.gateway.refresh_interval_ms, 900);
        assert_eq!(config.spot.queue_capacity, 16);
        assert_eq!(config.spot.ring_capacity, 8);
        assert_eq!(config.spot.peer_refresh_ms, 300);
        assert_eq!(config.spot.heartbeat_interval_ms, 700);
        assert_eq!(config.transport.recv_hwm, 64);
    }

    #[test]
    fn bad_numeric_override_is_an_error() {
        let mut config = SwitchyardConfig::default();
        let err = config
            .apply_overrides(|k| (k == "SWITCHYARD_TRANSPORT__SEND_HWM").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "SWITCHYARD_TRANSPORT__SEND_HWM", .. }));
    }

    #[test]
    fn unknown_strategy_override_is_an_error() {
        let mut config = SwitchyardConfig::default();
        let err = config
            .apply_overrides(|k| (k == "SWITCHYARD_GATEWAY__DEFAULT_STRATEGY").then(|| "random".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "SWITCHYARD_GATEWAY__DEFAULT_STRATEGY", .. }
        ));
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("switchyard-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("SWITCHYARD_CONFIG", config_path.to_str().unwrap());
        }

        let path = SwitchyardConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = SwitchyardConfig::load().expect("load should succeed");
        assert_eq!(config.registry.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);

        unsafe {
            std::env::remove_var("SWITCHYARD_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
