//! switchyardd — runs one Switchyard registry.
//!
//!   switchyardd [config.toml]
//!
//! Without an argument the config is resolved the usual way
//! ($SWITCHYARD_CONFIG, then the XDG config file, then defaults).

use std::path::Path;

use anyhow::{Context, Result};

use switchyard_core::config::SwitchyardConfig;
use switchyard_services::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SwitchyardConfig::load_from(Path::new(&path))
            .with_context(|| format!("failed to load config from {path}"))?,
        None => {
            if let Err(e) = SwitchyardConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            SwitchyardConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                SwitchyardConfig::default()
            })
        }
    };

    let registry = Registry::from_config(&config)
        .await
        .context("failed to set up registry")?;
    registry.start().context("failed to start registry")?;
    tracing::info!(
        registry_id = registry.id().unwrap_or_default(),
        broadcast = registry.broadcast_endpoint().unwrap_or_default(),
        request = registry.request_endpoint().unwrap_or_default(),
        peers = registry.peers().len(),
        "switchyardd running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    registry.close();
    Ok(())
}
