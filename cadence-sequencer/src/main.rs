//! Standalone sequencer: `CADENCE_BIND_ADDR`, `CADENCE_SUMMARY_THRESHOLD`
//! and `CADENCE_BROADCAST_CAPACITY` override the defaults.

use cadence_collab::server::{SequencerServer, ServerConfig};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {key}={raw}");
            default
        }),
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        bind_addr: env_or("CADENCE_BIND_ADDR", defaults.bind_addr.clone()),
        summary_threshold: env_or("CADENCE_SUMMARY_THRESHOLD", defaults.summary_threshold),
        broadcast_capacity: env_or("CADENCE_BROADCAST_CAPACITY", defaults.broadcast_capacity),
        ..defaults
    };
    log::info!(
        "Starting sequencer on {} (summary threshold {})",
        config.bind_addr,
        config.summary_threshold
    );

    SequencerServer::new(config).run().await
}
