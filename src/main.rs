//! duplex-ndjson: full-duplex NDJSON ping/pong over one HTTP/1.1 exchange
//!
//! One process runs both halves:
//! - an endpoint that accepts a POST and streams pongs back on the same
//!   response while it keeps reading the request body
//! - an initiator that opens the exchange and streams pings
//!
//! Features:
//! - Paced or max-throughput sending
//! - Paired (ping then pong) or independent write schedules
//! - Periodic throughput reports
//! - Graceful shutdown on SIGINT/SIGTERM with a bounded grace period
//! - Configuration via CLI arguments or TOML file

mod codec;
mod config;
mod endpoint;
mod error;
mod initiator;
mod lifecycle;
mod metrics;
mod pacing;
mod transport;

use config::Config;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        hostport = %config.hostport,
        mode = ?config.exchange.mode,
        policy = ?config.exchange.policy,
        interval_ms = config.exchange.interval.as_millis() as u64,
        max_frame_bytes = config.exchange.max_frame_bytes,
        reconnect = config.reconnect,
        "Starting duplex-ndjson"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(lifecycle::run(config))?;

    info!("Stopped");
    Ok(())
}
