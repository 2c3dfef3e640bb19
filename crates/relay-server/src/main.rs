//! # CHORD Event Relay
//!
//! Rebroadcasts every Redis message matching a channel pattern to all
//! connected WebSocket clients.
//!
//! ## Transport
//!
//! The endpoint at `{base_path}{socket_io_path}` speaks plain WebSocket, not
//! socket.io. There is no Engine.IO handshake, polling transport or packet
//! framing, so stock socket.io clients cannot connect. Open a WebSocket and
//! read one text frame per event:
//!
//! ```text
//! {"event":"events","data":{"message":{"ok":true},"channel":"chord.service.x"}}
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (port 8080, pattern chord.*)
//! chord-relay
//!
//! # Run with a config file
//! chord-relay --config /path/to/chord-relay.toml
//!
//! # Run on a Unix socket with passthrough payloads
//! SERVICE_SOCKET=/tmp/event-relay.sock JSON_MESSAGES=false chord-relay
//! ```

mod config;
mod handlers;
mod lifecycle;
mod listener;
mod metrics;
mod relay;
mod service_info;

use anyhow::{Context, Result};
use chord_relay_bus::RedisBus;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments for the event relay.
#[derive(Parser, Debug)]
#[command(name = "chord-relay")]
#[command(about = "CHORD event relay: Redis pattern subscription over WebSocket")]
#[command(version)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, short, env = "CHORD_RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chord_relay=info,chord_relay_server=info,chord_relay_core=info,chord_relay_bus=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let config = config::Config::resolve(args.config.as_deref(), |key| std::env::var(key).ok())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_on = %config.listen_on,
        pattern = %config.bus.pattern,
        json_messages = config.json_messages,
        "Starting CHORD event relay"
    );

    if config.metrics.enabled {
        metrics::init_metrics();
        metrics::start_metrics_server(config.metrics.port)
            .map_err(|e| anyhow::anyhow!("Failed to start metrics server: {e}"))?;
    }

    let bus = RedisBus::open(&config.bus.url)?
        .with_connect_timeout(Duration::from_millis(config.bus.connect_timeout_ms));

    let relay = relay::Relay::new(config, Arc::new(bus))
        .start()
        .await
        .context("Failed to start relay")?;

    tracing::info!(addr = %relay.local_addr(), state = ?relay.state(), "Relay ready");

    relay.run_until_signal().await?;

    Ok(())
}
