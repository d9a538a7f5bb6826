//! # Huddle Relay
//!
//! Development relay that serves the Huddle data store and change feed to
//! WebSocket clients from process memory.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! huddle-relay
//!
//! # Listen on all interfaces
//! HUDDLE_HOST=0.0.0.0 HUDDLE_PORT=8080 huddle-relay
//! ```
//!
//! A `huddle-relay.toml` in the working directory, `/etc/huddle/relay.toml`
//! or `~/.config/huddle/relay.toml` is picked up when present.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle_relay=debug,huddle_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Huddle relay on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
