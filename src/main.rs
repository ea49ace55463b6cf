//! ARXON core daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!                    │                  AppContext                  │
//!                    │                                              │
//!   status API ─────▶│  CircuitBreaker ◀── GuardedClient ───────────┼──▶ backend origin
//!   (axum)           │                          ▲                   │
//!                    │                          │                   │
//!                    │              SwrCache + RequestDeduplicator  │
//!                    │                         │                    │
//!                    │                   KeyValueStore              │
//!                    │                                              │
//!   recovery ───────▶│  RecoveryResolver ──▶ HttpAuthProvider       │
//!                    └──────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use arxon_core::config::{load_config, AppConfig};
use arxon_core::lifecycle::{shutdown_on_signal, Shutdown};
use arxon_core::observability::{logging, metrics};
use arxon_core::{status, AppContext};

#[derive(Parser)]
#[command(name = "arxon")]
#[command(about = "ARXON client core: circuit health, cache and status API", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "arxon starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.status.bind_address).await?;
    let context = Arc::new(AppContext::from_config(config)?);
    let shutdown = Shutdown::new();

    let server = tokio::spawn(status::serve(listener, context.clone(), shutdown.subscribe()));

    shutdown_on_signal(&shutdown).await;

    server.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}
