//! Rendezvous relay server (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────────────────────────────────────────────┐
//!                 │                   RELAY SERVER                    │
//!                 │                                                   │
//!   ws / wss  ────┼─▶ WsListener ──┐                                  │
//!                 │                ├─ AcceptFn ─▶ Relay ─▶ Registry   │
//!   udp  ─────────┼─▶ UdpListener ─┘                │                 │
//!                 │                                 ▼                 │
//!                 │                      Session (A ⇄ B forwarding)   │
//!                 │                                                   │
//!                 │   config · observability · lifecycle (shutdown)   │
//!                 └───────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use relay_server::config::{load_config, validate_config, ConfigError, ServerConfig, TlsConfig};
use relay_server::lifecycle::{shutdown_signal, Server};
use relay_server::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about = "Rendezvous relay for peers behind NAT")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address shared by every listener (overrides the file).
    #[arg(long)]
    address: Option<String>,

    /// PEM certificate chain for the websocket listener.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    /// PEM private key for the websocket listener.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

fn resolve_config(args: &Args) -> Result<ServerConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    if let Some(address) = &args.address {
        config.listener.address = address.clone();
    }
    if let (Some(cert_path), Some(key_path)) = (&args.tls_cert, &args.tls_key) {
        config.listener.tls = Some(TlsConfig {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        });
    }
    if let Some(level) = &args.log_level {
        config.observability.log_level = level.clone();
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = resolve_config(&args)?;

    logging::init_logging(&config.observability);

    tracing::info!("relay-server v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        address = %config.listener.address,
        tls = config.listener.tls.is_some(),
        busy_policy = ?config.relay.busy_policy,
        drain_timeout_secs = config.shutdown.drain_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let mut server = Server::new(config);
    if let Err(e) = server.listen().await {
        if server.listeners().is_empty() {
            tracing::error!(error = %e, "No listener could be started");
            return Err(e.into());
        }
        tracing::warn!(error = %e, "Running with a subset of listeners");
    }

    shutdown_signal().await;
    tracing::info!("Shutting down");

    tokio::select! {
        result = server.close() => match result {
            Ok(report) => tracing::info!(
                sessions = report.sessions,
                forced = report.forced,
                "Shutdown complete"
            ),
            Err(e) => {
                tracing::error!(error = %e, "Shutdown finished with errors");
                return Err(e.into());
            }
        },
        _ = shutdown_signal() => {
            tracing::warn!("Second signal received, exiting immediately");
            std::process::exit(1);
        }
    }

    Ok(())
}
