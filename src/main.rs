//! tandem-proxy binary.
//!
//! ```text
//!     Client ──▶ listener ──▶ negotiator ──▶ dispatcher ──▶ route table
//!                                                             │
//!                                                             ▼
//!     Client ◀── upstream session ◀═══ commands ═══▶ downstream session ──▶ Backend
//!                      ▲                                      │
//!                      └──── backend throttle gate ◀──────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use tandem_proxy::config::{load_config, watcher::ConfigWatcher};
use tandem_proxy::lifecycle::{signals, Shutdown};
use tandem_proxy::observability::{logging, metrics};
use tandem_proxy::routing::RouteTable;
use tandem_proxy::load_balancer::BackendRegistry;
use tandem_proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "tandem-proxy")]
#[command(about = "Reverse proxy with symmetric backpressure", long_about = None)]
struct Cli {
    /// Configuration file (TOML, or JSON with a `.json` extension).
    #[arg(short, long, default_value = "proxy.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if cli.check {
        let registry = BackendRegistry::new(std::time::Duration::from_secs(
            config.health_check.passive_cooldown_secs,
        ));
        let (table, errors) = RouteTable::build(&config, &registry, None);
        for error in &errors {
            eprintln!("error: {error}");
        }
        if !errors.is_empty() {
            return Err(format!("{} configuration error(s)", errors.len()).into());
        }
        println!(
            "configuration OK: {} route(s), {} backend(s)",
            table.routes().len(),
            registry.len()
        );
        return Ok(());
    }

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?cli.config, "tandem-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut server = ProxyServer::new(config)?;
    server.start().await?;

    let (watcher, updates) = ConfigWatcher::new(&cli.config);
    // dropping the notify handle stops the watch
    let _watch = match watcher.run() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
            None
        }
    };

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let signal = signals::wait().await;
            tracing::info!(signal, "Shutdown signal received");
            shutdown.trigger();
        });
    }

    server.run(updates, shutdown).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
