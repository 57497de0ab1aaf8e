//! intercept-proxy binary.
//!
//! Runs the proxy engine with identity hooks: every request is forwarded
//! untouched and CONNECT tunnels are terminated with the configured (or
//! built-in localhost) identity. Useful for trying the engine out and as a
//! template for embedding.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use intercept_proxy::config::{load_config, ProxyConfig};
use intercept_proxy::lifecycle::wait_for_signal;
use intercept_proxy::observability::{logging, metrics};
use intercept_proxy::{Proxy, ProxyEvent, ProxyHooks};

/// Grace period for in-flight connections after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "intercept-proxy")]
#[command(about = "Intercepting HTTP/HTTPS forwarding proxy", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability)?;
    tracing::info!("intercept-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let bind: SocketAddr = config.listener.bind_address.parse()?;
    let proxy = Proxy::new(config, ProxyHooks::default())?;
    proxy.subscribe(|event| match event {
        ProxyEvent::Request(request) => {
            tracing::info!(method = %request.method, target = %request.target, "Request");
        }
        ProxyEvent::Connection(decrypted) => {
            tracing::info!(authority = %decrypted.authority, "Tunnel decrypted");
        }
        ProxyEvent::Error { error, context } => {
            tracing::warn!(%context, error = %error, "Proxy error");
        }
        _ => {}
    });

    let local_addr = proxy.listen(bind).await?;
    tracing::info!(address = %local_addr, "Listening for connections");

    wait_for_signal().await;

    proxy.close().await;
    if !proxy.wait_until_idle(DRAIN_TIMEOUT).await {
        tracing::warn!(
            remaining = proxy.active_connections(),
            "Drain timeout reached, closing remaining connections"
        );
        proxy.close_all_connections();
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
