//! emptyendpoints-dns binary entry point.

use clap::Parser;
use emptyendpoints_dns::{telemetry, Config, DnsProxy};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// DNS proxy that counts queries for Kubernetes services with no ready endpoints.
#[derive(Parser, Debug)]
#[command(name = "emptyendpoints-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "emptyendpoints-dns.toml")]
    config: PathBuf,

    /// Namespace to watch; repeat for several. Replaces the configured list.
    #[arg(short, long = "namespace")]
    namespaces: Vec<String>,
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    let _ = ctrl_c.await;

    info!("Shutdown signal received");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(&args.config)?;

    if !args.namespaces.is_empty() {
        config.detection.namespaces = args.namespaces;
    }

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        upstream_addr = %config.dns.upstream_addr,
        mode = ?config.detection.mode,
        "Starting emptyendpoints-dns"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let proxy = DnsProxy::new(config);
    let result = proxy.run(shutdown).await;

    telemetry::shutdown();

    if let Err(e) = result {
        error!("DNS proxy error: {}", e);
        return Err(e.into());
    }

    info!("emptyendpoints-dns shutdown complete");
    Ok(())
}
