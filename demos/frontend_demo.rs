//! Demo front-end: terminates HTTP on `--port` and forwards every request
//! across the bridge to a backend started separately (`backend_echo`).
//!
//! ```text
//! cargo run --example backend_echo
//! cargo run --example frontend_demo -- --port 8080 --backend-host 127.0.0.1 --backend-port 45231
//! curl http://127.0.0.1:8080/hello
//! ```

use std::sync::Arc;

use bridge_transport::config::FrontendConfig;
use bridge_transport::frontend::bridge_client::{BridgePool, BridgeTarget};
use bridge_transport::wire::ProtocolVersion;
use clap::Parser;
use tokio::sync::oneshot;

#[derive(Parser)]
#[command(name = "frontend_demo", about = "Demo HTTP front-end for the bridge transport", version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Backend bridge host (TCP mode).
    #[arg(long)]
    backend_host: Option<String>,

    /// Backend bridge port (TCP mode).
    #[arg(long)]
    backend_port: Option<u16>,

    /// Backend bridge unix socket path, as an alternative to host/port.
    #[cfg(unix)]
    #[arg(long)]
    backend_path: Option<std::path::PathBuf>,

    /// Wire protocol version to speak to the backend (1 or 2).
    #[arg(long, default_value = "2")]
    protocol_version: u8,

    /// Maximum idle bridge connections to keep pooled.
    #[arg(long, default_value = "4")]
    max_idle: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    #[cfg(unix)]
    let target = match (&cli.backend_path, &cli.backend_host, cli.backend_port) {
        (Some(path), _, _) => BridgeTarget::Unix(path.clone()),
        (None, Some(host), Some(port)) => BridgeTarget::Tcp { host: host.clone(), port },
        _ => anyhow::bail!("either --backend-path or both --backend-host and --backend-port are required"),
    };
    #[cfg(not(unix))]
    let target = match (&cli.backend_host, cli.backend_port) {
        (Some(host), Some(port)) => BridgeTarget::Tcp { host: host.clone(), port },
        _ => anyhow::bail!("--backend-host and --backend-port are required"),
    };

    let version = match cli.protocol_version {
        1 => ProtocolVersion::V1,
        _ => ProtocolVersion::V2,
    };

    let pool = Arc::new(BridgePool::new(target, cli.max_idle));
    let config = FrontendConfig {
        host: cli.host.clone(),
        port: cli.port,
        ..FrontendConfig::default()
    };

    println!("frontend_demo: listening on {}:{}", cli.host, cli.port);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    bridge_transport::frontend::serve(config, pool, version, shutdown_rx).await?;
    Ok(())
}
