//! Demo backend: binds a bridge endpoint and serves an echo handler that
//! reflects the request method, path, and body back as the response.
//!
//! Prints the endpoint's host/port (or socket path) to stdout on a single
//! line so `frontend_demo` can be pointed at it without guessing:
//!
//! ```text
//! cargo run --example backend_echo
//! cargo run --example frontend_demo -- --backend-host 127.0.0.1 --backend-port 45231
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bridge_transport::backend::{BridgeListener, BridgeRequest, Handler};
use bridge_transport::config::BackendKind;
use bridge_transport::response::HandlerResponse;
use bridge_transport::wire::ProtocolVersion;
use bytes::{Bytes, BytesMut};
use clap::Parser;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;

#[derive(Parser)]
#[command(name = "backend_echo", about = "Demo bridge backend that echoes requests", version)]
struct Cli {
    /// Wire protocol version to speak (1 or 2).
    #[arg(long, default_value = "2")]
    protocol_version: u8,
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, request: BridgeRequest) -> HandlerResponse {
        let mut direct = request.into_direct();
        let method = direct.method().unwrap_or("?").to_string();
        let path = direct.path().unwrap_or("/").to_string();

        let mut body = BytesMut::new();
        let mut chunks = direct.take_body_stream();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(error) => {
                    return HandlerResponse::Buffered {
                        status: 400,
                        headers: Vec::new(),
                        body: Bytes::from(format!("error reading request body: {error}")),
                    };
                }
            }
        }

        let mut reply = format!("{method} {path}\n").into_bytes();
        reply.extend_from_slice(&body);

        HandlerResponse::Buffered {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from(reply),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let version = match cli.protocol_version {
        1 => ProtocolVersion::V1,
        _ => ProtocolVersion::V2,
    };

    let listener = BridgeListener::bind().await?;
    let info = listener.info();
    match info.kind {
        BackendKind::Tcp => println!(
            "backend_echo: listening host={} port={}",
            info.host.as_deref().unwrap_or("?"),
            info.port.unwrap_or(0)
        ),
        BackendKind::Unix => println!(
            "backend_echo: listening path={}",
            info.path.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
        ),
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    listener.serve(Arc::new(EchoHandler), version, shutdown_rx).await;
    Ok(())
}
