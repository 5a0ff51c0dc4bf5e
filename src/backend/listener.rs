//! Bridge Binding (C3, §4.3): binds the endpoint the front-end dials to
//! reach the backend, accepts connections, and spawns one
//! [`crate::backend::exchange::run_connection`] task per accepted
//! connection. No global connection limit is enforced here; that policy
//! lives in the embedding application, not in this crate (§4.3).

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tracing::warn;

use crate::backend::dispatch::Handler;
use crate::backend::exchange;
use crate::config::BackendKind;
use crate::wire::ProtocolVersion;

/// Grace period given to in-flight connections after a shutdown signal
/// before their tasks are aborted outright (§5, §7 "graceful shutdown").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Published to the front-end at start-up (§6): exactly one of
/// `(host, port)` or `path` is meaningful, selected by `kind`.
#[derive(Debug, Clone)]
pub struct BridgeEndpointInfo {
    pub kind: BackendKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
}

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

enum AcceptedConnection {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AcceptedConnection {
    async fn run<H: Handler>(self, handler: Arc<H>, version: ProtocolVersion) {
        match self {
            AcceptedConnection::Tcp(stream) => exchange::run_connection(stream, handler, version).await,
            #[cfg(unix)]
            AcceptedConnection::Unix(stream) => exchange::run_connection(stream, handler, version).await,
        }
    }
}

/// The bound bridge endpoint (C3). Binds a process-private `AF_UNIX` socket
/// on POSIX, falling back to loopback TCP with an OS-chosen port on bind
/// failure or on non-Unix platforms (§4.3, §7 "Bridge bind failure").
pub struct BridgeListener {
    acceptor: Acceptor,
}

impl BridgeListener {
    pub async fn bind() -> io::Result<Self> {
        #[cfg(unix)]
        {
            match Self::bind_unix().await {
                Ok(listener) => return Ok(listener),
                Err(error) => {
                    warn!(%error, "unix bridge bind failed, falling back to loopback tcp");
                }
            }
        }
        Self::bind_tcp().await
    }

    #[cfg(unix)]
    async fn bind_unix() -> io::Result<Self> {
        let path = std::env::temp_dir().join(format!("bridge-transport-{}.sock", std::process::id()));
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self {
            acceptor: Acceptor::Unix(listener, path),
        })
    }

    pub(crate) async fn bind_tcp() -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        Ok(Self {
            acceptor: Acceptor::Tcp(listener),
        })
    }

    /// Info to publish to the front-end (§6).
    pub fn info(&self) -> BridgeEndpointInfo {
        match &self.acceptor {
            Acceptor::Tcp(listener) => {
                let addr = listener
                    .local_addr()
                    .expect("bound tcp listener always has a local addr");
                BridgeEndpointInfo {
                    kind: BackendKind::Tcp,
                    host: Some(addr.ip().to_string()),
                    port: Some(addr.port()),
                    path: None,
                }
            }
            #[cfg(unix)]
            Acceptor::Unix(_, path) => BridgeEndpointInfo {
                kind: BackendKind::Unix,
                host: None,
                port: None,
                path: Some(path.clone()),
            },
        }
    }

    async fn accept_one(&self) -> io::Result<AcceptedConnection> {
        match &self.acceptor {
            Acceptor::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(AcceptedConnection::Tcp(stream))
            }
            #[cfg(unix)]
            Acceptor::Unix(listener, _) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(AcceptedConnection::Unix(stream))
            }
        }
    }

    /// Accepts connections until `shutdown` resolves, spawning one
    /// dispatch task per accepted connection, then waits up to
    /// [`SHUTDOWN_GRACE`] for in-flight connections to finish on their own
    /// before aborting whatever remains (§5, §7).
    pub async fn serve<H: Handler>(self, handler: Arc<H>, version: ProtocolVersion, mut shutdown: oneshot::Receiver<()>) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.accept_one() => {
                    match accepted {
                        Ok(connection) => {
                            let handler = Arc::clone(&handler);
                            tasks.spawn(connection.run(handler, version));
                        }
                        Err(error) => warn!(%error, "bridge accept failed"),
                    }
                }
            }
        }

        drop(self);

        if time::timeout(SHUTDOWN_GRACE, drain(&mut tasks)).await.is_err() {
            warn!("bridge connections did not drain within the shutdown grace period; aborting the rest");
            tasks.shutdown().await;
        }
    }
}

impl Drop for BridgeListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Acceptor::Unix(_, path) = &self.acceptor {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dispatch::{BridgeRequest, Handler};
    use crate::response::HandlerResponse;
    use crate::{frame, wire};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration as StdDuration;

    struct PongHandler;

    #[async_trait]
    impl Handler for PongHandler {
        async fn handle(&self, _request: BridgeRequest) -> HandlerResponse {
            HandlerResponse::Buffered {
                status: 200,
                headers: Vec::new(),
                body: Bytes::from_static(b"pong"),
            }
        }
    }

    #[tokio::test]
    async fn binds_and_serves_a_single_round_trip() {
        let listener = BridgeListener::bind_tcp().await.unwrap();
        let info = listener.info();
        assert_eq!(info.kind, BackendKind::Tcp);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handler = Arc::new(PongHandler);
        let serve = tokio::spawn(listener.serve(handler, ProtocolVersion::V2, shutdown_rx));

        let mut stream = tokio::net::TcpStream::connect((info.host.unwrap().as_str(), info.port.unwrap()))
            .await
            .unwrap();

        let request = wire::encode_request_full(
            ProtocolVersion::V2,
            "GET",
            "http",
            "h",
            "/ping",
            "",
            "1.1",
            std::iter::empty(),
            b"",
        )
        .unwrap();
        frame::write_frame(&mut stream, &request).await.unwrap();
        let response_payload = frame::read_frame(&mut stream).await.unwrap().unwrap();
        let (_, _, head) = wire::decode_response_head(&response_payload).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.inline_body, Some(&b"pong"[..]));

        let _ = shutdown_tx.send(());
        let _ = time::timeout(StdDuration::from_secs(1), serve).await;
    }
}
