//! Front-end half of the bridge: a native HTTP listener that accepts
//! inbound HTTP/1.1, HTTP/2, and optional HTTP/3 traffic, translates each
//! request into bridge frames via [`bridge_client`], and relays the bridge
//! response back to the network client (§1 "Transport", §4.2, §4.4).

pub mod bridge_client;
pub mod tls;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes, HttpBody};
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode, Version};
use axum::routing::any;
use axum::Router;
use hyper::server::conn::http1;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::config::FrontendConfig;
use crate::error::BridgeError;
use crate::frontend::bridge_client::{BridgeCallResult, BridgePool, OutboundRequest};
use crate::tunnel::DetachedSocket;
use crate::wire::ProtocolVersion;

#[derive(Clone)]
struct AppState {
    bridge_pool: Arc<BridgePool>,
    version: ProtocolVersion,
}

/// Builds the axum application that forwards every request across the
/// bridge; the only route is a catch-all fallback, mirroring a transparent
/// proxy rather than a conventional REST surface.
fn build_router(bridge_pool: Arc<BridgePool>, version: ProtocolVersion) -> Router {
    let state = AppState { bridge_pool, version };
    Router::new().fallback(any(proxy_request)).with_state(state)
}

/// Binds the listening socket for `config` using the same socket2 knobs the
/// rest of the ecosystem reaches for: `SO_REUSEADDR`/`SO_REUSEPORT` when
/// `shared` is requested, `IPV6_V6ONLY` control, and an explicit backlog.
async fn bind_listener(config: &FrontendConfig) -> io::Result<TcpListener> {
    let mut resolved = tokio::net::lookup_host((config.host.as_str(), config.port)).await?;
    let mut last_error: Option<io::Error> = None;
    while let Some(addr) = resolved.next() {
        match bind_listener_addr(addr, config.backlog, config.v6_only, config.shared) {
            Ok(listener) => return Ok(listener),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved addresses")))
}

fn bind_listener_addr(addr: SocketAddr, backlog: u32, v6_only: bool, shared: bool) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(v6_only)?;
    }
    if shared {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }

    socket.bind(&addr.into())?;
    let backlog = if backlog == 0 { 1024 } else { backlog.min(i32::MAX as u32) };
    socket.listen(backlog as i32)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(std::net::TcpListener::from(socket))
}

/// Runs the front-end listener to completion: binds per `config`, serves
/// HTTP/1.1 always and HTTP/2 when enabled, TLS (plus optional HTTP/3) when
/// `config.tls()` is set, until `shutdown` resolves (§5, §6, §7).
pub async fn serve(
    config: FrontendConfig,
    bridge_pool: Arc<BridgePool>,
    version: ProtocolVersion,
    shutdown: oneshot::Receiver<()>,
) -> Result<(), BridgeError> {
    let listener = bind_listener(&config).await.map_err(|source| BridgeError::BindFailed {
        endpoint: format!("{}:{}", config.host, config.port),
        source,
    })?;
    let app = build_router(bridge_pool, version);

    match config.tls() {
        Some(tls) => {
            run_tls(listener, app, shutdown, &tls, config.enable_http2, config.enable_http3, config.request_client_certificate).await
        }
        None => run_plain(listener, app, shutdown, config.enable_http2).await,
    }
}

async fn run_plain(
    listener: TcpListener,
    app: Router,
    mut shutdown: oneshot::Receiver<()>,
    enable_http2: bool,
) -> Result<(), BridgeError> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(value) => value,
                    Err(error) => {
                        warn!(%error, "plain accept failed");
                        continue;
                    }
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, "set_nodelay failed");
                }
                let app = app.clone();
                connections.spawn(async move { serve_connection(TokioIo::new(stream), app, enable_http2).await });
            }
        }
    }
    drain(&mut connections).await;
    Ok(())
}

async fn run_tls(
    listener: TcpListener,
    app: Router,
    mut shutdown: oneshot::Receiver<()>,
    tls_config: &crate::config::TlsConfig<'_>,
    enable_http2: bool,
    enable_http3: bool,
    request_client_certificate: bool,
) -> Result<(), BridgeError> {
    tls::ensure_rustls_crypto_provider()?;
    let server_config = tls::load_tls_server_config(tls_config, enable_http2, request_client_certificate)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let mut connections = JoinSet::new();
    let local_addr = listener.local_addr().map_err(BridgeError::Io)?;

    let h3_endpoint = if enable_http3 {
        match tls::create_h3_endpoint(local_addr, tls_config, request_client_certificate) {
            Ok(endpoint) => Some(endpoint),
            Err(error) => {
                warn!(%error, "http3 setup failed; continuing with tls http1/http2 only");
                None
            }
        }
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(value) => value,
                    Err(error) => {
                        warn!(%error, "tls accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                connections.spawn(async move {
                    let tls_stream = acceptor.accept(stream).await?;
                    serve_connection(TokioIo::new(tls_stream), app, enable_http2).await
                });
            }
            incoming = accept_h3(h3_endpoint.as_ref()) => {
                let Some(incoming) = incoming else {
                    continue;
                };
                let app = app.clone();
                connections.spawn(async move { tls::handle_h3_connection(incoming, app).await });
            }
        }
    }

    if let Some(endpoint) = h3_endpoint {
        endpoint.close(0_u32.into(), b"shutdown");
    }
    drain(&mut connections).await;
    Ok(())
}

/// `select!`-friendly wrapper: `None` forever when HTTP/3 is disabled, so
/// the branch never fires instead of needing a second loop shape.
async fn accept_h3(endpoint: Option<&quinn::Endpoint>) -> Option<quinn::Incoming> {
    match endpoint {
        Some(endpoint) => endpoint.accept().await,
        None => std::future::pending().await,
    }
}

async fn serve_connection<S>(io: TokioIo<S>, app: Router, enable_http2: bool) -> Result<(), BridgeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(app);
    let result = if enable_http2 {
        AutoBuilder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
    } else {
        http1::Builder::new().serve_connection(io, service).with_upgrades().await
    };
    result.map_err(|error| BridgeError::Tunnel(format!("connection serve failed: {error}")))
}

async fn drain(tasks: &mut JoinSet<Result<(), BridgeError>>) {
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "front-end connection error"),
            Err(error) => warn!(%error, "front-end connection task panicked"),
        }
    }
}

/// Axum fallback handler: forwards every request across the bridge and, on
/// a 101 response to a websocket/CONNECT upgrade request, hands the hyper
/// upgrade off to [`crate::tunnel::run_tunnel`] (§4.4).
async fn proxy_request(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    let (mut parts, body) = request.into_parts();
    let websocket_upgrade_requested = is_websocket_upgrade(&parts.headers);
    let mut upgrade = if websocket_upgrade_requested {
        parts.extensions.remove::<OnUpgrade>()
    } else {
        None
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let (path, query) = split_path_and_query(path_and_query);

    let authority = parts
        .headers
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let scheme = parts.uri.scheme_str().unwrap_or("http");
    let protocol = http_version_to_protocol(parts.version);

    let headers: Vec<(&str, &str)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)))
        .collect();

    let request = OutboundRequest {
        method: parts.method.as_str(),
        scheme,
        authority,
        path,
        query,
        protocol,
        headers,
    };

    let request_body_known_empty = body.size_hint().exact() == Some(0);
    let body_stream = if request_body_known_empty {
        None
    } else {
        let stream = body
            .into_data_stream()
            .map(|chunk| chunk.map_err(|error| BridgeError::HandlerFailed(error.to_string())));
        Some(Box::pin(stream) as crate::response::BoxBodyStream)
    };

    let result = match bridge_client::call_bridge(&state.bridge_pool, state.version, request, body_stream).await {
        Ok(result) => result,
        Err(error) => return text_response(StatusCode::BAD_GATEWAY, format!("bridge call failed: {error}")),
    };

    match result {
        BridgeCallResult::Response { status, headers, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            append_headers(&mut response, headers);
            response
        }
        BridgeCallResult::Detached { status, headers, connection } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            if status != StatusCode::SWITCHING_PROTOCOLS {
                return text_response(StatusCode::BAD_GATEWAY, "bridge detached on a non-101 response");
            }
            let Some(upgrade) = upgrade.take() else {
                return text_response(StatusCode::BAD_GATEWAY, "websocket upgrade failed: missing hyper upgrade handle");
            };
            let version = state.version;
            tokio::spawn(async move {
                let upgraded = match upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(error) => {
                        warn!(%error, "hyper upgrade failed");
                        return;
                    }
                };
                let io = TokioIo::new(upgraded);
                let (reader, writer) = tokio::io::split(io);
                let detached = DetachedSocket::new(Box::new(writer), Box::new(reader));
                if let Err(error) = bridge_client::run_detached_tunnel(connection, detached, version).await {
                    warn!(%error, "websocket tunnel error");
                }
            });

            let mut response = Response::new(Body::empty());
            *response.status_mut() = status;
            append_headers(&mut response, headers);
            response
        }
    }
}

fn append_headers(response: &mut Response<Body>, headers: Vec<(String, String)>) {
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            axum::http::HeaderValue::from_str(&value),
        ) else {
            continue;
        };
        response.headers_mut().append(name, value);
    }
}

fn http_version_to_protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

fn split_path_and_query(path_and_query: &str) -> (&str, &str) {
    match path_and_query.split_once('?') {
        Some((path, query)) => (path, query),
        None => (path_and_query, ""),
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade_connection = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let is_websocket = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    has_upgrade_connection && is_websocket
}

fn text_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}
