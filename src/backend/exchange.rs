//! Per-connection state machine (C4, §4.4): sequences at most one in-flight
//! exchange per bridge connection, enforces body size ceilings, synthesizes
//! error responses while it is still safe to do so, and hands off to
//! [`crate::tunnel`] when a handler detaches the socket.

use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::backend::dispatch::{BridgeRequest, DirectRequest, Handler};
use crate::error::{BridgeError, FramingError};
use crate::frame::{self, MAX_BODY_BYTES};
use crate::request::RequestView;
use crate::response::{self, HandlerResponse};
use crate::tunnel::{self, DetachedSocket};
use crate::wire::{self, FrameType, ProtocolVersion};

/// Shared body byte counter enforcing the per-exchange, per-direction
/// ceiling (§3, §7, §8 scenario 5).
pub struct BodyLimiter {
    counted: usize,
    limit: usize,
}

impl BodyLimiter {
    pub fn new(limit: usize) -> Self {
        Self { counted: 0, limit }
    }

    pub fn add(&mut self, additional: usize) -> Result<(), BridgeError> {
        self.counted = self.counted.saturating_add(additional);
        if self.counted > self.limit {
            return Err(BridgeError::BodyTooLarge {
                limit: self.limit,
                attempted: self.counted,
            });
        }
        Ok(())
    }
}

/// Where a bridge connection currently is (§4.4).
enum ExchangeOutcome<S> {
    /// Connection parked back in IDLE, ready for the next exchange.
    Idle(S),
    /// Handler detached the socket; caller transitions to TUNNEL.
    Detach(DetachedSocket, S),
    /// Clean EOF observed at a frame boundary.
    Eof,
    /// A synthetic response was sent but the connection can't be resumed
    /// (the body pump's reader half was lost mid-stream, §7 body overflow).
    Closed,
}

/// Drives one bridge connection end to end: IDLE -> EXCHANGE (repeated) ->
/// optionally TUNNEL, until the connection closes (§4.4).
pub async fn run_connection<S, H>(mut stream: S, handler: Arc<H>, version: ProtocolVersion)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    loop {
        match run_exchange(stream, &handler, version).await {
            Ok(ExchangeOutcome::Idle(next)) => {
                stream = next;
            }
            Ok(ExchangeOutcome::Detach(socket, bridge)) => {
                if let Err(error) = tunnel::run_tunnel(socket, bridge, version).await {
                    warn!(%error, "tunnel forwarding ended with an error");
                }
                return;
            }
            Ok(ExchangeOutcome::Eof) => return,
            Ok(ExchangeOutcome::Closed) => return,
            Err(error) => {
                warn!(%error, "bridge connection closed after an unrecoverable exchange error");
                return;
            }
        }
    }
}

async fn run_exchange<S, H>(
    mut stream: S,
    handler: &Arc<H>,
    version: ProtocolVersion,
) -> Result<ExchangeOutcome<S>, BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let head_payload = match frame::read_frame(&mut stream).await? {
        Some(payload) => payload,
        None => return Ok(ExchangeOutcome::Eof),
    };
    let frame_type = wire::peek_frame_type(&head_payload)?;
    let payload = Bytes::from(head_payload);

    match frame_type {
        FrameType::ReqFull => run_unary_exchange(stream, payload, handler, version).await,
        FrameType::ReqStart => run_streaming_exchange(stream, payload, handler, version).await,
        other => Err(BridgeError::Framing(FramingError::UnexpectedFrameType {
            expected: "REQ_FULL or REQ_START",
            got: other as u8,
        })),
    }
}

async fn run_unary_exchange<S, H>(
    mut stream: S,
    payload: Bytes,
    handler: &Arc<H>,
    version: ProtocolVersion,
) -> Result<ExchangeOutcome<S>, BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let inline_body_len = match wire::decode_request_head(&payload) {
        Ok((_, _, head)) => head.inline_body.map(|body| body.len()).unwrap_or(0),
        Err(error) => {
            write_response(&mut stream, response::synthetic_400(format!("invalid bridge request: {error}")), version).await?;
            return Ok(ExchangeOutcome::Idle(stream));
        }
    };
    if inline_body_len > MAX_BODY_BYTES {
        let error = BridgeError::BodyTooLarge {
            limit: MAX_BODY_BYTES,
            attempted: inline_body_len,
        };
        write_response(&mut stream, response::synthetic_400(format!("invalid bridge request: {error}")), version).await?;
        return Ok(ExchangeOutcome::Idle(stream));
    }

    let request = BridgeRequest::Direct(DirectRequest::new(RequestView::from_payload(payload)));
    let handler_response = invoke_handler(handler, request).await;
    match write_response(&mut stream, handler_response, version).await? {
        DispatchOutcome::Idle => Ok(ExchangeOutcome::Idle(stream)),
        DispatchOutcome::Detach(socket) => Ok(ExchangeOutcome::Detach(socket, stream)),
    }
}

async fn run_streaming_exchange<S, H>(
    stream: S,
    payload: Bytes,
    handler: &Arc<H>,
    version: ProtocolVersion,
) -> Result<ExchangeOutcome<S>, BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    if let Err(error) = wire::decode_request_head(&payload) {
        let mut stream = stream;
        write_response(&mut stream, response::synthetic_400(format!("invalid bridge request: {error}")), version).await?;
        return Ok(ExchangeOutcome::Idle(stream));
    }

    let (reader, mut writer) = tokio::io::split(stream);
    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, BridgeError>>(1);
    // Set synchronously, before the failing frame is even offered to the
    // handler's body stream, so checking it after `invoke_handler` returns
    // is race-free: the handler can only have observed the failure (and so
    // only could have returned) after this was written (§7, §8 scenario 5).
    let head_not_sent_error: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
    let body_task = tokio::spawn(pump_request_body(reader, body_tx, Arc::clone(&head_not_sent_error)));

    let body_stream = Box::pin(ReceiverStream::new(body_rx));
    let request = BridgeRequest::Direct(DirectRequest::new_streaming(
        RequestView::from_payload(payload),
        body_stream,
    ));
    let handler_response = invoke_handler(handler, request).await;

    // If the body pump failed with an error recoverable before a response
    // head goes out, that happened strictly before the handler could have
    // returned: answer with a synthetic 400 instead of the handler's own
    // response (§7, §8 scenario 5). A handler that responds early without
    // draining the body (§8 scenario 3) never observes such a failure here;
    // if the pump fails afterwards it's handled below like any other
    // post-head-sent error.
    if let Some(message) = head_not_sent_error.lock().unwrap().take() {
        write_response(&mut writer, response::synthetic_400(format!("invalid bridge request: {message}")), version).await?;
        // The pump's reader half was dropped on its error path, so there is
        // nothing left to `unsplit` back into a reusable stream.
        return Ok(ExchangeOutcome::Closed);
    }

    let dispatch_result = write_response(&mut writer, handler_response, version).await;

    // Always wait for the body pump to finish so REQ_END is consumed even if
    // the handler never read the body (§7, §8 scenario 3).
    let reader = match body_task.await {
        Ok(Ok(reader)) => reader,
        Ok(Err(error)) => return Err(error),
        Err(join_error) => {
            return Err(BridgeError::HandlerFailed(format!(
                "request body pump task failed: {join_error}"
            )))
        }
    };

    let outcome = dispatch_result?;
    let stream = reader.unsplit(writer);
    match outcome {
        DispatchOutcome::Idle => Ok(ExchangeOutcome::Idle(stream)),
        DispatchOutcome::Detach(socket) => Ok(ExchangeOutcome::Detach(socket, stream)),
    }
}

/// Reads REQ_CHUNK/REQ_END frames off `reader`, forwarding chunks to `tx`.
/// Keeps draining even after the receiver is dropped, so a handler that
/// stops reading the body early never deadlocks the connection (§8 scenario
/// 3 "early 401").
async fn pump_request_body<R>(
    mut reader: ReadHalf<R>,
    tx: mpsc::Sender<Result<Bytes, BridgeError>>,
    head_not_sent_error: Arc<StdMutex<Option<String>>>,
) -> Result<ReadHalf<R>, BridgeError>
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    // Records `error` for the exchange driver, strictly before the handler
    // can have observed it through `tx`, then forwards it and returns.
    async fn fail(
        tx: &mpsc::Sender<Result<Bytes, BridgeError>>,
        head_not_sent_error: &StdMutex<Option<String>>,
        error: BridgeError,
    ) -> BridgeError {
        if error.is_recoverable_before_response_head() {
            *head_not_sent_error.lock().unwrap() = Some(error.to_string());
        }
        let _ = tx.send(Err(BridgeError::HandlerFailed(error.to_string()))).await;
        error
    }

    let mut limiter = BodyLimiter::new(MAX_BODY_BYTES);
    loop {
        let payload = match frame::read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                let error = BridgeError::Framing(FramingError::TruncatedFrame);
                return Err(fail(&tx, &head_not_sent_error, error).await);
            }
            Err(error) => return Err(fail(&tx, &head_not_sent_error, error).await),
        };

        let frame_type = match wire::peek_frame_type(&payload) {
            Ok(frame_type) => frame_type,
            Err(error) => return Err(fail(&tx, &head_not_sent_error, error.into()).await),
        };

        match frame_type {
            FrameType::ReqChunk => {
                let chunk = match wire::decode_chunk(&payload, FrameType::ReqChunk) {
                    Ok(chunk) => chunk,
                    Err(error) => return Err(fail(&tx, &head_not_sent_error, error.into()).await),
                };
                if let Err(error) = limiter.add(chunk.len()) {
                    return Err(fail(&tx, &head_not_sent_error, error).await);
                }
                if !chunk.is_empty() {
                    // Ignore send failures: the handler dropped its body
                    // stream, but the frame must still be drained.
                    let _ = tx.send(Ok(Bytes::copy_from_slice(chunk))).await;
                }
            }
            FrameType::ReqEnd => {
                if let Err(error) = wire::decode_end(&payload, FrameType::ReqEnd) {
                    return Err(fail(&tx, &head_not_sent_error, error.into()).await);
                }
                return Ok(reader);
            }
            _other => {
                let error = BridgeError::Framing(FramingError::Interleaving(
                    "expected REQ_CHUNK or REQ_END while draining a streaming request body",
                ));
                return Err(fail(&tx, &head_not_sent_error, error).await);
            }
        }
    }
}

/// Runs `handler.handle` on a detached task so a panic inside it is caught
/// as a `JoinError` instead of taking down the connection task outright,
/// and synthesizes a 500 in that case (§7 "Handler exception before
/// RESP_START").
async fn invoke_handler<H: Handler>(handler: &Arc<H>, request: BridgeRequest) -> HandlerResponse {
    let handler = Arc::clone(handler);
    match tokio::spawn(async move { handler.handle(request).await }).await {
        Ok(response) => response,
        Err(join_error) => response::synthetic_500(format!("handler panicked: {join_error}")),
    }
}

enum DispatchOutcome {
    Idle,
    Detach(DetachedSocket),
}

/// Writes a [`HandlerResponse`] to `writer` as whichever frame shape the
/// variant implies (§3 Response Assembly, §4.4).
async fn write_response<W>(
    writer: &mut W,
    response: HandlerResponse,
    version: ProtocolVersion,
) -> Result<DispatchOutcome, BridgeError>
where
    W: AsyncWrite + Unpin,
{
    match response {
        HandlerResponse::PreEncoded(pre) => {
            frame::write_frame(writer, pre.payload()).await?;
            Ok(DispatchOutcome::Idle)
        }
        HandlerResponse::Buffered { status, headers, body } => {
            let payload = wire::encode_response_full(
                version,
                status,
                headers.iter().map(|(name, value)| (name.as_str(), value.as_str())),
                &body,
            )?;
            frame::write_frame(writer, &payload).await?;
            Ok(DispatchOutcome::Idle)
        }
        HandlerResponse::Streamed { status, headers, mut body } => {
            let start = wire::encode_response_start(
                version,
                status,
                headers.iter().map(|(name, value)| (name.as_str(), value.as_str())),
            )?;
            frame::write_frame(writer, &start).await?;

            let mut limiter = BodyLimiter::new(MAX_BODY_BYTES);
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                limiter.add(chunk.len())?;
                if !chunk.is_empty() {
                    frame::write_chunk_frame(writer, version as u8, FrameType::RespChunk as u8, &chunk).await?;
                }
            }
            let end = wire::encode_response_end(version);
            frame::write_frame(writer, &end).await?;
            Ok(DispatchOutcome::Idle)
        }
        HandlerResponse::Detached { status, headers, socket } => {
            let start = wire::encode_response_start(
                version,
                status,
                headers.iter().map(|(name, value)| (name.as_str(), value.as_str())),
            )?;
            frame::write_frame(writer, &start).await?;
            let end = wire::encode_response_end(version);
            frame::write_frame(writer, &end).await?;
            Ok(DispatchOutcome::Detach(socket))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::BoxBodyStream;
    use async_trait::async_trait;
    use tokio::io::duplex;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, request: BridgeRequest) -> HandlerResponse {
            let mut direct = request.into_direct();
            let path = direct.path().unwrap_or("").to_string();
            let mut body_bytes = Vec::new();
            let mut stream = direct.take_body_stream();
            while let Some(chunk) = stream.next().await {
                body_bytes.extend_from_slice(&chunk.unwrap());
            }
            HandlerResponse::Buffered {
                status: 200,
                headers: vec![("x-path".to_string(), path)],
                body: Bytes::from(body_bytes),
            }
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl Handler for PanicHandler {
        async fn handle(&self, _request: BridgeRequest) -> HandlerResponse {
            panic!("boom");
        }
    }

    struct EarlyRejectHandler;

    #[async_trait]
    impl Handler for EarlyRejectHandler {
        async fn handle(&self, _request: BridgeRequest) -> HandlerResponse {
            HandlerResponse::Buffered {
                status: 401,
                headers: Vec::new(),
                body: Bytes::from_static(b"unauthorized"),
            }
        }
    }

    struct DetachHandler;

    #[async_trait]
    impl Handler for DetachHandler {
        async fn handle(&self, _request: BridgeRequest) -> HandlerResponse {
            let (client_side, _server_side) = duplex(64);
            let (inbound, outbound) = tokio::io::split(client_side);
            HandlerResponse::Detached {
                status: 101,
                headers: vec![("upgrade".to_string(), "websocket".to_string())],
                socket: DetachedSocket::new(Box::new(outbound), Box::new(inbound)),
            }
        }
    }

    #[tokio::test]
    async fn unary_exchange_echoes_path_and_body() {
        let (mut client, server) = duplex(8 * 1024);
        let handler = Arc::new(EchoHandler);
        tokio::spawn(run_connection(server, handler, ProtocolVersion::V2));

        let request = wire::encode_request_full(
            ProtocolVersion::V2,
            "POST",
            "http",
            "h",
            "/ping",
            "",
            "1.1",
            std::iter::empty(),
            b"hello",
        )
        .unwrap();
        frame::write_frame(&mut client, &request).await.unwrap();

        let response_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        let (_, _, head) = wire::decode_response_head(&response_payload).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.headers.find("x-path"), Some("/ping"));
        assert_eq!(head.inline_body, Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn streaming_exchange_collects_chunks() {
        let (mut client, server) = duplex(8 * 1024);
        let handler = Arc::new(EchoHandler);
        tokio::spawn(run_connection(server, handler, ProtocolVersion::V1));

        let start = wire::encode_request_start(
            ProtocolVersion::V1,
            "PUT",
            "http",
            "h",
            "/upload",
            "",
            "1.1",
            std::iter::empty(),
        )
        .unwrap();
        frame::write_frame(&mut client, &start).await.unwrap();
        frame::write_chunk_frame(&mut client, ProtocolVersion::V1 as u8, FrameType::ReqChunk as u8, b"abc").await.unwrap();
        frame::write_chunk_frame(&mut client, ProtocolVersion::V1 as u8, FrameType::ReqChunk as u8, b"def").await.unwrap();
        let end = wire::encode_request_end(ProtocolVersion::V1);
        frame::write_frame(&mut client, &end).await.unwrap();

        let response_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        let (_, _, head) = wire::decode_response_head(&response_payload).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.inline_body, Some(&b"abcdef"[..]));
    }

    #[tokio::test]
    async fn handler_panic_before_response_head_yields_synthetic_500() {
        let (mut client, server) = duplex(8 * 1024);
        let handler = Arc::new(PanicHandler);
        tokio::spawn(run_connection(server, handler, ProtocolVersion::V2));

        let request = wire::encode_request_full(
            ProtocolVersion::V2,
            "GET",
            "http",
            "h",
            "/",
            "",
            "1.1",
            std::iter::empty(),
            b"",
        )
        .unwrap();
        frame::write_frame(&mut client, &request).await.unwrap();

        let response_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        let (_, _, head) = wire::decode_response_head(&response_payload).unwrap();
        assert_eq!(head.status, 500);
    }

    #[tokio::test]
    async fn detach_handler_switches_connection_into_tunnel_mode() {
        let (mut client, server) = duplex(8 * 1024);
        let handler = Arc::new(DetachHandler);
        tokio::spawn(run_connection(server, handler, ProtocolVersion::V2));

        let request = wire::encode_request_full(
            ProtocolVersion::V2,
            "GET",
            "http",
            "h",
            "/ws",
            "",
            "1.1",
            std::iter::empty(),
            b"",
        )
        .unwrap();
        frame::write_frame(&mut client, &request).await.unwrap();

        let response_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        let (_, _, head) = wire::decode_response_head(&response_payload).unwrap();
        assert_eq!(head.status, 101);

        let end_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        wire::decode_end(&end_payload, FrameType::RespEnd).unwrap();
    }

    #[tokio::test]
    async fn early_response_drains_trailing_body_without_deadlocking_the_connection() {
        let (mut client, server) = duplex(64 * 1024);
        let handler = Arc::new(EarlyRejectHandler);
        tokio::spawn(run_connection(server, handler, ProtocolVersion::V2));

        let start = wire::encode_request_start(
            ProtocolVersion::V2,
            "POST",
            "http",
            "h",
            "/upload",
            "",
            "1.1",
            std::iter::empty(),
        )
        .unwrap();
        frame::write_frame(&mut client, &start).await.unwrap();

        let response_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        let (_, _, head) = wire::decode_response_head(&response_payload).unwrap();
        assert_eq!(head.status, 401);

        // The handler never touched the body; the connection still has to
        // drain the trailing REQ_CHUNK/REQ_END frames in the background so
        // it stays in sync for the next exchange (§8 scenario 3).
        frame::write_chunk_frame(&mut client, ProtocolVersion::V2 as u8, FrameType::ReqChunk as u8, b"ignored-body")
            .await
            .unwrap();
        let end = wire::encode_request_end(ProtocolVersion::V2);
        frame::write_frame(&mut client, &end).await.unwrap();

        let next_request = wire::encode_request_full(
            ProtocolVersion::V2,
            "GET",
            "http",
            "h",
            "/next",
            "",
            "1.1",
            std::iter::empty(),
            b"",
        )
        .unwrap();
        frame::write_frame(&mut client, &next_request).await.unwrap();

        let next_response_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        let (_, _, next_head) = wire::decode_response_head(&next_response_payload).unwrap();
        assert_eq!(next_head.status, 401);
    }

    #[tokio::test]
    async fn unary_request_with_oversized_inline_body_yields_synthetic_400() {
        let (mut client, server) = duplex(1024 * 1024);
        let handler = Arc::new(EchoHandler);
        tokio::spawn(run_connection(server, handler, ProtocolVersion::V2));

        let oversized_body = vec![0_u8; MAX_BODY_BYTES + 1];
        let request = wire::encode_request_full(
            ProtocolVersion::V2,
            "POST",
            "http",
            "h",
            "/upload",
            "",
            "1.1",
            std::iter::empty(),
            &oversized_body,
        )
        .unwrap();
        frame::write_frame(&mut client, &request).await.unwrap();

        let response_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        let (_, _, head) = wire::decode_response_head(&response_payload).unwrap();
        assert_eq!(head.status, 400);
        let body = std::str::from_utf8(head.inline_body.unwrap()).unwrap();
        assert!(body.contains("body too large"));
    }

    #[tokio::test]
    async fn streaming_request_exceeding_body_limit_yields_synthetic_400() {
        let (mut client, server) = duplex(1024 * 1024);
        let handler = Arc::new(EchoHandler);
        tokio::spawn(run_connection(server, handler, ProtocolVersion::V2));

        let start = wire::encode_request_start(
            ProtocolVersion::V2,
            "PUT",
            "http",
            "h",
            "/upload",
            "",
            "1.1",
            std::iter::empty(),
        )
        .unwrap();
        frame::write_frame(&mut client, &start).await.unwrap();

        let oversized_chunk = vec![0_u8; MAX_BODY_BYTES + 1];
        frame::write_chunk_frame(&mut client, ProtocolVersion::V2 as u8, FrameType::ReqChunk as u8, &oversized_chunk)
            .await
            .unwrap();

        let response_payload = frame::read_frame(&mut client).await.unwrap().unwrap();
        let (_, _, head) = wire::decode_response_head(&response_payload).unwrap();
        assert_eq!(head.status, 400);
        let body = std::str::from_utf8(head.inline_body.unwrap()).unwrap();
        assert!(body.contains("body too large"));
    }
}
