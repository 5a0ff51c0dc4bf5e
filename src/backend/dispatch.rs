//! Handler Dispatch Facade (C5, §4.5): the seam between decoded bridge
//! frames and application handler code. Two request representations satisfy
//! the two delivery modes described in §4.5 — most handlers only need
//! [`DirectRequest`]'s accessors, so the exchange state machine never
//! constructs more than that; [`FullRequest`] is an opt-in upgrade a handler
//! reaches for when it wants `http` crate types.

use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Uri};

use crate::error::FramingError;
use crate::request::RequestView;
use crate::response::{BoxBodyStream, HandlerResponse};

/// Implemented by application code running on the backend side of the
/// bridge (§4.5).
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: BridgeRequest) -> HandlerResponse;
}

/// What `backend::exchange` hands a [`Handler`]. The exchange state machine
/// always constructs the `Direct` variant; `Full` exists so a handler that
/// wants framework-style types can upgrade into one without the facade
/// paying for it up front.
pub enum BridgeRequest {
    Direct(DirectRequest),
    Full(FullRequest),
}

impl BridgeRequest {
    /// Drops down to the borrowed, lazy view, discarding any materialized
    /// `http` types a `Full` request had already built.
    pub fn into_direct(self) -> DirectRequest {
        match self {
            BridgeRequest::Direct(direct) => direct,
            BridgeRequest::Full(full) => full.direct,
        }
    }

    /// Upgrades to framework mode, wrapping the same underlying view.
    pub fn into_full(self) -> FullRequest {
        match self {
            BridgeRequest::Direct(direct) => FullRequest::new(direct),
            BridgeRequest::Full(full) => full,
        }
    }
}

enum BodySource {
    Inline(Bytes),
    Streamed(BoxBodyStream),
    Empty,
}

/// The borrowed, lazy request view (§4.5 "Direct mode"). Field accessors
/// decode on demand from the frame's backing bytes; the body is handed out
/// once, as a stream, so a handler that never reads it never pays for a
/// copy.
pub struct DirectRequest {
    view: RequestView,
    body: BodySource,
}

impl DirectRequest {
    /// Builds a direct request from a decoded view. Used for both REQ_FULL
    /// (body already inline) and REQ_START (body arrives later via
    /// [`DirectRequest::new_streaming`]).
    pub fn new(view: RequestView) -> Self {
        let body = match view.inline_body() {
            Ok(Some(bytes)) if !bytes.is_empty() => BodySource::Inline(bytes),
            _ => BodySource::Empty,
        };
        Self { view, body }
    }

    /// Builds a direct request whose body arrives as a stream of chunks
    /// decoded from subsequent REQ_CHUNK/REQ_END frames (§4.4).
    pub fn new_streaming(view: RequestView, body: BoxBodyStream) -> Self {
        Self {
            view,
            body: BodySource::Streamed(body),
        }
    }

    pub fn method(&self) -> Result<&str, FramingError> {
        self.view.method()
    }

    pub fn scheme(&self) -> Result<&str, FramingError> {
        self.view.scheme()
    }

    pub fn authority(&self) -> Result<&str, FramingError> {
        self.view.authority()
    }

    pub fn path(&self) -> Result<&str, FramingError> {
        self.view.path()
    }

    pub fn query(&self) -> Result<&str, FramingError> {
        self.view.query()
    }

    pub fn protocol(&self) -> Result<&str, FramingError> {
        self.view.protocol()
    }

    /// ASCII-case-insensitive single-header lookup without materializing
    /// the full header list (§4.5).
    pub fn header(&self, name: &str) -> Result<Option<String>, FramingError> {
        self.view.header(name)
    }

    /// Computed once and cached by the underlying view (§3, §4.5).
    pub fn uri(&self) -> Result<&str, FramingError> {
        self.view.uri()
    }

    /// Applies `visit` to the unmaterialized header list; `(name, value)`
    /// pairs are only allocated for the entry actually visited (§4.5).
    pub fn for_each_header(&self, mut visit: impl FnMut(&str, &str)) -> Result<(), FramingError> {
        let head = self.view.head()?;
        for (name, value) in head.headers.iter() {
            visit(name, value);
        }
        Ok(())
    }

    /// Takes ownership of the body as a stream of chunks. Calling this more
    /// than once returns an empty stream on subsequent calls.
    pub fn take_body_stream(&mut self) -> BoxBodyStream {
        match std::mem::replace(&mut self.body, BodySource::Empty) {
            BodySource::Inline(bytes) => Box::pin(tokio_stream::once(Ok::<Bytes, crate::error::BridgeError>(bytes))),
            BodySource::Streamed(stream) => stream,
            BodySource::Empty => Box::pin(tokio_stream::empty::<Result<Bytes, crate::error::BridgeError>>()),
        }
    }
}

/// Framework mode (§4.5, expansion): wraps a [`DirectRequest`] and
/// materializes `http` crate types on first access, the same way a routed
/// handler would want a `HeaderMap`/`Uri` to work with.
pub struct FullRequest {
    direct: DirectRequest,
    headers: OnceLock<HeaderMap>,
    uri: OnceLock<Uri>,
}

impl FullRequest {
    pub fn new(direct: DirectRequest) -> Self {
        Self {
            direct,
            headers: OnceLock::new(),
            uri: OnceLock::new(),
        }
    }

    pub fn direct(&self) -> &DirectRequest {
        &self.direct
    }

    pub fn direct_mut(&mut self) -> &mut DirectRequest {
        &mut self.direct
    }

    /// Materializes the full header map on first access.
    pub fn headers(&self) -> Result<&HeaderMap, FramingError> {
        if let Some(headers) = self.headers.get() {
            return Ok(headers);
        }
        let mut map = HeaderMap::new();
        self.direct.for_each_header(|name, value| {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        })?;
        Ok(self.headers.get_or_init(|| map))
    }

    pub fn uri(&self) -> Result<&Uri, FramingError> {
        if let Some(uri) = self.uri.get() {
            return Ok(uri);
        }
        let raw = self.direct.uri()?;
        let parsed = raw.parse::<Uri>().map_err(|_| FramingError::InvalidUri)?;
        Ok(self.uri.get_or_init(|| parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ProtocolVersion;
    use tokio_stream::StreamExt;

    fn sample_view() -> RequestView {
        let payload = crate::wire::encode_request_full(
            ProtocolVersion::V2,
            "POST",
            "http",
            "example.com",
            "/echo",
            "",
            "1.1",
            vec![("content-type", "text/plain")].into_iter(),
            b"hello",
        )
        .unwrap();
        RequestView::from_frame(Bytes::from(payload))
    }

    #[tokio::test]
    async fn direct_request_exposes_inline_body_as_single_chunk_stream() {
        let mut request = DirectRequest::new(sample_view());
        assert_eq!(request.method().unwrap(), "POST");
        let mut body = request.take_body_stream();
        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn direct_request_body_stream_is_empty_on_second_take() {
        let mut request = DirectRequest::new(sample_view());
        let _ = request.take_body_stream();
        let mut second = request.take_body_stream();
        assert!(second.next().await.is_none());
    }

    #[test]
    fn full_request_materializes_headers_and_uri() {
        let direct = DirectRequest::new(sample_view());
        let full = FullRequest::new(direct);
        let headers = full.headers().unwrap();
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        let uri = full.uri().unwrap();
        assert_eq!(uri.path(), "/echo");
    }
}
