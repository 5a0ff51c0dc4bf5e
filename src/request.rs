//! Request View data model (§3): the ephemeral handle a dispatch facade
//! hands to a handler. Field accessors decode on demand from a shared
//! payload buffer; nothing beyond the raw bytes is copied until a field is
//! actually read.

use std::sync::OnceLock;

use bytes::Bytes;

use crate::error::FramingError;
use crate::wire::{self, RequestHead};

/// Distinguishes where the backing bytes came from. Both origins decode
/// identically; the tag exists because a dispatch facade may want to treat
/// them differently (e.g. a payload-backed view outlives the connection's
/// own reusable buffer, a frame-backed view does not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewOrigin {
    /// Borrows directly from the decoded head frame's backing bytes.
    FrameBacked,
    /// Holds its own copy of the raw payload with offsets into it.
    PayloadBacked,
}

/// Lazy, borrowed view over a decoded REQ_FULL/REQ_START payload (§3
/// "Request View", §4.5 direct mode).
pub struct RequestView {
    payload: Bytes,
    origin: ViewOrigin,
    uri: OnceLock<String>,
}

impl RequestView {
    pub fn from_frame(payload: Bytes) -> Self {
        Self {
            payload,
            origin: ViewOrigin::FrameBacked,
            uri: OnceLock::new(),
        }
    }

    pub fn from_payload(payload: Bytes) -> Self {
        Self {
            payload,
            origin: ViewOrigin::PayloadBacked,
            uri: OnceLock::new(),
        }
    }

    pub fn origin(&self) -> ViewOrigin {
        self.origin
    }

    /// Re-derives the decoded head on each call. This is cheap (offset
    /// scanning only, one `Vec<HeaderSlot>` allocation) and keeps
    /// `RequestView` itself free of self-referential lifetimes.
    pub fn head(&self) -> Result<RequestHead<'_>, FramingError> {
        wire::decode_request_head(&self.payload).map(|(_, _, head)| head)
    }

    pub fn method(&self) -> Result<&str, FramingError> {
        Ok(self.head()?.method)
    }

    pub fn scheme(&self) -> Result<&str, FramingError> {
        Ok(self.head()?.scheme)
    }

    pub fn authority(&self) -> Result<&str, FramingError> {
        Ok(self.head()?.authority)
    }

    pub fn path(&self) -> Result<&str, FramingError> {
        Ok(self.head()?.path)
    }

    pub fn query(&self) -> Result<&str, FramingError> {
        Ok(self.head()?.query)
    }

    pub fn protocol(&self) -> Result<&str, FramingError> {
        Ok(self.head()?.protocol)
    }

    /// ASCII-case-insensitive single-header lookup without materialising
    /// the full header list.
    pub fn header(&self, name: &str) -> Result<Option<String>, FramingError> {
        Ok(self.head()?.headers.find(name).map(str::to_owned))
    }

    /// Inline body, present only when this view wraps a REQ_FULL payload.
    /// `REQ_START`-backed views return `None` — their body arrives
    /// separately as a stream of `REQ_CHUNK` frames (§4.4).
    pub fn inline_body(&self) -> Result<Option<Bytes>, FramingError> {
        let head = self.head()?;
        Ok(head.inline_body.map(|body| {
            let start = body.as_ptr() as usize - self.payload.as_ptr() as usize;
            self.payload.slice(start..start + body.len())
        }))
    }

    /// Computed once per view and cached; subsequent calls are a cheap
    /// `OnceLock` read (§4.5 "uri is computed once on demand").
    pub fn uri(&self) -> Result<&str, FramingError> {
        if let Some(uri) = self.uri.get() {
            return Ok(uri);
        }
        let head = self.head()?;
        let mut built = String::with_capacity(
            head.scheme.len() + 3 + head.authority.len() + head.path.len() + head.query.len() + 1,
        );
        built.push_str(head.scheme);
        built.push_str("://");
        built.push_str(head.authority);
        built.push_str(head.path);
        if !head.query.is_empty() {
            built.push('?');
            built.push_str(head.query);
        }
        Ok(self.uri.get_or_init(|| built))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ProtocolVersion;

    #[test]
    fn lazy_view_decodes_fields_on_demand() {
        let payload = crate::wire::encode_request_full(
            ProtocolVersion::V2,
            "GET",
            "http",
            "example.com",
            "/ping",
            "",
            "1.1",
            vec![("host", "example.com")].into_iter(),
            b"",
        )
        .unwrap();
        let view = RequestView::from_frame(Bytes::from(payload));
        assert_eq!(view.method().unwrap(), "GET");
        assert_eq!(view.path().unwrap(), "/ping");
        assert_eq!(view.header("host").unwrap().as_deref(), Some("example.com"));
        assert_eq!(view.uri().unwrap(), "http://example.com/ping");
        // Second call must hit the cache and return the same contents.
        assert_eq!(view.uri().unwrap(), "http://example.com/ping");
    }

    #[test]
    fn req_full_exposes_inline_body_req_start_does_not() {
        let full = crate::wire::encode_request_full(
            ProtocolVersion::V1,
            "POST",
            "http",
            "h",
            "/",
            "",
            "1.1",
            std::iter::empty(),
            b"hello",
        )
        .unwrap();
        let view = RequestView::from_frame(Bytes::from(full));
        assert_eq!(view.inline_body().unwrap().as_deref(), Some(&b"hello"[..]));

        let start = crate::wire::encode_request_start(
            ProtocolVersion::V1,
            "POST",
            "http",
            "h",
            "/",
            "",
            "1.1",
            std::iter::empty(),
        )
        .unwrap();
        let view = RequestView::from_frame(Bytes::from(start));
        assert!(view.inline_body().unwrap().is_none());
    }
}
