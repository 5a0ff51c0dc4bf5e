//! Response Assembly (§3) and the value a handler hands back to the
//! dispatch facade (C5): buffered bytes, a lazy byte stream, a pre-encoded
//! payload, or a request to detach into tunnel mode.

use std::pin::Pin;

use bytes::Bytes;
use tokio_stream::Stream;

use crate::error::BridgeError;
use crate::tunnel::DetachedSocket;
use crate::wire::{self, ProtocolVersion};

pub type BoxBodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BridgeError>> + Send>>;

/// A fully serialised RESP_FULL payload, computed once and reused verbatim
/// across requests (§3, §4.2 "fast-path detection", §9 Open Question).
///
/// Immutable by contract: this crate adopts resolution (a) from §9 — a
/// pre-encoded response cannot be mutated per request. A handler that needs
/// per-request header variation must build a fresh [`HandlerResponse`]
/// instead.
#[derive(Clone)]
pub struct PreEncoded {
    payload: Bytes,
}

impl PreEncoded {
    /// Serialises `status`/`headers`/`body` into a RESP_FULL payload a
    /// single time.
    pub fn once<'h>(
        version: ProtocolVersion,
        status: u16,
        headers: impl Iterator<Item = (&'h str, &'h str)>,
        body: &[u8],
    ) -> Result<Self, BridgeError> {
        let payload = wire::encode_response_full(version, status, headers, body)?;
        Ok(Self {
            payload: Bytes::from(payload),
        })
    }

    /// The exact bytes to write as a single framed write (§4.2).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// What a [`crate::backend::dispatch::Handler`] returns.
pub enum HandlerResponse {
    Buffered {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    Streamed {
        status: u16,
        headers: Vec<(String, String)>,
        body: BoxBodyStream,
    },
    /// Emitted verbatim by the encoder without per-request header or body
    /// serialisation (§4.2, §4.5 "detail floor").
    PreEncoded(PreEncoded),
    /// The handler has taken ownership of the connection for tunnel mode
    /// (§4.4 "Tunnel handoff"); `status`/`headers` are still sent as a
    /// normal RESP_START/RESP_END pair before the connection switches to
    /// TUNNEL.
    Detached {
        status: u16,
        headers: Vec<(String, String)>,
        socket: DetachedSocket,
    },
}

/// Synthetic 400 used when a framing or body-size error happens before a
/// response head has gone out (§7).
pub fn synthetic_400(message: impl Into<String>) -> HandlerResponse {
    HandlerResponse::Buffered {
        status: 400,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: Bytes::from(message.into()),
    }
}

/// Synthetic 500 used when a handler fails before a response head has gone
/// out (§7).
pub fn synthetic_500(message: impl Into<String>) -> HandlerResponse {
    HandlerResponse::Buffered {
        status: 500,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: Bytes::from(message.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_encoded_payload_is_reusable_across_calls() {
        let encoded = PreEncoded::once(
            ProtocolVersion::V2,
            200,
            vec![("content-type", "text/plain")].into_iter(),
            b"pong",
        )
        .unwrap();
        let first = encoded.payload().clone();
        let second = encoded.payload().clone();
        assert_eq!(first, second);
    }
}
