use std::io;

use thiserror::Error;

/// Classification used by the connection state machine to decide whether an
/// error can be answered with a synthetic response or must close the
/// connection outright.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("body too large: attempted {attempted} bytes, limit is {limit} bytes")]
    BodyTooLarge { limit: usize, attempted: usize },

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to bind bridge endpoint {endpoint}: {source}")]
    BindFailed { endpoint: String, source: io::Error },

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("tls error: {0}")]
    Tls(String),
}

impl BridgeError {
    /// Errors that happened before a response head went out are safe to
    /// answer with a synthetic response and keep the connection alive.
    pub fn is_recoverable_before_response_head(&self) -> bool {
        matches!(
            self,
            BridgeError::Framing(_) | BridgeError::BodyTooLarge { .. } | BridgeError::HandlerFailed(_)
        )
    }
}

/// Errors raised by the frame codec (C1) and message decoder (C2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    OversizeFrame(usize, usize),

    #[error("connection closed mid-frame")]
    TruncatedFrame,

    #[error("field is not valid utf-8")]
    InvalidUtf8,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("unexpected frame type: expected one of {expected}, got {got}")]
    UnexpectedFrameType { expected: &'static str, got: u8 },

    #[error("invalid header name token: {0}")]
    InvalidHeaderToken(u16),

    #[error("{0} trailing bytes after decoding payload")]
    TrailingBytes(usize),

    #[error("malformed request/response interleaving: {0}")]
    Interleaving(&'static str),

    #[error("invalid uri")]
    InvalidUri,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
pub type FramingResult<T> = std::result::Result<T, FramingError>;
