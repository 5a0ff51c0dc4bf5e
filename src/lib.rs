//! In-process binary bridge transport coupling a native HTTP front-end to a
//! managed handler backend.
//!
//! The front-end ([`frontend`]) terminates inbound HTTP/1.1, HTTP/2, and
//! optional HTTP/3 traffic and forwards each request across a
//! length-prefixed binary protocol ([`frame`], [`wire`]) to a backend
//! ([`backend`]) that dispatches it to an application-supplied
//! [`backend::Handler`]. Streaming bodies, a zero-copy "direct mode" for
//! hot-path handlers, and detached-socket tunnelling for WebSocket/CONNECT
//! upgrades ([`tunnel`]) are all built on the same framing.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod frontend;
pub mod request;
pub mod response;
pub mod tunnel;
pub mod wire;

pub use backend::{BridgeEndpointInfo, BridgeListener, BridgeRequest, DirectRequest, FullRequest, Handler};
pub use config::{BackendKind, BridgeEndpointConfig, FrontendConfig, TlsConfig};
pub use error::{BridgeError, FramingError};
pub use frontend::bridge_client::{BridgeCallResult, BridgePool, BridgeTarget, OutboundRequest};
pub use response::{BoxBodyStream, HandlerResponse, PreEncoded};
pub use tunnel::DetachedSocket;
pub use wire::ProtocolVersion;
