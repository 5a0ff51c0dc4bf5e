//! Backend half of the bridge: binds the endpoint the front-end dials
//! ([`listener`], C3), drives one connection's request/response/tunnel
//! lifecycle ([`exchange`], C4), and exposes the facade application
//! handlers implement ([`dispatch`], C5).

pub mod dispatch;
pub mod exchange;
pub mod listener;

pub use dispatch::{BridgeRequest, DirectRequest, FullRequest, Handler};
pub use listener::{BridgeEndpointInfo, BridgeListener};
