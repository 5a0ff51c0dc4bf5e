//! Typed configuration for both halves of the bridge (§6, expansion).
//!
//! `shutdown_signal` from §6's options table is not represented here: a
//! cancellation source isn't serializable config, it is a runtime value
//! passed directly to [`crate::backend::listener::BridgeListener::serve`]
//! and the front-end's own serve loop.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which transport the bridge endpoint uses (§4.3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Unix,
    Tcp,
}

/// Bridge endpoint discovery parameters published by the backend and
/// consumed by the front-end at start-up (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEndpointConfig {
    pub backend_kind: BackendKind,
    pub backend_host: Option<String>,
    pub backend_port: Option<u16>,
    pub backend_path: Option<PathBuf>,
}

fn default_backlog() -> u32 {
    1024
}

/// Front-end boot configuration (§6's options table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub v6_only: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_cert_password: Option<String>,
    #[serde(default)]
    pub enable_http2: bool,
    #[serde(default)]
    pub enable_http3: bool,
    #[serde(default)]
    pub request_client_certificate: bool,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            backlog: default_backlog(),
            v6_only: false,
            shared: false,
            tls_cert_path: None,
            tls_key_path: None,
            tls_cert_password: None,
            enable_http2: true,
            enable_http3: false,
            request_client_certificate: false,
        }
    }
}

impl FrontendConfig {
    /// `Some` when both a cert and key path are configured.
    pub fn tls(&self) -> Option<TlsConfig<'_>> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
                cert_password: self.tls_cert_password.as_deref(),
            }),
            _ => None,
        }
    }
}

pub struct TlsConfig<'a> {
    pub cert_path: &'a PathBuf,
    pub key_path: &'a PathBuf,
    pub cert_password: Option<&'a str>,
}
