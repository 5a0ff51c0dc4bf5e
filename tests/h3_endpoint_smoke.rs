use std::net::SocketAddr;

use bridge_transport::config::TlsConfig;

/// Generates a throwaway self-signed cert/key pair under a temp directory
/// so these tests don't depend on a fixture checked in elsewhere.
fn self_signed_cert() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("generate self-signed cert");
    let dir = tempfile::tempdir().expect("create temp dir");
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).expect("write cert");
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).expect("write key");
    (dir, cert_path, key_path)
}

#[tokio::test(flavor = "current_thread")]
async fn binds_h3_endpoint_on_ephemeral_port() {
    let (_dir, cert_path, key_path) = self_signed_cert();
    let tls = TlsConfig {
        cert_path: &cert_path,
        key_path: &key_path,
        cert_password: None,
    };
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let endpoint = bridge_transport::frontend::tls::create_h3_endpoint(addr, &tls, false).expect("bind h3 endpoint");
    endpoint.close(0_u32.into(), b"test");
}

#[tokio::test(flavor = "current_thread")]
async fn binds_h3_endpoint_alongside_tcp_same_port() {
    let (_dir, cert_path, key_path) = self_signed_cert();
    let tls = TlsConfig {
        cert_path: &cert_path,
        key_path: &key_path,
        cert_password: None,
    };

    let tcp_listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).expect("bind tcp");
    let port = tcp_listener.local_addr().expect("tcp local addr").port();

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let endpoint = bridge_transport::frontend::tls::create_h3_endpoint(addr, &tls, false).expect("bind h3 endpoint");
    endpoint.close(0_u32.into(), b"test");
    drop(tcp_listener);
}
