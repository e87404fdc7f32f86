//! Shared helpers: gateway spawning, TLS material, mock-backend handshakes
//! and client-side packet plumbing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mysql_gateway::config::GatewayConfig;
use mysql_gateway::conn::PacketConn;
use mysql_gateway::gateway::Gateway;
use mysql_gateway::protocol::{
    capabilities::*, HandshakeResponse, InitialHandshake, WireBuf, AUTH_NATIVE_PASSWORD,
};
use mysql_gateway::router::BackendEntry;
use mysql_gateway::tls::TlsSettings;

static NEXT_FILE_ID: AtomicU32 = AtomicU32::new(0);

pub struct RunningGateway {
    pub addr: String,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<()>,
}

/// Bind a gateway on an ephemeral loopback port and serve it in the
/// background.
pub async fn spawn_gateway(mut config: GatewayConfig) -> RunningGateway {
    config.addr = "127.0.0.1:0".to_string();
    let gateway = Gateway::bind(config).await.expect("bind gateway");
    let addr = gateway.local_addr().expect("local addr").to_string();
    let shutdown = gateway.shutdown_handle();
    let handle = tokio::spawn(gateway.serve());
    RunningGateway {
        addr,
        shutdown,
        handle,
    }
}

pub fn backend_entry(cluster_id: &str, address: impl Into<String>) -> BackendEntry {
    BackendEntry {
        cluster_id: cluster_id.to_string(),
        address: address.into(),
    }
}

/// Self-signed localhost certificate written to fresh temp files.
pub fn write_tls_material() -> TlsSettings {
    let id = NEXT_FILE_ID.fetch_add(1, Ordering::SeqCst);
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate certificate");

    let dir = std::env::temp_dir();
    let cert_path: PathBuf = dir.join(format!(
        "mysql-gateway-test-{}-{}-cert.pem",
        std::process::id(),
        id
    ));
    let key_path: PathBuf = dir.join(format!(
        "mysql-gateway-test-{}-{}-key.pem",
        std::process::id(),
        id
    ));
    std::fs::write(&cert_path, cert.cert.pem()).expect("write cert");
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).expect("write key");

    TlsSettings {
        ca: None,
        cert: Some(cert_path),
        key: Some(key_path),
        ..Default::default()
    }
}

/// Accept one connection on `listener` and play the backend's side of the
/// greeting.
pub async fn accept_backend(listener: &TcpListener) -> PacketConn {
    let (stream, _) = listener.accept().await.expect("accept backend conn");
    let mut conn = PacketConn::new(stream);
    let greeting = InitialHandshake {
        protocol_version: 10,
        server_version: "8.0.30-mock".to_string(),
        connection_id: 99,
        auth_plugin_data: vec![3u8; 20],
        capability: CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_CONNECT_WITH_DB,
        character_set: 0x21,
        status_flags: 0x0002,
        auth_plugin_name: AUTH_NATIVE_PASSWORD.to_string(),
    };
    conn.send_packet(&greeting).await.expect("send mock greeting");
    conn
}

/// A plausible client handshake response targeting `user`.
pub fn client_response(user: &str, extra_capability: u32) -> HandshakeResponse {
    HandshakeResponse {
        capability: CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_CONNECT_WITH_DB
            | extra_capability,
        max_packet_size: 1 << 24,
        character_set: 0x21,
        user_name: user.to_string(),
        db_name: "test".to_string(),
        auth: Bytes::from(vec![0xAB; 20]),
        auth_plugin: AUTH_NATIVE_PASSWORD.to_string(),
        ..Default::default()
    }
}

/// The wire form of a truncated SSLRequest carrying `capability`.
pub fn ssl_request_payload(capability: u32) -> Vec<u8> {
    let mut b = WireBuf::new();
    b.put_u32_le(capability);
    b.put_u32_le(1 << 24);
    b.put_u8(0x21);
    b.put_zeros(23);
    b.as_slice().to_vec()
}

/// Minimal OK packet payload (no session-track info).
pub fn ok_payload() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

/// Connect to the gateway and run the plain (non-TLS) connection phase up
/// to sending the handshake response.
pub async fn connect_client(addr: &str, user: &str, extra_capability: u32) -> PacketConn {
    let stream = TcpStream::connect(addr).await.expect("connect gateway");
    let mut conn = PacketConn::new(stream);
    let greeting: InitialHandshake = conn.recv_packet().await.expect("recv greeting");
    assert_eq!(greeting.protocol_version, 10);
    conn.send_packet(&client_response(user, extra_capability))
        .await
        .expect("send response");
    conn
}
