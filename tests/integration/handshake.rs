//! Connection-phase scenarios: TLS upgrade, routing and the mutations the
//! gateway applies to the forwarded handshake response.

use bytes::BytesMut;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use mysql_gateway::config::GatewayConfig;
use mysql_gateway::conn::{PacketConn, Transport};
use mysql_gateway::protocol::{
    capabilities::*, HandshakeResponse, InitialHandshake, AUTH_INVALID_METHOD, HEADER_ERR,
};
use mysql_gateway::tls::TlsConnector;

use crate::harness::*;

/// S3: SSLRequest, TLS upgrade, then a routed handshake response whose
/// forwarded copy has COMPRESS cleared, PLUGIN_AUTH set and an unknown
/// auth plugin name.
#[tokio::test]
async fn test_tls_upgrade_and_forwarded_response_mutations() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap().to_string();

    let gw = spawn_gateway(GatewayConfig {
        backends: vec![backend_entry("c1", backend_addr)],
        tls: write_tls_material(),
        ..Default::default()
    })
    .await;

    let (forwarded_tx, forwarded_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut backend = accept_backend(&backend_listener).await;
        let forwarded: HandshakeResponse = backend.recv_packet().await.expect("recv forwarded");
        let _ = forwarded_tx.send(forwarded);
    });

    let stream = tokio::net::TcpStream::connect(&gw.addr).await.unwrap();
    let mut client = PacketConn::new(stream);
    let greeting: InitialHandshake = client.recv_packet().await.unwrap();
    assert_ne!(greeting.capability & CLIENT_SSL, 0, "gateway must offer SSL");

    // Truncated response with the SSL bit: ask for the upgrade.
    let ssl_request =
        ssl_request_payload(CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_SSL);
    client.write_packet(&ssl_request).await.unwrap();
    client.flush().await.unwrap();

    let (transport, sequence) = client.into_transport().await.unwrap();
    assert_eq!(sequence, 2);
    let tcp = transport.into_tcp().ok().expect("still plain tcp");
    let tls = TlsConnector::new_insecure()
        .unwrap()
        .connect(tcp, "localhost")
        .await
        .expect("client tls handshake");
    let mut client = PacketConn::resume(Transport::client_tls(tls), sequence);

    // Full response over TLS, still carrying SSL plus a compression
    // request the gateway must strip.
    let mut response = client_response("c1.root", CLIENT_SSL | CLIENT_COMPRESS);
    response.db_name = "orders".to_string();
    client.send_packet(&response).await.unwrap();

    let forwarded = forwarded_rx.await.expect("backend saw the response");
    assert_eq!(forwarded.capability & CLIENT_COMPRESS, 0);
    assert_ne!(forwarded.capability & CLIENT_PLUGIN_AUTH, 0);
    assert_eq!(forwarded.auth_plugin, AUTH_INVALID_METHOD);
    assert_eq!(forwarded.user_name, "root");
    assert_eq!(forwarded.db_name, "orders");
    assert_eq!(forwarded.auth, response.auth);

    gw.shutdown.cancel();
    let _ = gw.handle.await;
}

/// The secure-connection capability is cleared on the backend leg when the
/// gateway runs with --backend-insecure-transport.
#[tokio::test]
async fn test_backend_insecure_transport_clears_capability() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap().to_string();

    let gw = spawn_gateway(GatewayConfig {
        backends: vec![backend_entry("c1", backend_addr)],
        backend_insecure_transport: true,
        ..Default::default()
    })
    .await;

    let (forwarded_tx, forwarded_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut backend = accept_backend(&backend_listener).await;
        let forwarded: HandshakeResponse = backend.recv_packet().await.expect("recv forwarded");
        let _ = forwarded_tx.send(forwarded);
    });

    let _client = connect_client(&gw.addr, "c1.root", 0).await;

    let forwarded = forwarded_rx.await.unwrap();
    assert_eq!(forwarded.capability & CLIENT_SECURE_CONNECTION, 0);
    assert_eq!(forwarded.user_name, "root");

    gw.shutdown.cancel();
    let _ = gw.handle.await;
}

/// A user name without a dot routes on the whole name and forwards an
/// empty user.
#[tokio::test]
async fn test_single_segment_user_routes_whole_name() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap().to_string();

    let gw = spawn_gateway(GatewayConfig {
        backends: vec![backend_entry("alice", backend_addr)],
        ..Default::default()
    })
    .await;

    let (forwarded_tx, forwarded_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut backend = accept_backend(&backend_listener).await;
        let forwarded: HandshakeResponse = backend.recv_packet().await.expect("recv forwarded");
        let _ = forwarded_tx.send(forwarded);
    });

    let _client = connect_client(&gw.addr, "alice", 0).await;

    let forwarded = forwarded_rx.await.unwrap();
    assert_eq!(forwarded.user_name, "");

    gw.shutdown.cancel();
    let _ = gw.handle.await;
}

/// An unroutable cluster surfaces as an ERR packet before auth.
#[tokio::test]
async fn test_unreachable_backend_reports_err_packet() {
    // Port 1 on loopback is reliably closed.
    let gw = spawn_gateway(GatewayConfig {
        backends: vec![backend_entry("c1", "127.0.0.1:1")],
        ..Default::default()
    })
    .await;

    let mut client = connect_client(&gw.addr, "c1.root", 0).await;

    let mut b = BytesMut::new();
    client.read_packet(&mut b).await.unwrap();
    assert_eq!(b[0], HEADER_ERR);

    gw.shutdown.cancel();
    let _ = gw.handle.await;
}
