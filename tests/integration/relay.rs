//! Auth pass-through and data relay scenarios.

use bytes::BytesMut;
use tokio::net::TcpListener;

use mysql_gateway::config::GatewayConfig;
use mysql_gateway::conn::{SEQ_RESET_BOTH, SEQ_RESET_ON_READ, SEQ_RESET_ON_WRITE};
use mysql_gateway::protocol::{
    capabilities::*, HandshakeResponse, AUTH_INVALID_METHOD, HEADER_OK,
};

use crate::harness::*;

/// S4: a four-round AuthSwitch/AuthMoreData dialogue is forwarded
/// unmodified in both directions and ends with the client seeing OK; the
/// relay that follows carries command traffic.
#[tokio::test]
async fn test_auth_dialogue_passes_through() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap().to_string();

    let gw = spawn_gateway(GatewayConfig {
        backends: vec![backend_entry("c1", backend_addr)],
        ..Default::default()
    })
    .await;

    let challenges: Vec<Vec<u8>> = vec![
        b"\xfecaching_sha2_password\x00nonce-data".to_vec(),
        vec![0x01, 0x04],
        vec![0x01, 0x02, 0x55, 0x66],
        vec![0x01, 0x03, 0x01],
    ];
    let answers: Vec<Vec<u8>> = vec![
        vec![0xAA; 32],
        vec![0x02],
        vec![0xBB, 0xCC, 0xDD],
        vec![0xEE; 8],
    ];

    let backend_task = tokio::spawn({
        let challenges = challenges.clone();
        let answers = answers.clone();
        async move {
            let mut backend = accept_backend(&backend_listener).await;
            let forwarded: HandshakeResponse = backend.recv_packet().await.unwrap();
            assert_eq!(forwarded.auth_plugin, AUTH_INVALID_METHOD);

            for (challenge, answer) in challenges.iter().zip(&answers) {
                backend.write_packet(challenge).await.unwrap();
                backend.flush().await.unwrap();

                let mut b = BytesMut::new();
                backend.read_packet(&mut b).await.unwrap();
                assert_eq!(&b[..], &answer[..], "answer relayed unmodified");
            }

            backend.write_packet(&ok_payload()).await.unwrap();
            backend.flush().await.unwrap();

            // Command phase: echo one command back as a response.
            backend.set_reset_option(SEQ_RESET_ON_READ);
            let mut command = BytesMut::new();
            backend.read_packet(&mut command).await.unwrap();
            assert_eq!(&command[..], b"\x03SELECT 1");

            backend.write_packet(&ok_payload()).await.unwrap();
            backend.flush().await.unwrap();
        }
    });

    let mut client = connect_client(&gw.addr, "c1.root", 0).await;

    for (challenge, answer) in challenges.iter().zip(&answers) {
        let mut b = BytesMut::new();
        client.read_packet(&mut b).await.unwrap();
        assert_eq!(&b[..], &challenge[..], "challenge relayed unmodified");

        client.write_packet(answer).await.unwrap();
        client.flush().await.unwrap();
    }

    let mut b = BytesMut::new();
    client.read_packet(&mut b).await.unwrap();
    assert_eq!(b[0], HEADER_OK);

    // Raw relay is now live: drive one command through it.
    client.set_reset_option(SEQ_RESET_ON_WRITE);
    client.write_packet(b"\x03SELECT 1").await.unwrap();
    client.flush().await.unwrap();

    let mut response = BytesMut::new();
    client.read_packet(&mut response).await.unwrap();
    assert_eq!(response[0], HEADER_OK);

    backend_task.await.unwrap();
    gw.shutdown.cancel();
    let _ = gw.handle.await;
}

/// S2-at-system-level: a client that negotiated compression talks through
/// the packet relay while the backend leg stays uncompressed; sequence
/// counters re-zero per command on both legs.
#[tokio::test]
async fn test_compressed_client_relays_through() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap().to_string();

    let gw = spawn_gateway(GatewayConfig {
        backends: vec![backend_entry("c1", backend_addr)],
        compress: true,
        ..Default::default()
    })
    .await;

    let backend_task = tokio::spawn(async move {
        let mut backend = accept_backend(&backend_listener).await;
        let forwarded: HandshakeResponse = backend.recv_packet().await.unwrap();
        assert_eq!(
            forwarded.capability & CLIENT_COMPRESS,
            0,
            "backend leg is never compressed"
        );

        backend.write_packet(&ok_payload()).await.unwrap();
        backend.flush().await.unwrap();

        for round in 0..3u8 {
            backend.set_reset_option(SEQ_RESET_ON_READ);
            let mut command = BytesMut::new();
            backend.read_packet(&mut command).await.unwrap();
            assert_eq!(command[0], 0x03);
            assert_eq!(command[1], round);

            backend.write_packet(&ok_payload()).await.unwrap();
            backend.flush().await.unwrap();
        }
    });

    let mut client = connect_client(&gw.addr, "c1.root", CLIENT_COMPRESS).await;
    let mut b = BytesMut::new();
    client.read_packet(&mut b).await.unwrap();
    assert_eq!(b[0], HEADER_OK);

    // Compression starts after the auth OK.
    let mut client = client.enable_compression();
    client.set_reset_option(SEQ_RESET_BOTH);

    for round in 0..3u8 {
        client.set_reset_option(SEQ_RESET_ON_WRITE);
        client.write_packet(&[0x03, round]).await.unwrap();
        client.flush().await.unwrap();

        let mut response = BytesMut::new();
        client.read_packet(&mut response).await.unwrap();
        assert_eq!(response[0], HEADER_OK, "round {round}");
    }

    backend_task.await.unwrap();
    gw.shutdown.cancel();
    let _ = gw.handle.await;
}
