//! S5: shutdown with a fleet of sessions mid-relay.

use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpListener;

use mysql_gateway::config::GatewayConfig;
use mysql_gateway::protocol::HEADER_OK;

use crate::harness::*;

const SESSIONS: usize = 100;

#[tokio::test]
async fn test_shutdown_terminates_active_relays() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap().to_string();

    let gw = spawn_gateway(GatewayConfig {
        backends: vec![backend_entry("c1", backend_addr)],
        ..Default::default()
    })
    .await;

    // A backend that authenticates every session immediately, then holds
    // the connection open until the relay drops it.
    tokio::spawn(async move {
        loop {
            let mut backend = accept_backend(&backend_listener).await;
            tokio::spawn(async move {
                let mut b = BytesMut::new();
                if backend.read_packet(&mut b).await.is_err() {
                    return;
                }
                backend.write_packet(&ok_payload()).await.ok();
                backend.flush().await.ok();
                // Sit in the command phase until the gateway goes away.
                let mut hold = BytesMut::new();
                let _ = backend.read_packet(&mut hold).await;
            });
        }
    });

    let mut clients = Vec::with_capacity(SESSIONS);
    for i in 0..SESSIONS {
        let user = format!("c1.user{i}");
        let mut client = connect_client(&gw.addr, &user, 0).await;
        let mut b = BytesMut::new();
        client.read_packet(&mut b).await.unwrap();
        assert_eq!(b[0], HEADER_OK);
        clients.push(client);
    }

    gw.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), gw.handle)
        .await
        .expect("gateway drained within the grace period")
        .expect("serve task did not panic");

    // Relays are gone: the held connections observe EOF promptly.
    let mut probe = clients.remove(0);
    let observed = tokio::time::timeout(Duration::from_secs(5), async {
        let mut b = BytesMut::new();
        probe.read_packet(&mut b).await
    })
    .await
    .expect("client observed the close in time");
    assert!(observed.is_err());
}
