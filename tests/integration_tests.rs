//! End-to-end tests: a `TunnelClient` and a `TunnelEngine` talking over a
//! byte stream, each bound to an in-memory interface.

use std::time::Duration;
use yuki_core::engine::REJECT_UNAUTHORIZED;
use yuki_core::{ClientRecord, SessionState, TunnelConfig, TunnelError};
use yuki_tests::{TestServer, ipv4_packet, start_client};

fn clients() -> Vec<ClientRecord> {
    vec![
        ClientRecord::new("alice", "alice-secret", "Alice"),
        ClientRecord::new("metered", "metered-secret", "Metered").with_max_bandwidth(100),
        {
            let mut blocked = ClientRecord::new("mallory", "mallory-secret", "Mallory");
            blocked.blocked = true;
            blocked
        },
    ]
}

#[tokio::test]
async fn test_packet_crosses_tunnel_and_is_counted() {
    let mut server = TestServer::new(TunnelConfig::default(), clients());
    let (channel, server_task) = server.connect_stream();

    let mut client = start_client(TunnelConfig::default(), "alice", "alice-secret", channel)
        .await
        .unwrap();
    assert!(client.session.id().starts_with("alice-"));

    let packet = ipv4_packet(60, 0xAB);
    client.iface.inject(packet.clone()).unwrap();
    assert_eq!(server.iface.recv_written().await.unwrap(), packet);

    let reply = ipv4_packet(84, 0xCD);
    server.iface.inject(reply.clone()).unwrap();
    assert_eq!(client.iface.recv_written().await.unwrap(), reply);

    let snapshot = server.engine.session(client.session.id()).await.unwrap();
    assert_eq!(snapshot.client_id, "alice");
    assert_eq!(snapshot.state, SessionState::Relaying);
    assert_eq!(snapshot.bytes_down, 60);
    assert_eq!(snapshot.bytes_up, 84);
    assert_eq!(snapshot.packets_down, 1);
    assert_eq!(snapshot.packets_up, 1);

    let record = server.client("alice");
    assert!(record.active);
    assert_eq!(record.bytes_down, 60);
    assert_eq!(record.bytes_up, 84);
    assert!(record.last_seen.is_some());

    client.session.request_shutdown();
    client.relay.await.unwrap().unwrap();
    assert_eq!(client.session.bytes_up(), 60);
    assert_eq!(client.session.bytes_down(), 84);

    assert!(matches!(
        server_task.await.unwrap(),
        Err(TunnelError::PeerClosed)
    ));
    assert_eq!(server.engine.session_count().await, 0);
    assert!(!server.client("alice").active);
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let server = TestServer::new(TunnelConfig::default(), clients());
    let (channel, server_task) = server.connect_stream();

    let err = start_client(TunnelConfig::default(), "alice", "guess", channel)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TunnelError::AuthenticationFailed(ref r) if r == REJECT_UNAUTHORIZED));
    assert!(matches!(
        server_task.await.unwrap(),
        Err(TunnelError::AuthenticationFailed(ref id)) if id == "alice"
    ));
    assert_eq!(server.engine.session_count().await, 0);
    assert!(!server.client("alice").active);
}

#[tokio::test]
async fn test_blocked_and_unknown_clients_are_rejected() {
    let server = TestServer::new(TunnelConfig::default(), clients());

    for (id, secret) in [("mallory", "mallory-secret"), ("nobody", "x")] {
        let (channel, server_task) = server.connect_stream();
        let result = start_client(TunnelConfig::default(), id, secret, channel).await;
        assert!(matches!(result, Err(TunnelError::AuthenticationFailed(_))));
        assert!(server_task.await.unwrap().is_err());
    }
    assert_eq!(server.engine.session_count().await, 0);
}

#[tokio::test]
async fn test_bandwidth_limit_ends_session() {
    let mut server = TestServer::new(TunnelConfig::default(), clients());
    let (channel, server_task) = server.connect_stream();
    let mut client = start_client(TunnelConfig::default(), "metered", "metered-secret", channel)
        .await
        .unwrap();

    server.iface.inject(ipv4_packet(60, 1)).unwrap();
    assert_eq!(client.iface.recv_written().await.unwrap().len(), 60);

    // 60 + 60 exceeds the 100-byte allowance
    server.iface.inject(ipv4_packet(60, 2)).unwrap();
    let result = server_task.await.unwrap();
    assert!(matches!(
        result,
        Err(TunnelError::BandwidthExceeded { limit: 100, used: 60, packet: 60 })
    ));
    assert_eq!(server.client("metered").bytes_up, 60);

    assert!(matches!(
        client.relay.await.unwrap(),
        Err(TunnelError::PeerClosed)
    ));
    assert!(client.iface.try_recv_written().is_none());
}

#[tokio::test]
async fn test_default_bandwidth_applies_to_unlimited_records() {
    let config = TunnelConfig::default().with_default_max_bandwidth(50);
    let server = TestServer::new(config, clients());
    let (channel, server_task) = server.connect_stream();
    let client = start_client(TunnelConfig::default(), "alice", "alice-secret", channel)
        .await
        .unwrap();

    server.iface.inject(ipv4_packet(60, 1)).unwrap();
    assert!(matches!(
        server_task.await.unwrap(),
        Err(TunnelError::BandwidthExceeded { limit: 50, used: 0, .. })
    ));
    assert!(client.relay.await.unwrap().is_err());
}

#[tokio::test]
async fn test_server_closes_one_of_two_sessions() {
    let mut server = TestServer::new(TunnelConfig::default(), clients());

    let (first_channel, first_task) = server.connect_stream();
    let first = start_client(TunnelConfig::default(), "alice", "alice-secret", first_channel)
        .await
        .unwrap();
    let (second_channel, second_task) = server.connect_stream();
    let second = start_client(TunnelConfig::default(), "alice", "alice-secret", second_channel)
        .await
        .unwrap();

    assert_ne!(first.session.id(), second.session.id());
    assert_eq!(server.engine.session_count().await, 2);

    server.engine.close_session(first.session.id()).await.unwrap();
    first_task.await.unwrap().unwrap();
    assert!(matches!(
        first.relay.await.unwrap(),
        Err(TunnelError::PeerClosed)
    ));

    let sessions = server.engine.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, second.session.id());

    second.iface.inject(ipv4_packet(40, 7)).unwrap();
    assert_eq!(server.iface.recv_written().await.unwrap().len(), 40);

    server.engine.close_all().await;
    second_task.await.unwrap().unwrap();
    assert!(second.relay.await.unwrap().is_err());
    assert_eq!(server.engine.session_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_tunnel_survives_on_keepalives() {
    let mut server = TestServer::new(TunnelConfig::default(), clients());
    let (channel, server_task) = server.connect_stream();
    let client = start_client(TunnelConfig::default(), "alice", "alice-secret", channel)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.engine.session_count().await, 1);

    client.iface.inject(ipv4_packet(20, 0)).unwrap();
    assert_eq!(server.iface.recv_written().await.unwrap().len(), 20);

    client.session.request_shutdown();
    client.relay.await.unwrap().unwrap();
    assert!(server_task.await.unwrap().is_err());
}
