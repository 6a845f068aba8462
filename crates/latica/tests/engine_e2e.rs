/// E2E integration tests: engines talking over real localhost UDP.
///
/// Both peers run with a static UNRESTRICTED NAT type so no reflection
/// round is needed; B is A's only bootstrap peer.
use std::net::Ipv4Addr;
use std::time::Duration;

use latica::{
    BootstrapPeer, Engine, EngineChannels, EngineConfig, EngineEvent, LaticaError, NatType,
    PeerId, PublishOptions,
};
use tokio::sync::mpsc;

const CLUSTER: [u8; 32] = [42; 32];

async fn spawn_engine(seed: u8, bootstrap: Vec<BootstrapPeer>) -> EngineChannels {
    let config = EngineConfig::new(PeerId::from_bytes([seed; 32]))
        .cluster_id(CLUSTER)
        .bind_address(Ipv4Addr::LOCALHOST)
        .address(Ipv4Addr::LOCALHOST)
        .nat_type(NatType::UNRESTRICTED)
        .port(0)
        .bootstrap(bootstrap);
    Engine::bind(config).await.expect("bind engine")
}

/// A (seed 1) bootstrapped on B (seed 2).
async fn pair() -> (EngineChannels, EngineChannels) {
    let b = spawn_engine(2, Vec::new()).await;
    let b_info = b.handle.info().await.unwrap();
    let seed = BootstrapPeer::new(Ipv4Addr::LOCALHOST, b_info.local_port, b.handle.peer_id());
    let a = spawn_engine(1, vec![seed]).await;

    // wait until B has heard A's bootstrap ping
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let peers = b.handle.peers().await.unwrap();
            if peers.iter().any(|p| p.peer_id == a.handle.peer_id()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("B learns about A");

    (a, b)
}

/// Drain events until `pick` returns something.
async fn wait_for<T>(
    events: &mut mpsc::Receiver<EngineEvent>,
    mut pick: impl FnMut(EngineEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("engine running");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("event in time")
}

#[tokio::test]
async fn publish_reaches_subscriber() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let (a, mut b) = pair().await;
    let room_b = b.handle.join("room").await.unwrap();
    let room_a = a.handle.join("room").await.unwrap();
    assert_eq!(room_a, room_b);

    let id = a
        .handle
        .publish(room_a, b"hello over udp".to_vec(), PublishOptions::default())
        .await
        .unwrap();

    let delivered = wait_for(&mut b.events, |e| match e {
        EngineEvent::Packet(p) => Some(p),
        _ => None,
    })
    .await;
    assert_eq!(delivered.packet_id, id);
    assert_eq!(delivered.message, b"hello over udp");
    assert!(delivered.verified);
    assert_eq!(delivered.origin, Some(a.handle.peer_id()));

    let info = b.handle.info().await.unwrap();
    assert_eq!(info.cache_size, 1);
    assert!(b.handle.metrics().await.unwrap().cache_inserts >= 1);

    a.handle.close().await;
    b.handle.close().await;
}

#[tokio::test]
async fn query_is_answered() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let (mut a, mut b) = pair().await;
    let query_id = a.handle.query("anyone?").await.unwrap();

    let (seen_id, data) = wait_for(&mut b.events, |e| match e {
        EngineEvent::Query { query_id, data, .. } => Some((query_id, data)),
        _ => None,
    })
    .await;
    assert_eq!(seen_id, query_id);
    assert_eq!(data.as_deref(), Some("anyone?"));

    b.handle.answer(seen_id, "me").await.unwrap();
    let answer = wait_for(&mut a.events, |e| match e {
        EngineEvent::Answer { query_id: q, data } if q == query_id => data,
        _ => None,
    })
    .await;
    assert_eq!(answer, "me");
}

#[tokio::test]
async fn static_nat_engine_reports_ready() {
    let mut b = spawn_engine(3, Vec::new()).await;
    let nat = wait_for(&mut b.events, |e| match e {
        EngineEvent::Ready { nat_type, .. } => Some(nat_type),
        _ => None,
    })
    .await;
    assert_eq!(nat, NatType::UNRESTRICTED);
}

#[tokio::test]
async fn snapshot_survives_restart() {
    let (a, _b) = pair().await;
    let room = a.handle.join("room").await.unwrap();
    a.handle
        .publish(room, b"persist me".to_vec(), PublishOptions::default())
        .await
        .unwrap();

    let snapshot = a.handle.snapshot().await.unwrap();
    let bytes = snapshot.to_bytes().unwrap();
    a.handle.close().await;

    let restored = latica::EngineSnapshot::from_bytes(&bytes).unwrap();
    let config = EngineConfig::new(PeerId::from_bytes([1; 32]))
        .cluster_id(CLUSTER)
        .bind_address(Ipv4Addr::LOCALHOST)
        .nat_type(NatType::UNRESTRICTED)
        .port(0)
        .bootstrap(Vec::new())
        .restore(restored);
    let again = Engine::bind(config).await.unwrap();
    let info = again.handle.info().await.unwrap();
    assert_eq!(info.cache_size, 1);
    assert!(info.clock >= 1);
}

#[tokio::test]
async fn closed_engine_rejects_calls() {
    let b = spawn_engine(4, Vec::new()).await;
    b.handle.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(b.handle.info().await, Err(LaticaError::Shutdown)));
}

#[tokio::test]
async fn port_in_use_is_a_bind_error() {
    let b = spawn_engine(5, Vec::new()).await;
    let port = b.handle.info().await.unwrap().local_port;

    let config = EngineConfig::new(PeerId::from_bytes([6; 32]))
        .cluster_id(CLUSTER)
        .bind_address(Ipv4Addr::LOCALHOST)
        .port(port)
        .bootstrap(Vec::new());
    assert!(matches!(
        Engine::bind(config).await,
        Err(LaticaError::Bind { socket: "main", .. })
    ));
}
