// tests/gossip.rs
// Transport-level behavior over real localhost sockets: handshake
// produces stable peer identities, broadcasts are delivered, and the
// seen-set suppresses duplicate message ids.

use capsule_mesh::network::wire::{MessageKind, WireMessage};
use capsule_mesh::network::{GossipConfig, GossipNode, Inbound};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn recv_within(
    rx: &mut mpsc::UnboundedReceiver<Inbound>,
    what: &str,
) -> Inbound {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("channel open")
}

#[tokio::test]
async fn handshake_broadcast_and_duplicate_suppression() {
    let (tx_a, mut _rx_a) = mpsc::unbounded_channel();
    let a = Arc::new(GossipNode::new(
        "node_a".into(),
        vec![],
        tx_a,
        None,
        GossipConfig::default(),
    ));
    let port_a = Arc::clone(&a).start(0).await.expect("start a");

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let b = Arc::new(GossipNode::new(
        "node_b".into(),
        vec![format!("127.0.0.1:{}", port_a)],
        tx_b,
        None,
        GossipConfig::default(),
    ));
    Arc::clone(&b).start(0).await.expect("start b");

    // Handshakes establish stable identities on both ends.
    wait_until("peers connected", || {
        a.has_peer("node_b") && b.has_peer("node_a")
    })
    .await;

    // A broadcast from a reaches b's handler set.
    a.broadcast(WireMessage::new(
        MessageKind::Task,
        json!({ "taskId": "task_broadcast_once" }),
    ));
    let inbound = recv_within(&mut rx_b, "task broadcast").await;
    assert_eq!(inbound.message.kind, MessageKind::Task);
    assert_eq!(inbound.peer_id, "node_a");

    // The same message id delivered twice is handled exactly once: the
    // duplicate is swallowed, so the next delivery b sees is the marker.
    let mut dup = WireMessage::new(MessageKind::Capsule, json!({ "assetId": "sha256:dup" }));
    dup.ensure_message_id();
    a.send_to_peer("node_b", &dup);
    a.send_to_peer("node_b", &dup);
    let mut marker = WireMessage::new(MessageKind::Capsule, json!({ "assetId": "sha256:marker" }));
    marker.ensure_message_id();
    a.send_to_peer("node_b", &marker);

    let first = recv_within(&mut rx_b, "first capsule").await;
    assert_eq!(first.message.payload["assetId"], "sha256:dup");
    let second = recv_within(&mut rx_b, "marker capsule").await;
    assert_eq!(
        second.message.payload["assetId"], "sha256:marker",
        "duplicate message id must not reach the handler twice"
    );
}

#[tokio::test]
async fn spent_hops_are_not_processed() {
    let (tx_a, mut _rx_a) = mpsc::unbounded_channel();
    let a = Arc::new(GossipNode::new(
        "node_a".into(),
        vec![],
        tx_a,
        None,
        GossipConfig::default(),
    ));
    let port_a = Arc::clone(&a).start(0).await.expect("start a");

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let b = Arc::new(GossipNode::new(
        "node_b".into(),
        vec![format!("127.0.0.1:{}", port_a)],
        tx_b,
        None,
        GossipConfig::default(),
    ));
    Arc::clone(&b).start(0).await.expect("start b");
    wait_until("peers connected", || {
        a.has_peer("node_b") && b.has_peer("node_a")
    })
    .await;

    // hopsLeft below zero is dropped before delivery.
    let mut dead = WireMessage::new(MessageKind::Capsule, json!({ "assetId": "sha256:dead" }));
    dead.ensure_message_id();
    dead.hops_left = Some(-1);
    a.send_to_peer("node_b", &dead);

    let mut live = WireMessage::new(MessageKind::Capsule, json!({ "assetId": "sha256:live" }));
    live.ensure_message_id();
    live.hops_left = Some(0);
    a.send_to_peer("node_b", &live);

    let inbound = recv_within(&mut rx_b, "live capsule").await;
    assert_eq!(inbound.message.payload["assetId"], "sha256:live");
}
