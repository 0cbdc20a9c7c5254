// tests/mesh_sync.rs
// Two full coordinators over real sockets: the follower learns the
// leader key from the genesis entry, recovers the log through a gap
// request, and converges on the leader's balances.

use capsule_mesh::bazaar::TaskBazaar;
use capsule_mesh::capsule::CapsuleStore;
use capsule_mesh::config::Config;
use capsule_mesh::ledger::Ledger;
use capsule_mesh::network::{GossipConfig, GossipNode};
use capsule_mesh::node::Node;
use capsule_mesh::rating::RatingStore;
use capsule_mesh::storage;
use capsule_mesh::wallet::Wallet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

fn test_config(name: &str, is_genesis: bool, bootstrap: Vec<String>) -> Config {
    let data_dir = std::env::temp_dir()
        .join(format!("mesh_node_{}_{}", name, Uuid::new_v4()))
        .to_str()
        .expect("utf8 path")
        .to_string();
    Config {
        name: name.to_string(),
        node_id: format!("node_{}", name),
        port: 0,
        bootstrap_nodes: bootstrap,
        tags: vec![],
        data_dir,
        is_genesis_node: is_genesis,
        genesis_supply: 1_000_000,
        token: "MESH".to_string(),
        publish_fee: 0,
        confirmation_target: 1,
        confirm_timeout_ms: 5_000,
        created_at: chrono::Utc::now().to_rfc3339(),
    }
}

async fn spawn_node(cfg: Config) -> Arc<Node> {
    std::fs::create_dir_all(&cfg.data_dir).expect("data dir");
    let db = storage::open_db(cfg.db_path().to_str().expect("utf8 path"));
    let wallet = Arc::new(Wallet::load_or_generate(&cfg.wallet_path()).expect("wallet"));
    let ledger = Arc::new(Ledger::open(db.clone()).expect("ledger"));
    ledger
        .initialize(cfg.is_genesis_node, &wallet, cfg.genesis_supply)
        .expect("initialize");
    let capsules = Arc::new(CapsuleStore::new(db.clone()));
    let ratings = Arc::new(RatingStore::new(db.clone()));
    let bazaar = Arc::new(AsyncMutex::new(
        TaskBazaar::open(cfg.node_id.clone(), db).expect("bazaar"),
    ));
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let gossip = Arc::new(GossipNode::new(
        cfg.node_id.clone(),
        cfg.bootstrap_nodes.clone(),
        inbound_tx,
        None,
        GossipConfig::default(),
    ));
    Arc::clone(&gossip).start(cfg.port).await.expect("gossip start");
    let node = Arc::new(Node::new(
        cfg, wallet, ledger, capsules, ratings, bazaar, gossip,
    ));
    let dispatcher = Arc::clone(&node);
    tokio::spawn(async move {
        while let Some(inbound) = inbound_rx.recv().await {
            dispatcher.handle_inbound(inbound).await;
        }
    });
    node
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn follower_converges_on_leader_ledger() {
    let leader = spawn_node(test_config("leader", true, vec![])).await;
    assert_eq!(leader.ledger.last_seq(), 1);
    assert_eq!(leader.ledger.balance(leader.account_id()), 1_000_000);

    let leader_addr = format!("127.0.0.1:{}", leader.gossip.listen_port());
    let follower = spawn_node(test_config("follower", false, vec![leader_addr])).await;
    wait_until("peers connected", || {
        leader.gossip.has_peer(follower.node_id()) && follower.gossip.has_peer(leader.node_id())
    })
    .await;

    // The follower has not seen the genesis entry yet. The first live
    // broadcast (seq 2) arrives ahead of its head, which forces a gap
    // request and a batch replay from seq 1.
    let follower_account = follower.account_id().to_string();
    let receipts = leader
        .transfer(&follower_account, 100)
        .await
        .expect("leader transfer");
    assert_eq!(receipts.len(), 1);
    assert!(receipts[0].confirmed);
    assert_eq!(leader.ledger.balance(leader.account_id()), 999_900);

    wait_until("follower caught up", || {
        follower.ledger.balance(&follower_account) == 100
    })
    .await;
    assert_eq!(follower.ledger.last_seq(), 2);
    assert_eq!(
        follower.ledger.balance(leader.account_id()),
        leader.ledger.balance(leader.account_id())
    );

    // The mint entry taught the follower the leader key, so the platform
    // account is now derivable.
    assert_eq!(
        follower.platform_account().as_deref(),
        Some(leader.account_id())
    );
    follower.ledger.verify_projection().expect("projection consistent");
}

#[tokio::test]
async fn follower_submission_round_trips_through_leader() {
    let leader = spawn_node(test_config("leader2", true, vec![])).await;
    let leader_addr = format!("127.0.0.1:{}", leader.gossip.listen_port());
    let follower = spawn_node(test_config("follower2", false, vec![leader_addr])).await;
    wait_until("peers connected", || {
        leader.gossip.has_peer(follower.node_id()) && follower.gossip.has_peer(leader.node_id())
    })
    .await;

    // Seed the follower with funds and let it catch up.
    let follower_account = follower.account_id().to_string();
    leader
        .transfer(&follower_account, 500)
        .await
        .expect("seed transfer");
    wait_until("follower funded", || {
        follower.ledger.balance(&follower_account) == 500
    })
    .await;

    // The follower emits a transfer; the leader orders it and broadcasts
    // the accepted entry back.
    let recipient = Wallet::generate();
    let receipts = follower
        .transfer(recipient.account_id(), 120)
        .await
        .expect("follower transfer");
    assert!(receipts[0].confirmed, "follower observed its tx in the log");
    assert_eq!(follower.ledger.balance(&follower_account), 380);
    assert_eq!(follower.ledger.balance(recipient.account_id()), 120);
    assert_eq!(
        leader.ledger.balance(recipient.account_id()),
        120,
        "leader and follower agree"
    );
}
