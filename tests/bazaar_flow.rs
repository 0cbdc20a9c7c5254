// tests/bazaar_flow.rs
// Task lifecycle against a real ledger: escrow funding promotes the
// task, bids collect once, the winner is chosen deterministically, and
// settlement releases the escrow to the winner exactly once.

use capsule_mesh::bazaar::{
    CompletionOutcome, TaskBazaar, TaskBid, TaskBounty, TaskStatus,
};
use capsule_mesh::errors::MeshError;
use capsule_mesh::ledger::transaction::{Transaction, TxType};
use capsule_mesh::ledger::Ledger;
use capsule_mesh::rating::RatingStore;
use capsule_mesh::storage::{self, MeshDb};
use capsule_mesh::wallet::Wallet;
use uuid::Uuid;

fn test_db() -> MeshDb {
    let path = std::env::temp_dir().join(format!("mesh_bazaar_{}", Uuid::new_v4()));
    storage::open_db(path.to_str().expect("utf8 path"))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn bid(node: &str, amount: i64, ts: i64) -> TaskBid {
    TaskBid {
        node_id: node.to_string(),
        amount,
        timestamp: ts,
    }
}

#[test]
fn escrow_funding_flips_task_open() {
    let db = test_db();
    let wallet = Wallet::generate();
    let ledger = Ledger::open(db.clone()).expect("open ledger");
    ledger.initialize(true, &wallet, 500).expect("init");

    let mut bazaar = TaskBazaar::open("node_pub".into(), db).expect("open bazaar");
    let task = bazaar
        .create_local(
            "compress the replay logs",
            None,
            TaskBounty {
                amount: 300,
                token: "MESH".into(),
            },
            vec!["compression".into()],
        )
        .expect("create task");
    assert_eq!(task.status, TaskStatus::PendingEscrow);

    // Not funded yet: scan promotes nothing.
    assert!(bazaar.promote_funded(&ledger).expect("scan").is_empty());

    let fund = Transaction::build_signed(
        TxType::Transfer,
        wallet.account_id(),
        &task.escrow_account_id,
        300,
        2,
        now(),
        &wallet,
    );
    ledger.submit_local_as_leader(fund).expect("fund escrow");
    assert_eq!(ledger.balance(wallet.account_id()), 200);
    assert_eq!(ledger.balance(&task.escrow_account_id), 300);

    let promoted = bazaar.promote_funded(&ledger).expect("scan");
    assert_eq!(promoted, vec![task.task_id.clone()]);
    assert_eq!(
        bazaar.get(&task.task_id).expect("task").status,
        TaskStatus::Open
    );
}

#[test]
fn bids_are_unique_per_node_and_freeze_on_winner() {
    let db = test_db();
    let wallet = Wallet::generate();
    let ledger = Ledger::open(db.clone()).expect("open ledger");
    ledger.initialize(true, &wallet, 1_000).expect("init");

    let mut bazaar = TaskBazaar::open("node_pub".into(), db).expect("open bazaar");
    let task = bazaar
        .create_local(
            "label the archive",
            None,
            TaskBounty {
                amount: 100,
                token: "MESH".into(),
            },
            vec![],
        )
        .expect("create");
    let fund = Transaction::build_signed(
        TxType::Transfer,
        wallet.account_id(),
        &task.escrow_account_id,
        100,
        2,
        now(),
        &wallet,
    );
    ledger.submit_local_as_leader(fund).expect("fund");
    bazaar.promote_funded(&ledger).expect("scan");

    // First bid moves the task to voting.
    let updated = bazaar
        .add_bid(&task.task_id, bid("node_b", 90, 10))
        .expect("first bid");
    assert_eq!(updated.status, TaskStatus::Voting);
    assert!(updated.voting_started_at.is_some());

    // A duplicate (taskId, nodeId) bid is ignored.
    let updated = bazaar
        .add_bid(&task.task_id, bid("node_b", 50, 20))
        .expect("duplicate ignored");
    assert_eq!(updated.bids.len(), 1);
    assert_eq!(updated.bids[0].amount, 90);

    bazaar
        .add_bid(&task.task_id, bid("node_a", 90, 5))
        .expect("second bidder");

    // Same amount: earlier timestamp wins.
    let winner = bazaar
        .decide_winner(&task.task_id)
        .expect("winner")
        .expect("has bids");
    assert_eq!(winner.node_id, "node_a");

    // The bid list is frozen at winner computation.
    assert!(matches!(
        bazaar.add_bid(&task.task_id, bid("node_c", 10, 30)),
        Err(MeshError::TaskNotOpen)
    ));
}

#[test]
fn completion_settles_escrow_and_rates_winner() {
    let db = test_db();
    let wallet = Wallet::generate();
    let ledger = Ledger::open(db.clone()).expect("open ledger");
    ledger.initialize(true, &wallet, 500).expect("init");
    let ratings = RatingStore::new(db.clone());

    let mut bazaar = TaskBazaar::open("node_pub".into(), db.clone()).expect("open bazaar");
    let task = bazaar
        .create_local(
            "summarize the quarter",
            None,
            TaskBounty {
                amount: 300,
                token: "MESH".into(),
            },
            vec![],
        )
        .expect("create");
    let fund = Transaction::build_signed(
        TxType::Transfer,
        wallet.account_id(),
        &task.escrow_account_id,
        300,
        2,
        now(),
        &wallet,
    );
    ledger.submit_local_as_leader(fund).expect("fund");
    bazaar.promote_funded(&ledger).expect("scan");

    bazaar
        .add_bid(&task.task_id, bid("node_w", 270, now()))
        .expect("bid");
    let winner = bazaar
        .decide_winner(&task.task_id)
        .expect("decide")
        .expect("winner");
    assert_eq!(winner.node_id, "node_w");
    assert_eq!(winner.amount, 270);

    let assigned_at = now();
    bazaar
        .mark_assigned(&task.task_id, "node_w", assigned_at)
        .expect("assign");

    let completed_at = assigned_at + 1_000;
    let outcome = bazaar
        .mark_completed(&task.task_id, "node_w", completed_at, None)
        .expect("complete");
    let duration = match outcome {
        CompletionOutcome::Recorded { duration_ms } => duration_ms.expect("valid assignedAt"),
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(duration, 1_000);
    let record = ratings
        .record_completion("node_w", duration)
        .expect("rating");
    assert_eq!(record.completed, 1);
    assert!(record.ewma > 0.0);

    // Leader releases exactly the bounty from the escrow to the winner.
    let winner_wallet = Wallet::generate();
    let release = Transaction::build_signed(
        TxType::EscrowRelease,
        &task.escrow_account_id,
        winner_wallet.account_id(),
        300,
        ledger.nonce(&task.escrow_account_id) + 1,
        now(),
        &wallet,
    );
    ledger.submit_local_as_leader(release).expect("release");
    bazaar.mark_settled(&task.task_id).expect("settled");

    assert_eq!(ledger.balance(&task.escrow_account_id), 0);
    assert_eq!(ledger.balance(winner_wallet.account_id()), 300);
    let stored = bazaar.get(&task.task_id).expect("task");
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.settled);

    // Completion is idempotent.
    assert!(matches!(
        bazaar.mark_completed(&task.task_id, "node_x", now(), None),
        Ok(CompletionOutcome::AlreadyCompleted)
    ));

    // Rehydration marks completed tasks settled.
    let reopened = TaskBazaar::open("node_pub".into(), db).expect("reopen");
    let task_again = reopened.get(&task.task_id).expect("rehydrated");
    assert_eq!(task_again.status, TaskStatus::Completed);
    assert!(task_again.settled);
    assert_eq!(reopened.stats().completed, 1);
    assert_eq!(reopened.stats().total_rewards, 300);
}

#[test]
fn remote_tasks_never_carry_their_own_escrow_id() {
    let db = test_db();
    let mut bazaar = TaskBazaar::open("node_local".into(), db).expect("open");
    let mut task = {
        let mut other =
            TaskBazaar::open("node_remote".into(), test_db()).expect("other bazaar");
        other
            .create_local(
                "translate the handbook",
                None,
                TaskBounty {
                    amount: 50,
                    token: "MESH".into(),
                },
                vec![],
            )
            .expect("create")
    };
    let honest_escrow = task.escrow_account_id.clone();
    task.escrow_account_id = "escrow_attacker_controlled".into();
    assert!(bazaar.ingest_remote(task.clone()).expect("ingested"));
    let stored = bazaar.get(&task.task_id).expect("stored");
    assert_eq!(stored.escrow_account_id, honest_escrow);

    // Second delivery of the same task is ignored.
    assert!(!bazaar.ingest_remote(task).expect("duplicate"));
}
