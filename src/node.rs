// src/node.rs
// Mesh coordinator: composes wallet, ledger, stores, bazaar and gossip,
// owns the inbound dispatch loop and the user-facing actions. Workers
// are named tasks with documented cadences; there are no process-wide
// singletons.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use crate::bazaar::{CompletionOutcome, TaskBazaar, TaskBid, TaskBounty, TaskRecord, TaskStatus};
use crate::capsule::{self, CapsuleFilter, CapsulePrice, CapsuleRecord, CapsuleStore};
use crate::config::Config;
use crate::errors::{MeshError, Result, TxRejection};
use crate::ledger::transaction::{LogEntry, Transaction, TxType};
use crate::ledger::{Ledger, RemoteApply, BATCH_PAGE_SIZE};
use crate::network::wire::{MessageKind, WireMessage};
use crate::network::{GossipNode, Inbound};
use crate::rating::RatingStore;
use crate::wallet::{self, Wallet};

/// Confirmation polls run at this cadence.
const CONFIRM_POLL_MS: u64 = 200;
/// Pending follower transactions are swept this often.
const PENDING_SWEEP_MS: u64 = 2_000;
/// Re-broadcast back-off bounds.
const PENDING_BACKOFF_START_MS: i64 = 2_000;
const PENDING_BACKOFF_CAP_MS: i64 = 15_000;
/// Follower sync cadence; every sixth tick forces a full resync.
const SYNC_INTERVAL_SECS: u64 = 10;
const FULL_SYNC_EVERY_TICKS: u64 = 6;
/// Waiting for the leader key metadata to appear.
const PLATFORM_WAIT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub tx_id: String,
    pub confirmations: u64,
    pub confirmed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishCapsuleOutcome {
    pub capsule: CapsuleRecord,
    pub receipts: Vec<TxReceipt>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishTaskOutcome {
    pub task: TaskRecord,
    pub receipts: Vec<TxReceipt>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOutcome {
    pub confirmed: bool,
    /// Present only when every involved transaction met the confirmation
    /// target within the timeout. The ledger is monotonic; a timeout is
    /// not a rollback, confirmations keep accruing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    pub receipts: Vec<TxReceipt>,
}

struct PendingTx {
    tx: Transaction,
    next_at: i64,
    backoff_ms: i64,
}

pub struct Node {
    pub cfg: Config,
    pub wallet: Arc<Wallet>,
    pub ledger: Arc<Ledger>,
    pub capsules: Arc<CapsuleStore>,
    pub ratings: Arc<RatingStore>,
    pub bazaar: Arc<AsyncMutex<TaskBazaar>>,
    pub gossip: Arc<GossipNode>,
    pending: Mutex<HashMap<String, PendingTx>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Node {
    pub fn new(
        cfg: Config,
        wallet: Arc<Wallet>,
        ledger: Arc<Ledger>,
        capsules: Arc<CapsuleStore>,
        ratings: Arc<RatingStore>,
        bazaar: Arc<AsyncMutex<TaskBazaar>>,
        gossip: Arc<GossipNode>,
    ) -> Self {
        Self {
            cfg,
            wallet,
            ledger,
            capsules,
            ratings,
            bazaar,
            gossip,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.cfg.is_genesis_node
    }

    pub fn node_id(&self) -> &str {
        &self.gossip.node_id
    }

    pub fn account_id(&self) -> &str {
        self.wallet.account_id()
    }

    /// The platform account is derived from the leader public key held in
    /// ledger metadata.
    pub fn platform_account(&self) -> Option<String> {
        self.ledger
            .leader_pem()
            .map(|pem| wallet::account_id_of(&pem))
    }

    /// Poll for the leader key metadata to become available (followers
    /// learn it from the genesis mint entry).
    pub async fn wait_for_platform_account(&self) -> Result<String> {
        let deadline = now_ms() + PLATFORM_WAIT_MS as i64;
        loop {
            if let Some(account) = self.platform_account() {
                return Ok(account);
            }
            if now_ms() >= deadline {
                return Err(MeshError::Timeout("platform account"));
            }
            tokio::time::sleep(Duration::from_millis(CONFIRM_POLL_MS)).await;
        }
    }

    /// Next usable nonce for our own account: the projected nonce plus
    /// anything we already have in flight.
    fn next_own_nonce(&self) -> u64 {
        let base = self.ledger.nonce(self.account_id());
        let in_flight = self
            .pending
            .lock()
            .values()
            .filter(|p| p.tx.from == self.account_id())
            .map(|p| p.tx.nonce)
            .max()
            .unwrap_or(0);
        base.max(in_flight) + 1
    }

    fn build_own_transfer(&self, to: &str, amount: i64) -> Transaction {
        Transaction::build_signed(
            TxType::Transfer,
            self.account_id(),
            to,
            amount,
            self.next_own_nonce(),
            now_ms(),
            &self.wallet,
        )
    }

    /// Submit a signed transaction. The leader appends locally and
    /// broadcasts the resulting log entry; a follower broadcasts the
    /// transaction and re-broadcasts with back-off until it shows up in
    /// the replicated log.
    pub fn submit_tx(&self, tx: Transaction) -> Result<String> {
        let tx_id = tx.tx_id.clone();
        if self.is_leader() {
            let (seq, _) = self.ledger.submit_local_as_leader(tx.clone())?;
            self.broadcast_log_entry(LogEntry { seq, tx });
        } else {
            let message =
                WireMessage::new(MessageKind::Tx, serde_json::to_value(&tx)?);
            self.gossip.broadcast(message);
            self.pending.lock().insert(
                tx_id.clone(),
                PendingTx {
                    tx,
                    next_at: now_ms() + PENDING_BACKOFF_START_MS,
                    backoff_ms: PENDING_BACKOFF_START_MS,
                },
            );
        }
        Ok(tx_id)
    }

    fn broadcast_log_entry(&self, entry: LogEntry) {
        match serde_json::to_value(&entry) {
            Ok(payload) => {
                self.gossip
                    .broadcast(WireMessage::new(MessageKind::TxLog, payload));
            }
            Err(e) => tracing::warn!(error = %e, "serialize log entry failed"),
        }
    }

    /// Plain transfer from this node's account.
    pub async fn transfer(&self, to: &str, amount: i64) -> Result<Vec<TxReceipt>> {
        let tx = self.build_own_transfer(to, amount);
        let tx_id = self.submit_tx(tx)?;
        Ok(self.wait_for_confirmations(&[tx_id]).await)
    }

    /// Publish a capsule: pay the publish fee, wait for confirmations,
    /// store the full record locally and broadcast the metadata.
    pub async fn publish_capsule(
        &self,
        content: Value,
        tags: Vec<String>,
        price: Option<CapsulePrice>,
    ) -> Result<PublishCapsuleOutcome> {
        let mut receipts = Vec::new();
        if self.cfg.publish_fee > 0 {
            let platform = self.wait_for_platform_account().await?;
            if platform != self.account_id() {
                let tx = self.build_own_transfer(&platform, self.cfg.publish_fee);
                let tx_id = self.submit_tx(tx)?;
                receipts = self.wait_for_confirmations(&[tx_id]).await;
            }
        }
        let record = CapsuleRecord {
            asset_id: capsule::asset_id_for(&content),
            capsule_type: String::new(),
            confidence: 0.0,
            attribution: capsule::Attribution {
                creator: self.account_id().to_string(),
            },
            tags,
            price: price.unwrap_or(CapsulePrice {
                amount: 0,
                token: self.cfg.token.clone(),
                creator_share: 0.9,
            }),
            status: String::new(),
            created_at: now_ms(),
            content: Some(content),
            content_hash: None,
        };
        let stored = self.capsules.store(record)?;
        let view = CapsuleStore::public_view(&stored);
        self.gossip.broadcast(WireMessage::new(
            MessageKind::Capsule,
            serde_json::to_value(&view)?,
        ));
        tracing::info!(asset = %stored.asset_id, "published capsule");
        Ok(PublishCapsuleOutcome {
            capsule: stored,
            receipts,
        })
    }

    /// Publish a task: optional fee, then fund the deterministic escrow
    /// account with the bounty. The task opens once the escrow balance is
    /// observed in the replicated log.
    pub async fn publish_task(
        &self,
        description: &str,
        bounty_amount: i64,
        tags: Vec<String>,
    ) -> Result<PublishTaskOutcome> {
        let task = {
            let mut bazaar = self.bazaar.lock().await;
            bazaar.create_local(
                description,
                None,
                TaskBounty {
                    amount: bounty_amount,
                    token: self.cfg.token.clone(),
                },
                tags,
            )?
        };
        let mut tx_ids = Vec::new();
        if self.cfg.publish_fee > 0 {
            let platform = self.wait_for_platform_account().await?;
            if platform != self.account_id() {
                let fee = self.build_own_transfer(&platform, self.cfg.publish_fee);
                tx_ids.push(self.submit_tx(fee)?);
            }
        }
        let escrow = self.build_own_transfer(&task.escrow_account_id, bounty_amount);
        tx_ids.push(self.submit_tx(escrow)?);
        let receipts = self.wait_for_confirmations(&tx_ids).await;
        self.on_ledger_advance().await;
        let task = self
            .bazaar
            .lock()
            .await
            .get(&task.task_id)
            .unwrap_or(task);
        self.gossip.broadcast(WireMessage::new(
            MessageKind::Task,
            serde_json::to_value(&task)?,
        ));
        tracing::info!(task = %task.task_id, bounty = bounty_amount, "published task");
        Ok(PublishTaskOutcome { task, receipts })
    }

    /// Purchase a capsule: split the price between creator and platform,
    /// wait for all transfers to confirm, then unlock the content.
    pub async fn purchase_capsule(&self, asset_id: &str) -> Result<PurchaseOutcome> {
        let record = self
            .capsules
            .get(asset_id)?
            .ok_or_else(|| MeshError::UnknownCapsule(asset_id.to_string()))?;
        let buyer = self.account_id().to_string();
        let creator = record.attribution.creator.clone();
        let price = record.price.amount;
        if price <= 0 || creator == buyer {
            self.capsules.grant_access(asset_id, &buyer)?;
            return Ok(PurchaseOutcome {
                confirmed: true,
                content: record.content,
                receipts: vec![],
            });
        }
        let share = record.price.creator_share.clamp(0.0, 1.0);
        let creator_amount = (price as f64 * share).floor() as i64;
        let platform_amount = price - creator_amount;
        let mut tx_ids = Vec::new();
        if creator_amount > 0 {
            let tx = self.build_own_transfer(&creator, creator_amount);
            tx_ids.push(self.submit_tx(tx)?);
        }
        if platform_amount > 0 {
            let platform = self.wait_for_platform_account().await?;
            let tx = self.build_own_transfer(&platform, platform_amount);
            tx_ids.push(self.submit_tx(tx)?);
        }
        let receipts = self.wait_for_confirmations(&tx_ids).await;
        let confirmed = receipts.iter().all(|r| r.confirmed);
        if confirmed {
            self.capsules.grant_access(asset_id, &buyer)?;
        }
        Ok(PurchaseOutcome {
            confirmed,
            content: if confirmed { record.content } else { None },
            receipts,
        })
    }

    /// Capsule discovery for the operator surface: local store first,
    /// then a direct query to nearby peers.
    pub async fn find_memories(&self, filter_value: Value) -> Result<Vec<Value>> {
        let filter = CapsuleFilter::from_value(&filter_value);
        let local = self.capsules.query(&filter)?;
        if !local.is_empty() {
            let views = local
                .iter()
                .map(|r| serde_json::to_value(CapsuleStore::public_view(r)))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            return Ok(views);
        }
        self.gossip.query_memories(filter_value).await
    }

    /// Connected-peer summaries for the operator surface.
    pub fn peers(&self) -> Vec<Value> {
        self.gossip.peer_summaries()
    }

    /// Like a completed task: local rating update plus broadcast.
    pub async fn like_task(&self, task_id: &str) -> Result<bool> {
        let Some(task) = self.bazaar.lock().await.get(task_id) else {
            return Err(MeshError::InvalidTask(format!("unknown task {}", task_id)));
        };
        let Some(winner) = task.completed_by.clone() else {
            return Err(MeshError::InvalidTask("task has no winner yet".into()));
        };
        let fresh = self
            .ratings
            .add_like(task_id, &winner, self.node_id())?;
        if fresh {
            self.gossip.broadcast(WireMessage::new(
                MessageKind::TaskLike,
                json!({
                    "taskId": task_id,
                    "winnerNodeId": winner,
                    "likedBy": self.node_id(),
                }),
            ));
        }
        Ok(fresh)
    }

    /// Poll the local ledger until every listed transaction reaches the
    /// configured confirmation target, or the per-action timeout elapses.
    /// Always returns the observed counts; a timeout is not a failure.
    pub async fn wait_for_confirmations(&self, tx_ids: &[String]) -> Vec<TxReceipt> {
        let target = self.cfg.confirmation_target;
        let deadline = now_ms() + self.cfg.confirm_timeout_ms as i64;
        loop {
            let receipts: Vec<TxReceipt> = tx_ids
                .iter()
                .map(|tx_id| {
                    let confirmations = self.ledger.confirmations(tx_id).unwrap_or(0);
                    TxReceipt {
                        tx_id: tx_id.clone(),
                        confirmations,
                        confirmed: confirmations >= target,
                    }
                })
                .collect();
            if receipts.iter().all(|r| r.confirmed) || now_ms() >= deadline {
                if !receipts.iter().all(|r| r.confirmed) {
                    tracing::warn!(
                        wanted = target,
                        "confirmation wait timed out; returning observed counts"
                    );
                }
                return receipts;
            }
            tokio::time::sleep(Duration::from_millis(CONFIRM_POLL_MS)).await;
        }
    }

    /// Everything derived from the ledger is refreshed here after a
    /// successful apply: escrow-funded tasks open, in-flight transactions
    /// that reached the log stop re-broadcasting.
    pub async fn on_ledger_advance(&self) {
        {
            let mut bazaar = self.bazaar.lock().await;
            if let Err(e) = bazaar.promote_funded(&self.ledger) {
                tracing::warn!(error = %e, "funding scan failed");
            }
        }
        let mut pending = self.pending.lock();
        pending.retain(|tx_id, _| self.ledger.confirmations(tx_id).is_none());
    }

    /// Dispatch one gossip message. Handlers never panic across the
    /// scheduler; unrecoverable errors log and drop the message.
    pub async fn handle_inbound(&self, inbound: Inbound) {
        let peer = inbound.peer_id;
        let message = inbound.message;
        match message.kind {
            MessageKind::Capsule => self.on_capsule(message.payload),
            MessageKind::Task => self.on_task(message.payload).await,
            MessageKind::TaskBid => self.on_task_bid(message.payload).await,
            MessageKind::TaskAssigned => self.on_task_assigned(message.payload).await,
            MessageKind::TaskCompleted => {
                let task_id = str_field(&message.payload, "taskId");
                let node_id = str_field(&message.payload, "nodeId");
                let account_id = opt_str_field(&message.payload, "accountId");
                let result = message.payload.get("result").cloned();
                if !task_id.is_empty() && !node_id.is_empty() {
                    self.on_task_completed(&task_id, &node_id, account_id, result)
                        .await;
                }
            }
            MessageKind::TaskFailed => self.on_task_failed(message.payload).await,
            MessageKind::TaskLike => self.on_task_like(message.payload),
            MessageKind::Tx => self.on_remote_tx(message.payload).await,
            MessageKind::TxLog => self.on_tx_log(message.payload, &peer).await,
            MessageKind::TxLogRequest => self.on_tx_log_request(&message, &peer),
            MessageKind::TxLogBatch => self.on_tx_log_batch(message.payload, &peer).await,
            MessageKind::LedgerHeadRequest => {
                let response = WireMessage::new(
                    MessageKind::LedgerHeadResponse,
                    json!({ "lastSeq": self.ledger.last_seq() }),
                );
                self.gossip.send_to_peer(&peer, &response);
            }
            MessageKind::LedgerHeadResponse => {
                let remote_head = message
                    .payload
                    .get("lastSeq")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if remote_head > self.ledger.last_seq() {
                    self.request_log_from(&peer, self.ledger.last_seq());
                }
            }
            MessageKind::Query => self.on_query(&message, &peer),
            // Handshake, ping/pong and query responses are consumed by
            // the transport before delivery.
            _ => {}
        }
    }

    fn on_capsule(&self, payload: Value) {
        match serde_json::from_value::<CapsuleRecord>(payload) {
            Ok(mut record) => {
                // Private content never travels the mesh.
                record.content = None;
                if let Err(e) = self.capsules.store(record) {
                    tracing::debug!(error = %e, "dropping capsule record");
                }
            }
            Err(e) => tracing::debug!(error = %e, "malformed capsule payload"),
        }
    }

    async fn on_task(&self, payload: Value) {
        match serde_json::from_value::<TaskRecord>(payload) {
            Ok(task) => {
                let mut bazaar = self.bazaar.lock().await;
                match bazaar.ingest_remote(task) {
                    Ok(true) => {
                        let _ = bazaar.promote_funded(&self.ledger);
                    }
                    Ok(false) => {}
                    Err(e) => tracing::debug!(error = %e, "dropping task record"),
                }
            }
            Err(e) => tracing::debug!(error = %e, "malformed task payload"),
        }
    }

    async fn on_task_bid(&self, payload: Value) {
        let task_id = str_field(&payload, "taskId");
        let Ok(bid) =
            serde_json::from_value::<TaskBid>(payload.get("bid").cloned().unwrap_or(Value::Null))
        else {
            tracing::debug!("malformed bid payload");
            return;
        };
        if task_id.is_empty() {
            return;
        }
        let mut bazaar = self.bazaar.lock().await;
        match bazaar.add_bid(&task_id, bid) {
            Ok(_) => {}
            Err(MeshError::TaskNotOpen) => {
                tracing::debug!(task = %task_id, "late bid rejected");
            }
            Err(e) => tracing::debug!(task = %task_id, error = %e, "bid dropped"),
        }
    }

    async fn on_task_assigned(&self, payload: Value) {
        let task_id = str_field(&payload, "taskId");
        let assigned_to = str_field(&payload, "assignedTo");
        let assigned_at = payload
            .get("assignedAt")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(now_ms);
        if task_id.is_empty() || assigned_to.is_empty() {
            return;
        }
        let mut bazaar = self.bazaar.lock().await;
        if let Err(e) = bazaar.mark_assigned(&task_id, &assigned_to, assigned_at) {
            tracing::debug!(task = %task_id, error = %e, "assignment dropped");
        }
    }

    /// Shared completion path for gossip deliveries and locally executed
    /// tasks: record the outcome, update the winner's rating, and (on the
    /// leader) release the escrow through the ledger.
    pub async fn on_task_completed(
        &self,
        task_id: &str,
        node_id: &str,
        account_id: Option<String>,
        result: Option<Value>,
    ) {
        let completed_at = now_ms();
        let outcome = {
            let mut bazaar = self.bazaar.lock().await;
            bazaar.mark_completed(task_id, node_id, completed_at, result)
        };
        match outcome {
            Ok(CompletionOutcome::Recorded { duration_ms }) => {
                if let Some(duration) = duration_ms {
                    if let Err(e) = self.ratings.record_completion(node_id, duration) {
                        tracing::warn!(error = %e, "rating update failed");
                    }
                }
                self.settle_if_leader(task_id, account_id).await;
            }
            Ok(CompletionOutcome::AlreadyCompleted) => {
                // Settlement may still be owed if we learned of the
                // completion before the ledger caught up.
                self.settle_if_leader(task_id, account_id).await;
            }
            Ok(CompletionOutcome::UnknownTask) => {
                tracing::debug!(task = %task_id, "completion for unknown task");
            }
            Err(e) => tracing::warn!(task = %task_id, error = %e, "completion dropped"),
        }
    }

    /// Leader-only settlement: a single `escrow_release` draining the
    /// task's escrow account to the winner, broadcast as a log entry.
    async fn settle_if_leader(&self, task_id: &str, winner_account: Option<String>) {
        if !self.is_leader() {
            return;
        }
        let task = {
            let bazaar = self.bazaar.lock().await;
            bazaar.get(task_id)
        };
        let Some(task) = task else { return };
        if task.settled || task.status != TaskStatus::Completed {
            return;
        }
        let Some(winner_account) = winner_account else {
            tracing::warn!(task = %task_id, "completion carries no account; cannot settle");
            return;
        };
        let escrow = task.escrow_account_id.clone();
        if self.ledger.balance(&escrow) < task.bounty.amount {
            tracing::warn!(task = %task_id, "escrow not funded; skipping release");
            return;
        }
        let release = Transaction::build_signed(
            TxType::EscrowRelease,
            &escrow,
            &winner_account,
            task.bounty.amount,
            self.ledger.nonce(&escrow) + 1,
            now_ms(),
            &self.wallet,
        );
        match self.ledger.submit_local_as_leader(release.clone()) {
            Ok((seq, tx_id)) => {
                tracing::info!(task = %task_id, %tx_id, "escrow released");
                self.broadcast_log_entry(LogEntry { seq, tx: release });
                let mut bazaar = self.bazaar.lock().await;
                let _ = bazaar.mark_settled(task_id);
                drop(bazaar);
                self.on_ledger_advance().await;
            }
            Err(e) => tracing::warn!(task = %task_id, error = %e, "escrow release rejected"),
        }
    }

    async fn on_task_failed(&self, payload: Value) {
        let task_id = str_field(&payload, "taskId");
        let node_id = str_field(&payload, "nodeId");
        if task_id.is_empty() || node_id.is_empty() {
            return;
        }
        let changed = {
            let mut bazaar = self.bazaar.lock().await;
            bazaar.mark_failed(&task_id, &node_id).unwrap_or(false)
        };
        if changed {
            if let Err(e) = self.ratings.record_failure(&node_id) {
                tracing::warn!(error = %e, "failure rating update failed");
            }
        }
    }

    fn on_task_like(&self, payload: Value) {
        let task_id = str_field(&payload, "taskId");
        let winner = str_field(&payload, "winnerNodeId");
        let liked_by = str_field(&payload, "likedBy");
        if task_id.is_empty() || winner.is_empty() {
            return;
        }
        match self.ratings.add_like(&task_id, &winner, &liked_by) {
            Ok(true) => tracing::debug!(task = %task_id, "like recorded"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "like dropped"),
        }
    }

    /// Follower-submitted transaction reaching the leader.
    async fn on_remote_tx(&self, payload: Value) {
        if !self.is_leader() {
            return;
        }
        let tx = match serde_json::from_value::<Transaction>(payload) {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!(error = %e, "malformed tx payload");
                return;
            }
        };
        match self.ledger.submit_local_as_leader(tx.clone()) {
            Ok((seq, tx_id)) => {
                tracing::debug!(seq, %tx_id, "applied remote tx");
                self.broadcast_log_entry(LogEntry { seq, tx });
                self.on_ledger_advance().await;
            }
            Err(TxRejection::DuplicateTx(_)) => {}
            Err(e) => tracing::debug!(error = %e, "remote tx rejected"),
        }
    }

    async fn on_tx_log(&self, payload: Value, peer: &str) {
        let entry = match serde_json::from_value::<LogEntry>(payload) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "malformed log entry");
                return;
            }
        };
        if self.is_leader() {
            // The leader is the writer; its own entries echo back here.
            return;
        }
        match self.ledger.apply_remote_entry(entry) {
            Ok(RemoteApply::Applied { applied, .. }) => {
                if applied > 0 {
                    self.on_ledger_advance().await;
                }
            }
            Ok(RemoteApply::Buffered { have, .. }) => {
                self.request_log_from(peer, have);
            }
            Err(e) => tracing::debug!(error = %e, "log entry rejected"),
        }
    }

    fn on_tx_log_request(&self, message: &WireMessage, peer: &str) {
        let since = message
            .payload
            .get("sinceSeq")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let limit = message
            .payload
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(BATCH_PAGE_SIZE);
        match self.ledger.entries_since(since, limit) {
            Ok((entries, has_more)) => {
                let response = WireMessage::new(
                    MessageKind::TxLogBatch,
                    json!({
                        "entries": entries,
                        "lastSeq": self.ledger.last_seq(),
                        "hasMore": has_more,
                    }),
                );
                self.gossip.send_to_peer(peer, &response);
            }
            Err(e) => tracing::warn!(error = %e, "log request failed"),
        }
    }

    async fn on_tx_log_batch(&self, payload: Value, peer: &str) {
        if self.is_leader() {
            return;
        }
        let entries: Vec<LogEntry> = payload
            .get("entries")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let mut advanced = false;
        for entry in entries {
            match self.ledger.apply_remote_entry(entry) {
                Ok(RemoteApply::Applied { applied, .. }) => advanced |= applied > 0,
                Ok(RemoteApply::Buffered { .. }) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "batch entry rejected");
                    break;
                }
            }
        }
        if advanced {
            self.on_ledger_advance().await;
        }
        let remote_head = payload.get("lastSeq").and_then(|v| v.as_u64()).unwrap_or(0);
        let has_more = payload
            .get("hasMore")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if has_more || remote_head > self.ledger.last_seq() {
            self.request_log_from(peer, self.ledger.last_seq());
        }
    }

    fn on_query(&self, message: &WireMessage, peer: &str) {
        let query_type = str_field(&message.payload, "type");
        if query_type != "memories" {
            return;
        }
        let filter = CapsuleFilter::from_value(
            message.payload.get("filter").unwrap_or(&Value::Null),
        );
        let memories: Vec<CapsuleRecord> = self
            .capsules
            .query(&filter)
            .unwrap_or_default()
            .iter()
            .map(CapsuleStore::public_view)
            .collect();
        let mut response = WireMessage::new(
            MessageKind::QueryResponse,
            json!({ "memories": memories }),
        );
        response.request_id = message.request_id.clone();
        self.gossip.send_to_peer(peer, &response);
    }

    fn request_log_from(&self, peer: &str, since_seq: u64) {
        let request = WireMessage::new(
            MessageKind::TxLogRequest,
            json!({ "sinceSeq": since_seq, "limit": BATCH_PAGE_SIZE }),
        );
        self.gossip.send_to_peer(peer, &request);
    }

    /// Spawn the coordinator's periodic workers. Each runs until the
    /// process exits; cadences per the concurrency model.
    pub fn spawn_workers(self: Arc<Self>) {
        // Follower transaction re-broadcast: 2 s sweep, per-tx
        // exponential back-off capped at 15 s.
        if !self.is_leader() {
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(Duration::from_millis(PENDING_SWEEP_MS));
                loop {
                    tick.tick().await;
                    node.sweep_pending();
                }
            });

            // Follower ledger sync: incremental when behind, full resync
            // every sixth tick to recover from silent divergence.
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(Duration::from_secs(SYNC_INTERVAL_SECS));
                let mut ticks: u64 = 0;
                loop {
                    tick.tick().await;
                    ticks += 1;
                    let Some(peer) = node.gossip.best_peer() else {
                        continue;
                    };
                    if ticks % FULL_SYNC_EVERY_TICKS == 0 {
                        node.request_log_from(&peer, 0);
                    } else {
                        let head_probe = WireMessage::new(
                            MessageKind::LedgerHeadRequest,
                            json!({ "lastSeq": node.ledger.last_seq() }),
                        );
                        node.gossip.send_to_peer(&peer, &head_probe);
                    }
                }
            });
        }

        // Escrow funding scan: cheap safety net behind the event-driven
        // promotion in on_ledger_advance.
        let node = Arc::clone(&self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(PENDING_SWEEP_MS));
            loop {
                tick.tick().await;
                let mut bazaar = node.bazaar.lock().await;
                let _ = bazaar.promote_funded(&node.ledger);
            }
        });
    }

    fn sweep_pending(&self) {
        let now = now_ms();
        let mut to_rebroadcast = Vec::new();
        {
            let mut pending = self.pending.lock();
            // A pending transaction only leaves the queue once it is
            // observed in the replicated log.
            pending.retain(|tx_id, entry| {
                if self.ledger.confirmations(tx_id).is_some() {
                    return false;
                }
                if now >= entry.next_at {
                    entry.backoff_ms = (entry.backoff_ms * 2).min(PENDING_BACKOFF_CAP_MS);
                    entry.next_at = now + entry.backoff_ms;
                    to_rebroadcast.push(entry.tx.clone());
                }
                true
            });
        }
        for tx in to_rebroadcast {
            match serde_json::to_value(&tx) {
                Ok(payload) => {
                    tracing::debug!(tx_id = %tx.tx_id, "re-broadcasting pending tx");
                    self.gossip
                        .broadcast(WireMessage::new(MessageKind::Tx, payload));
                }
                Err(e) => tracing::warn!(error = %e, "serialize pending tx failed"),
            }
        }
    }

    /// Operator-surface snapshot: balances, ledger head, task and peer
    /// summaries.
    pub async fn stats(&self) -> Value {
        let bazaar = self.bazaar.lock().await;
        json!({
            "nodeId": self.node_id(),
            "accountId": self.account_id(),
            "isLeader": self.is_leader(),
            "balance": self.ledger.balance(self.account_id()),
            "lastSeq": self.ledger.last_seq(),
            "capsules": self.capsules.count(),
            "tasks": bazaar.stats(),
            "peers": self.gossip.peer_count(),
            "network": crate::network::metrics(),
        })
    }
}

fn str_field(payload: &Value, field: &str) -> String {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn opt_str_field(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(String::from)
}
