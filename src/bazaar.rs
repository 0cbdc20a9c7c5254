// src/bazaar.rs
// Task lifecycle: publish -> escrow funding -> bidding -> deterministic
// winner selection -> completion -> settlement through the ledger.
// Tasks are snapshot to storage on every mutation and rehydrated on
// restart.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::errors::{MeshError, Result};
use crate::ledger::{escrow_account_for, Ledger};
use crate::storage::{self, MeshDb};

const TASK_PREFIX: &str = "task:";

/// Voting stays open this long after the first bid before the publisher
/// computes the winner.
pub const VOTING_WINDOW_MS: i64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    PendingEscrow,
    Open,
    Voting,
    Assigned,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBounty {
    pub amount: i64,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBid {
    pub node_id: String,
    pub amount: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub description: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    pub bounty: TaskBounty,
    pub tags: Vec<String>,
    pub publisher: String,
    pub escrow_account_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub bids: Vec<TaskBid>,
    pub published_at: i64,
    #[serde(default)]
    pub voting_started_at: Option<i64>,
    #[serde(default)]
    pub bids_frozen: bool,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<i64>,
    #[serde(default)]
    pub completed_by: Option<String>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub settled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub open: usize,
    pub completed: usize,
    pub total_rewards: i64,
}

/// Outcome of recording a completion.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// Newly recorded; carries the assignment-to-completion duration when
    /// a valid `assignedAt` exists.
    Recorded { duration_ms: Option<i64> },
    AlreadyCompleted,
    UnknownTask,
}

/// `task_` + first 16 hex chars of SHA-256(description || publisher ||
/// publishedAt).
pub fn task_id_for(description: &str, publisher: &str, published_at: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    hasher.update(publisher.as_bytes());
    hasher.update(published_at.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("task_{}", &digest[..16])
}

pub struct TaskBazaar {
    pub node_id: String,
    db: MeshDb,
    tasks: HashMap<String, TaskRecord>,
}

impl TaskBazaar {
    /// Rehydrate tasks from storage. Completed tasks come back settled;
    /// their escrow was released before the snapshot was written.
    pub fn open(node_id: String, db: MeshDb) -> Result<Self> {
        let mut tasks = HashMap::new();
        for mut task in storage::iter_prefix::<TaskRecord>(&db, TASK_PREFIX)? {
            if task.status == TaskStatus::Completed {
                task.settled = true;
            }
            tasks.insert(task.task_id.clone(), task);
        }
        if !tasks.is_empty() {
            tracing::info!(count = tasks.len(), "rehydrated tasks");
        }
        Ok(Self { node_id, db, tasks })
    }

    /// Create a locally-published task in `pending_escrow`. The caller
    /// (coordinator) funds the escrow account through the ledger and the
    /// funding scan later promotes the task to `open`.
    pub fn create_local(
        &mut self,
        description: &str,
        task_type: Option<String>,
        bounty: TaskBounty,
        tags: Vec<String>,
    ) -> Result<TaskRecord> {
        if description.trim().is_empty() {
            return Err(MeshError::InvalidTask("missing description".into()));
        }
        if bounty.amount <= 0 {
            return Err(MeshError::InvalidTask("missing bounty".into()));
        }
        let published_at = chrono::Utc::now().timestamp_millis();
        let task_id = task_id_for(description, &self.node_id, published_at);
        let task = TaskRecord {
            task_id: task_id.clone(),
            description: description.to_string(),
            task_type,
            escrow_account_id: escrow_account_for(&task_id),
            bounty,
            tags,
            publisher: self.node_id.clone(),
            status: TaskStatus::PendingEscrow,
            bids: Vec::new(),
            published_at,
            voting_started_at: None,
            bids_frozen: false,
            assigned_to: None,
            assigned_at: None,
            completed_by: None,
            completed_at: None,
            result: None,
            settled: false,
        };
        self.tasks.insert(task_id.clone(), task.clone());
        self.persist(&task_id);
        Ok(task)
    }

    /// Track a task that arrived over gossip. First write wins; the
    /// escrow account id is always recomputed locally, never trusted.
    pub fn ingest_remote(&mut self, mut task: TaskRecord) -> Result<bool> {
        if task.task_id.is_empty() || self.tasks.contains_key(&task.task_id) {
            return Ok(false);
        }
        task.escrow_account_id = escrow_account_for(&task.task_id);
        let task_id = task.task_id.clone();
        self.tasks.insert(task_id.clone(), task);
        self.persist(&task_id);
        Ok(true)
    }

    /// Promote `pending_escrow` tasks whose escrow balance covers the
    /// bounty. Called on every ledger advance.
    pub fn promote_funded(&mut self, ledger: &Ledger) -> Result<Vec<String>> {
        let mut promoted = Vec::new();
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::PendingEscrow
                && ledger.balance(&task.escrow_account_id) >= task.bounty.amount
            {
                task.status = TaskStatus::Open;
                promoted.push(task.task_id.clone());
            }
        }
        for task_id in &promoted {
            tracing::info!(task = %task_id, "escrow funded, task open");
            self.persist(task_id);
        }
        Ok(promoted)
    }

    /// Append a bid. At most one bid per `(taskId, nodeId)`; the first
    /// bid moves the task to `voting`. Bids against a frozen list are
    /// rejected with `TaskNotOpen`.
    pub fn add_bid(&mut self, task_id: &str, bid: TaskBid) -> Result<TaskRecord> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::InvalidTask(format!("unknown task {}", task_id)))?;
        if task.bids_frozen
            || !matches!(task.status, TaskStatus::Open | TaskStatus::Voting)
        {
            return Err(MeshError::TaskNotOpen);
        }
        if task.bids.iter().any(|b| b.node_id == bid.node_id) {
            return Ok(task.clone());
        }
        task.bids.push(bid);
        if task.status == TaskStatus::Open {
            task.status = TaskStatus::Voting;
            task.voting_started_at = Some(chrono::Utc::now().timestamp_millis());
        }
        let snapshot = task.clone();
        self.persist(task_id);
        Ok(snapshot)
    }

    /// Tasks this node published whose voting window has elapsed.
    pub fn due_for_assignment(&self, now: i64) -> Vec<TaskRecord> {
        self.tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Voting
                    && t.publisher == self.node_id
                    && now - t.voting_started_at.unwrap_or(t.published_at) >= VOTING_WINDOW_MS
            })
            .cloned()
            .collect()
    }

    /// Freeze the bid list and compute the winner: bids sorted by
    /// `(amount asc, timestamp asc, nodeId asc)`. The extra key makes
    /// the order total so every observer agrees. Later bids are rejected.
    pub fn decide_winner(&mut self, task_id: &str) -> Result<Option<TaskBid>> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::InvalidTask(format!("unknown task {}", task_id)))?;
        task.bids_frozen = true;
        let winner = winner_of(&task.bids);
        self.persist(task_id);
        Ok(winner)
    }

    pub fn mark_assigned(&mut self, task_id: &str, node_id: &str, assigned_at: i64) -> Result<()> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return Ok(());
        };
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            return Ok(());
        }
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(node_id.to_string());
        task.assigned_at = Some(assigned_at);
        task.bids_frozen = true;
        self.persist(task_id);
        Ok(())
    }

    /// Record a completion. Idempotent per task; the first call wins.
    pub fn mark_completed(
        &mut self,
        task_id: &str,
        completed_by: &str,
        completed_at: i64,
        result: Option<Value>,
    ) -> Result<CompletionOutcome> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return Ok(CompletionOutcome::UnknownTask);
        };
        if task.status == TaskStatus::Completed {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }
        task.status = TaskStatus::Completed;
        task.completed_by = Some(completed_by.to_string());
        task.completed_at = Some(completed_at);
        task.result = result;
        task.bids_frozen = true;
        let duration_ms = task
            .assigned_at
            .filter(|at| completed_at >= *at)
            .map(|at| completed_at - at);
        self.persist(task_id);
        Ok(CompletionOutcome::Recorded { duration_ms })
    }

    pub fn mark_failed(&mut self, task_id: &str, node_id: &str) -> Result<bool> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.status == TaskStatus::Completed {
            return Ok(false);
        }
        task.status = TaskStatus::Failed;
        task.completed_by = Some(node_id.to_string());
        self.persist(task_id);
        Ok(true)
    }

    /// Flag a completed task's escrow as released so settlement is not
    /// attempted twice.
    pub fn mark_settled(&mut self, task_id: &str) -> Result<()> {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.settled = true;
            self.persist(task_id);
        }
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.get(task_id).cloned()
    }

    /// All tasks, newest first.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        tasks
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            total: self.tasks.len(),
            open: self
                .tasks
                .values()
                .filter(|t| matches!(t.status, TaskStatus::Open | TaskStatus::Voting))
                .count(),
            completed: self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .count(),
            total_rewards: self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| t.bounty.amount)
                .sum(),
        }
    }

    // Storage failures are fatal: a task map that diverges from its
    // snapshots must not keep running.
    fn persist(&self, task_id: &str) {
        if let Some(task) = self.tasks.get(task_id) {
            if let Err(e) =
                storage::put_sync(&self.db, &format!("{}{}", TASK_PREFIX, task_id), task)
            {
                tracing::error!(task = %task_id, error = %e, "FATAL: task snapshot failed");
                std::process::exit(1);
            }
        }
    }
}

/// Deterministic winner: lowest amount, then earliest timestamp, then
/// lowest node id.
pub fn winner_of(bids: &[TaskBid]) -> Option<TaskBid> {
    let mut sorted: Vec<TaskBid> = bids.to_vec();
    sorted.sort_by(|a, b| {
        a.amount
            .cmp(&b.amount)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    sorted.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(node: &str, amount: i64, ts: i64) -> TaskBid {
        TaskBid {
            node_id: node.to_string(),
            amount,
            timestamp: ts,
        }
    }

    #[test]
    fn winner_prefers_lowest_amount_then_time_then_node() {
        let bids = vec![
            bid("node_c", 90, 30),
            bid("node_a", 80, 20),
            bid("node_b", 80, 10),
        ];
        assert_eq!(winner_of(&bids).unwrap().node_id, "node_b");

        let tied = vec![bid("node_z", 50, 5), bid("node_a", 50, 5)];
        assert_eq!(winner_of(&tied).unwrap().node_id, "node_a");

        assert!(winner_of(&[]).is_none());
    }

    #[test]
    fn task_id_is_deterministic() {
        let a = task_id_for("write a parser", "node_1", 1000);
        let b = task_id_for("write a parser", "node_1", 1000);
        assert_eq!(a, b);
        assert!(a.starts_with("task_"));
        assert_eq!(a.len(), "task_".len() + 16);
        assert_ne!(a, task_id_for("write a parser", "node_1", 1001));
        assert_ne!(a, task_id_for("write a parser", "node_2", 1000));
    }
}
