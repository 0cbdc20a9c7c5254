// src/worker.rs
// Local auto-bidder and executor. Scans open tasks, places one bid per
// task, runs the publisher-side voting countdown, and produces a
// deliverable package when this node wins.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::bazaar::{TaskBid, TaskRecord, TaskStatus};
use crate::errors::MeshError;
use crate::network::wire::{MessageKind, WireMessage};
use crate::node::Node;

/// Voting outcomes are processed at this cadence.
const VOTING_SCAN_SECS: u64 = 5;
/// Open tasks are scanned for bidding every second voting tick.
const BID_SCAN_EVERY_TICKS: u64 = 2;
/// Bid fraction of the bounty.
const BID_RATIO: f64 = 0.9;

pub struct TaskWorker {
    node: Arc<Node>,
    /// Tasks we have already bid on, by bid timestamp.
    bidding: HashMap<String, i64>,
    /// Tasks we won and are executing.
    active: HashSet<String>,
}

impl TaskWorker {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            bidding: HashMap::new(),
            active: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs(VOTING_SCAN_SECS));
        let mut ticks: u64 = 0;
        loop {
            tick.tick().await;
            ticks += 1;
            self.process_voting().await;
            if ticks % BID_SCAN_EVERY_TICKS == 0 {
                self.scan_open_tasks().await;
            }
        }
    }

    /// One bid per eligible open task. A node with enough history and a
    /// score below the threshold is disqualified from bidding.
    async fn scan_open_tasks(&mut self) {
        if self.node.ratings.is_disqualified(self.node.node_id()) {
            tracing::debug!("disqualified; not bidding");
            return;
        }
        let tasks: Vec<TaskRecord> = {
            let bazaar = self.node.bazaar.lock().await;
            bazaar.tasks()
        };
        for task in tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Open)
        {
            // Never bid on our own auctions.
            if task.publisher == self.node.node_id() {
                continue;
            }
            if self.active.contains(&task.task_id) || self.bidding.contains_key(&task.task_id) {
                continue;
            }
            self.submit_bid(task).await;
        }
    }

    async fn submit_bid(&mut self, task: TaskRecord) {
        let bid = TaskBid {
            node_id: self.node.node_id().to_string(),
            amount: (task.bounty.amount as f64 * BID_RATIO).floor() as i64,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.bidding.insert(task.task_id.clone(), bid.timestamp);
        let added = {
            let mut bazaar = self.node.bazaar.lock().await;
            bazaar.add_bid(&task.task_id, bid.clone())
        };
        match added {
            Ok(_) => {
                self.node.gossip.broadcast(
                    WireMessage::new(
                        MessageKind::TaskBid,
                        json!({ "taskId": task.task_id, "bid": bid }),
                    ),
                );
                tracing::info!(task = %task.task_id, amount = bid.amount, "bid placed");
            }
            Err(MeshError::TaskNotOpen) => {
                self.bidding.remove(&task.task_id);
            }
            Err(e) => {
                tracing::debug!(task = %task.task_id, error = %e, "bid not placed");
                self.bidding.remove(&task.task_id);
            }
        }
    }

    /// Publisher side: once the voting window has elapsed, freeze the bid
    /// list, pick the winner deterministically and broadcast the
    /// assignment. If we won our own auction, start executing.
    async fn process_voting(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        let due: Vec<TaskRecord> = {
            let bazaar = self.node.bazaar.lock().await;
            bazaar.due_for_assignment(now)
        };
        for task in due {
            let winner = {
                let mut bazaar = self.node.bazaar.lock().await;
                match bazaar.decide_winner(&task.task_id) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::warn!(task = %task.task_id, error = %e, "winner selection failed");
                        continue;
                    }
                }
            };
            let Some(winner) = winner else { continue };
            let assigned_at = chrono::Utc::now().timestamp_millis();
            {
                let mut bazaar = self.node.bazaar.lock().await;
                let _ = bazaar.mark_assigned(&task.task_id, &winner.node_id, assigned_at);
            }
            self.node.gossip.broadcast(WireMessage::new(
                MessageKind::TaskAssigned,
                json!({
                    "taskId": task.task_id,
                    "assignedTo": winner.node_id,
                    "assignedAt": assigned_at,
                }),
            ));
            tracing::info!(task = %task.task_id, winner = %winner.node_id, "task assigned");
            if winner.node_id == self.node.node_id() {
                self.active.insert(task.task_id.clone());
                self.execute(task.task_id.clone()).await;
            } else {
                self.bidding.remove(&task.task_id);
            }
        }

        // Assignments that arrived over gossip: start work if we won,
        // drop the task from our bidding set otherwise.
        let assigned: Vec<TaskRecord> = {
            let bazaar = self.node.bazaar.lock().await;
            bazaar
                .tasks()
                .into_iter()
                .filter(|t| t.status == TaskStatus::Assigned)
                .collect()
        };
        for task in assigned {
            let Some(assignee) = task.assigned_to.clone() else {
                continue;
            };
            if assignee == self.node.node_id() {
                if self.active.insert(task.task_id.clone()) {
                    self.execute(task.task_id.clone()).await;
                }
            } else {
                self.bidding.remove(&task.task_id);
            }
        }
    }

    /// Produce the deliverable and broadcast completion. Content
    /// synthesis is out of scope; the package is a result summary
    /// archive. Unrecoverable errors broadcast `task_failed` instead.
    async fn execute(&mut self, task_id: String) {
        match self.build_package(&task_id).await {
            Ok((result, package)) => {
                self.node
                    .on_task_completed(
                        &task_id,
                        self.node.node_id(),
                        Some(self.node.account_id().to_string()),
                        Some(result.clone()),
                    )
                    .await;
                self.node.gossip.broadcast(WireMessage::new(
                    MessageKind::TaskCompleted,
                    json!({
                        "taskId": task_id,
                        "nodeId": self.node.node_id(),
                        "accountId": self.node.account_id(),
                        "result": result,
                        "package": package,
                    }),
                ));
                tracing::info!(task = %task_id, "task completed");
            }
            Err(e) => {
                tracing::warn!(task = %task_id, error = %e, "task execution failed");
                {
                    let mut bazaar = self.node.bazaar.lock().await;
                    let _ = bazaar.mark_failed(&task_id, self.node.node_id());
                }
                let _ = self.node.ratings.record_failure(self.node.node_id());
                self.node.gossip.broadcast(WireMessage::new(
                    MessageKind::TaskFailed,
                    json!({ "taskId": task_id, "nodeId": self.node.node_id() }),
                ));
            }
        }
        self.active.remove(&task_id);
        self.bidding.remove(&task_id);
    }

    async fn build_package(
        &self,
        task_id: &str,
    ) -> crate::errors::Result<(serde_json::Value, serde_json::Value)> {
        let task = {
            let bazaar = self.node.bazaar.lock().await;
            bazaar.get(task_id)
        }
        .ok_or_else(|| MeshError::InvalidTask(format!("unknown task {}", task_id)))?;
        let result = json!({
            "taskId": task.task_id,
            "description": task.description,
            "summary": format!("deliverable for '{}'", task.description),
            "producedBy": self.node.node_id(),
            "producedAt": chrono::Utc::now().timestamp_millis(),
        });
        let bytes = serde_json::to_vec(&result)?;
        let package = json!({
            "fileName": format!("{}-deliverable.json", task.task_id),
            "size": bytes.len(),
            "data": BASE64.encode(&bytes),
        });
        Ok((result, package))
    }
}
