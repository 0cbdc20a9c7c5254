// src/rating.rs
// Local reputation engine. Completion latency feeds an EWMA speed score;
// completions, failures and peer likes fold into a single integer score
// that gates bidding eligibility.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::Result;
use crate::storage::{self, MeshDb};

const RATING_PREFIX: &str = "rating:";
const LIKE_PREFIX: &str = "rating_like:";

/// EWMA smoothing factor.
const ALPHA: f64 = 0.2;
/// Completion at exactly this duration scores 10000.
const TARGET_MS: i64 = 30 * 60 * 1000;
/// Disqualification only applies after this many completions.
const MIN_TASKS: u64 = 10;
/// Nodes below this score (with enough history) may not accept work.
const THRESHOLD: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRecord {
    pub node_id: String,
    pub ewma: f64,
    pub completed: u64,
    pub failed: u64,
    pub likes: u64,
    pub score: i64,
    pub updated_at: i64,
}

impl RatingRecord {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            ewma: 0.0,
            completed: 0,
            failed: 0,
            likes: 0,
            score: 0,
            updated_at: 0,
        }
    }

    fn recompute_score(&mut self) {
        let raw = self.ewma + 2.0 * self.completed as f64 + self.likes as f64
            - 10.0 * self.failed as f64;
        self.score = raw.round().max(0.0) as i64;
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

pub struct RatingStore {
    db: MeshDb,
}

impl RatingStore {
    pub fn new(db: MeshDb) -> Self {
        Self { db }
    }

    pub fn get(&self, node_id: &str) -> Result<RatingRecord> {
        Ok(
            storage::get(&self.db, &format!("{}{}", RATING_PREFIX, node_id))?
                .unwrap_or_else(|| RatingRecord::new(node_id)),
        )
    }

    pub fn all(&self) -> Result<Vec<RatingRecord>> {
        Ok(storage::iter_prefix(&self.db, RATING_PREFIX)?)
    }

    /// Record a completed task and its wall-clock duration.
    pub fn record_completion(&self, node_id: &str, duration_ms: i64) -> Result<RatingRecord> {
        let mut record = self.get(node_id)?;
        let speed = speed_score(duration_ms);
        record.ewma = if record.completed == 0 {
            // First latency sample seeds the average directly.
            speed
        } else {
            ALPHA * speed + (1.0 - ALPHA) * record.ewma
        };
        record.completed += 1;
        record.recompute_score();
        self.put(&record)?;
        Ok(record)
    }

    pub fn record_failure(&self, node_id: &str) -> Result<RatingRecord> {
        let mut record = self.get(node_id)?;
        record.failed += 1;
        record.recompute_score();
        self.put(&record)?;
        Ok(record)
    }

    /// Register a like for a completed task. At most one like per task;
    /// returns false (and changes nothing) if the task was already liked.
    pub fn add_like(&self, task_id: &str, winner_node_id: &str, liked_by: &str) -> Result<bool> {
        let like_key = format!("{}{}", LIKE_PREFIX, task_id);
        if storage::exists(&self.db, &like_key) {
            return Ok(false);
        }
        storage::put(
            &self.db,
            &like_key,
            &json!({
                "winner": winner_node_id,
                "likedBy": liked_by,
                "at": chrono::Utc::now().timestamp_millis(),
            }),
        )?;
        let mut record = self.get(winner_node_id)?;
        record.likes += 1;
        record.recompute_score();
        self.put(&record)?;
        Ok(true)
    }

    /// A node with enough history and a score below the threshold may not
    /// accept work.
    pub fn is_disqualified(&self, node_id: &str) -> bool {
        match self.get(node_id) {
            Ok(record) => record.completed >= MIN_TASKS && record.score < THRESHOLD,
            Err(_) => false,
        }
    }

    fn put(&self, record: &RatingRecord) -> Result<()> {
        storage::put(
            &self.db,
            &format!("{}{}", RATING_PREFIX, record.node_id),
            record,
        )?;
        Ok(())
    }
}

/// `clamp(round(targetMs / durationMs * 10000), 0, 10000)`; instant
/// completions saturate at the cap.
fn speed_score(duration_ms: i64) -> f64 {
    let duration = duration_ms.max(1) as f64;
    let raw = (TARGET_MS as f64 / duration * 10_000.0).round();
    raw.clamp(0.0, 10_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_score_scales_with_duration() {
        // Completing in exactly the target time scores 10000.
        assert_eq!(speed_score(TARGET_MS), 10_000.0);
        // Twice as slow halves the score.
        assert_eq!(speed_score(TARGET_MS * 2), 5_000.0);
        // Faster than target saturates at the cap.
        assert_eq!(speed_score(TARGET_MS / 2), 10_000.0);
        assert_eq!(speed_score(0), 10_000.0);
    }

    #[test]
    fn score_formula() {
        let mut record = RatingRecord::new("node_x");
        record.ewma = 100.0;
        record.completed = 3;
        record.likes = 2;
        record.failed = 1;
        record.recompute_score();
        assert_eq!(record.score, 98);

        record.failed = 20;
        record.recompute_score();
        assert_eq!(record.score, 0);
    }
}
