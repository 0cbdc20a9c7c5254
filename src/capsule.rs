// src/capsule.rs
// Content-addressed store of memory capsules. Public records travel the
// mesh with `content` nulled; the private content stays with the creator
// and with buyers whose payment confirmed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::errors::{MeshError, Result};
use crate::storage::{self, MeshDb};

const CAPSULE_PREFIX: &str = "capsule:";
const INDEX_PREFIX: &str = "capsule_index:";
const ACCESS_PREFIX: &str = "capsule_access:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsulePrice {
    pub amount: i64,
    pub token: String,
    /// Fraction of the price paid to the creator, remainder to the
    /// platform account. Advisory range [0, 1].
    pub creator_share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribution {
    pub creator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleRecord {
    // The identifier keeps its canonical snake_case name on the wire.
    #[serde(rename = "asset_id")]
    pub asset_id: String,
    #[serde(rename = "type")]
    pub capsule_type: String,
    /// Creator-declared, advisory only; orders query results.
    pub confidence: f64,
    pub attribution: Attribution,
    pub tags: Vec<String>,
    pub price: CapsulePrice,
    pub status: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CapsuleFilter {
    pub capsule_type: Option<String>,
    pub creator: Option<String>,
    pub status: Option<String>,
    pub tags: Vec<String>,
    pub query: Option<String>,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
}

impl CapsuleFilter {
    pub fn from_value(filter: &Value) -> Self {
        Self {
            capsule_type: filter.get("type").and_then(|v| v.as_str()).map(String::from),
            creator: filter
                .get("creator")
                .and_then(|v| v.as_str())
                .map(String::from),
            status: filter
                .get("status")
                .and_then(|v| v.as_str())
                .map(String::from),
            tags: filter
                .get("tags")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|t| t.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            query: filter.get("query").and_then(|v| v.as_str()).map(String::from),
            min_confidence: filter.get("minConfidence").and_then(|v| v.as_f64()),
            limit: filter
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        }
    }
}

/// `asset_id` for a capsule content value: `sha256:` + hex digest of the
/// serialized content.
pub fn asset_id_for(content: &Value) -> String {
    let serialized = serde_json::to_string(content).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// SHA-256 hex of the serialized content, as carried next to nulled
/// content in peer-facing projections.
pub fn content_hash_for(content: &Value) -> String {
    let serialized = serde_json::to_string(content).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct CapsuleStore {
    db: MeshDb,
}

impl CapsuleStore {
    pub fn new(db: MeshDb) -> Self {
        Self { db }
    }

    /// Store a capsule record, idempotent on `asset_id`. Defaults are
    /// filled for status, type and confidence. When content is present
    /// the asset id is recomputed and must match (tamper detection).
    pub fn store(&self, mut record: CapsuleRecord) -> Result<CapsuleRecord> {
        if record.asset_id.is_empty() {
            let content = record
                .content
                .as_ref()
                .ok_or_else(|| MeshError::UnknownCapsule("missing content".into()))?;
            record.asset_id = asset_id_for(content);
        } else if let Some(content) = &record.content {
            if asset_id_for(content) != record.asset_id {
                return Err(MeshError::CapsuleTampered(record.asset_id));
            }
        }
        if record.status.is_empty() {
            record.status = "active".to_string();
        }
        if record.capsule_type.is_empty() {
            record.capsule_type = record
                .content
                .as_ref()
                .and_then(|c| c.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("generic")
                .to_string();
        }
        if record.confidence <= 0.0 {
            record.confidence = 0.5;
        }
        if let Some(content) = &record.content {
            record.content_hash = Some(content_hash_for(content));
        }
        let key = format!("{}{}", CAPSULE_PREFIX, record.asset_id);
        if let Some(existing) = storage::get::<CapsuleRecord>(&self.db, &key)? {
            // Idempotent on asset_id, but a metadata-only copy must not
            // clobber content we already hold.
            if existing.content.is_some() && record.content.is_none() {
                return Ok(existing);
            }
        }
        storage::put(&self.db, &key, &record)?;
        self.index(&record)?;
        Ok(record)
    }

    pub fn get(&self, asset_id: &str) -> Result<Option<CapsuleRecord>> {
        Ok(storage::get(
            &self.db,
            &format!("{}{}", CAPSULE_PREFIX, asset_id),
        )?)
    }

    /// Filtered query, sorted by confidence descending; ties broken by
    /// asset id so the order is stable for identical store contents.
    pub fn query(&self, filter: &CapsuleFilter) -> Result<Vec<CapsuleRecord>> {
        let mut tokens: Vec<String> = Vec::new();
        if let Some(query) = &filter.query {
            tokens.extend(tokenize(query));
        }
        for tag in &filter.tags {
            tokens.push(tag.to_ascii_lowercase());
        }
        let mut results: Vec<CapsuleRecord> = match self.candidates_for(&tokens)? {
            Some(ids) => {
                let mut out = Vec::new();
                for id in ids {
                    if let Some(record) = self.get(&id)? {
                        if matches(&record, filter) {
                            out.push(record);
                        }
                    }
                }
                out
            }
            None => storage::iter_prefix::<CapsuleRecord>(&self.db, CAPSULE_PREFIX)?
                .into_iter()
                .filter(|r| matches(r, filter))
                .collect(),
        };
        results.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.asset_id.cmp(&b.asset_id))
        });
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Case-insensitive substring search over serialized records.
    pub fn search(&self, text: &str) -> Result<Vec<CapsuleRecord>> {
        let needle = text.to_ascii_lowercase();
        let mut out = Vec::new();
        for record in storage::iter_prefix::<CapsuleRecord>(&self.db, CAPSULE_PREFIX)? {
            let serialized = serde_json::to_string(&record)?.to_ascii_lowercase();
            if serialized.contains(&needle) {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        Ok(out)
    }

    pub fn count(&self) -> usize {
        storage::iter_prefix::<Value>(&self.db, CAPSULE_PREFIX)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Peer-facing projection: content nulled, content hash attached.
    pub fn public_view(record: &CapsuleRecord) -> CapsuleRecord {
        let mut view = record.clone();
        if let Some(content) = view.content.take() {
            view.content_hash = Some(content_hash_for(&content));
        }
        view
    }

    /// Record that `buyer` lawfully purchased this capsule.
    pub fn grant_access(&self, asset_id: &str, buyer: &str) -> Result<()> {
        let key = format!("{}{}:{}", ACCESS_PREFIX, asset_id, buyer);
        storage::put(&self.db, &key, &json!({ "grantedAt": chrono::Utc::now().timestamp_millis() }))?;
        Ok(())
    }

    pub fn has_access(&self, asset_id: &str, buyer: &str) -> bool {
        storage::exists(&self.db, &format!("{}{}:{}", ACCESS_PREFIX, asset_id, buyer))
    }

    fn index(&self, record: &CapsuleRecord) -> Result<()> {
        let mut tokens: Vec<String> = record
            .tags
            .iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        if let Some(content) = &record.content {
            tokens.extend(tokenize(&content.to_string()));
        }
        tokens.sort();
        tokens.dedup();
        for token in tokens {
            let key = format!("{}{}", INDEX_PREFIX, token);
            let mut ids: Vec<String> = storage::get(&self.db, &key)?.unwrap_or_default();
            if !ids.contains(&record.asset_id) {
                ids.push(record.asset_id.clone());
                ids.sort();
                storage::put(&self.db, &key, &ids)?;
            }
        }
        Ok(())
    }

    /// Intersection of indexed ids for all tokens; None means "no token
    /// constraint" (scan everything).
    fn candidates_for(&self, tokens: &[String]) -> Result<Option<HashSet<String>>> {
        if tokens.is_empty() {
            return Ok(None);
        }
        let mut candidates: Option<HashSet<String>> = None;
        for token in tokens {
            let key = format!("{}{}", INDEX_PREFIX, token);
            let ids: HashSet<String> = storage::get::<Vec<String>>(&self.db, &key)?
                .unwrap_or_default()
                .into_iter()
                .collect();
            candidates = Some(match candidates {
                None => ids,
                Some(current) => current.intersection(&ids).cloned().collect(),
            });
        }
        Ok(candidates)
    }
}

fn matches(record: &CapsuleRecord, filter: &CapsuleFilter) -> bool {
    if let Some(t) = &filter.capsule_type {
        if &record.capsule_type != t {
            return false;
        }
    }
    if let Some(creator) = &filter.creator {
        if &record.attribution.creator != creator {
            return false;
        }
    }
    if let Some(status) = &filter.status {
        if &record.status != status {
            return false;
        }
    }
    if let Some(min) = filter.min_confidence {
        if record.confidence < min {
            return false;
        }
    }
    if !filter.tags.is_empty() {
        let record_tags: HashSet<String> = record
            .tags
            .iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        for tag in &filter.tags {
            if !record_tags.contains(&tag.to_ascii_lowercase()) {
                return false;
            }
        }
    }
    true
}

/// Lowercased alphanumeric token stream used by the capsule index.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_on_non_word() {
        assert_eq!(
            tokenize("Rust async-IO, networking!"),
            vec!["rust", "async-io", "networking"]
        );
    }

    #[test]
    fn asset_id_is_content_addressed() {
        let a = json!({"skill": "parsing", "steps": [1, 2]});
        let b = json!({"skill": "parsing", "steps": [1, 3]});
        assert_eq!(asset_id_for(&a), asset_id_for(&a));
        assert_ne!(asset_id_for(&a), asset_id_for(&b));
        assert!(asset_id_for(&a).starts_with("sha256:"));
    }
}
