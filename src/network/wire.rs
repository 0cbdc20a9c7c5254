// src/network/wire.rs
// Wire envelope for the line-delimited JSON gossip protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of message kinds. Unknown kinds deserialize to `Unknown`
/// and are counted and dropped by the transport; there is no string-topic
/// dispatch anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Handshake,
    Ping,
    Pong,
    Capsule,
    Task,
    TaskBid,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    TaskLike,
    Tx,
    TxLog,
    TxLogRequest,
    TxLogBatch,
    LedgerHeadRequest,
    LedgerHeadResponse,
    Query,
    QueryResponse,
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Task-class messages flood wider and deeper than the rest.
    pub fn is_task_class(self) -> bool {
        matches!(
            self,
            MessageKind::Task
                | MessageKind::TaskBid
                | MessageKind::TaskAssigned
                | MessageKind::TaskCompleted
                | MessageKind::TaskFailed
                | MessageKind::TaskLike
        )
    }

    /// Control traffic and request/response pairs are delivered to the
    /// direct peer only, never relayed.
    pub fn is_relayable(self) -> bool {
        !matches!(
            self,
            MessageKind::Handshake
                | MessageKind::Ping
                | MessageKind::Pong
                | MessageKind::Query
                | MessageKind::QueryResponse
                | MessageKind::TxLogRequest
                | MessageKind::TxLogBatch
                | MessageKind::LedgerHeadRequest
                | MessageKind::LedgerHeadResponse
                | MessageKind::Unknown
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hops_left: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl WireMessage {
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            message_id: None,
            hops_left: None,
            request_id: None,
            node_id: None,
            port: None,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn with_hops(mut self, hops: i32) -> Self {
        self.hops_left = Some(hops);
        self
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Assign a message id if one is not already present; returns it.
    /// Ids are assigned on first emission and travel with relays.
    pub fn ensure_message_id(&mut self) -> String {
        if let Some(id) = &self.message_id {
            return id.clone();
        }
        let id = Uuid::new_v4().to_string();
        self.message_id = Some(id.clone());
        id
    }
}
