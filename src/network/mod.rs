// src/network/mod.rs
// Gossip transport: line-delimited JSON over TCP with handshake,
// seen-set deduplication, bounded-fanout relay and RTT-ranked peer
// selection. One reader and one writer task per peer connection; the
// writer is fed through an unbounded channel so handlers never block on
// a socket.

pub mod wire;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::errors::{MeshError, Result};
use wire::{MessageKind, WireMessage};

/// Heartbeat cadence for live peers.
const HEARTBEAT_SECS: u64 = 30;
/// Pending pings older than this are discarded without penalty.
const PING_STALE_MS: i64 = 15_000;
/// Re-dial cadence for known-but-disconnected peers.
const REDIAL_SECS: u64 = 30;
/// Query waiters time out after this long.
const QUERY_TIMEOUT_SECS: u64 = 5;

static MESSAGES_IN: Lazy<AtomicUsize> = Lazy::new(|| AtomicUsize::new(0));
static MESSAGES_OUT: Lazy<AtomicUsize> = Lazy::new(|| AtomicUsize::new(0));
static DUPLICATES_DROPPED: Lazy<AtomicUsize> = Lazy::new(|| AtomicUsize::new(0));
static UNKNOWN_KINDS: Lazy<AtomicUsize> = Lazy::new(|| AtomicUsize::new(0));
static MALFORMED_LINES: Lazy<AtomicUsize> = Lazy::new(|| AtomicUsize::new(0));
static ACTIVE_PEERS: Lazy<AtomicUsize> = Lazy::new(|| AtomicUsize::new(0));

/// Lightweight process-wide transport counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub messages_in: usize,
    pub messages_out: usize,
    pub duplicates_dropped: usize,
    pub unknown_kinds: usize,
    pub malformed_lines: usize,
    pub active_peers: usize,
}

pub fn metrics() -> NetworkMetrics {
    NetworkMetrics {
        messages_in: MESSAGES_IN.load(Ordering::Relaxed),
        messages_out: MESSAGES_OUT.load(Ordering::Relaxed),
        duplicates_dropped: DUPLICATES_DROPPED.load(Ordering::Relaxed),
        unknown_kinds: UNKNOWN_KINDS.load(Ordering::Relaxed),
        malformed_lines: MALFORMED_LINES.load(Ordering::Relaxed),
        active_peers: ACTIVE_PEERS.load(Ordering::Relaxed),
    }
}

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub default_fanout: usize,
    pub task_fanout: usize,
    pub default_hops: i32,
    pub task_hops: i32,
    pub seen_ttl_ms: i64,
    pub max_seen: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            default_fanout: 6,
            task_fanout: 8,
            default_hops: 3,
            task_hops: 4,
            seen_ttl_ms: 300_000,
            max_seen: 10_000,
        }
    }
}

/// A message delivered to the coordinator, tagged with the stable id of
/// the peer it arrived from.
#[derive(Debug)]
pub struct Inbound {
    pub peer_id: String,
    pub message: WireMessage,
}

#[derive(Clone)]
struct PeerHandle {
    sender: mpsc::UnboundedSender<String>,
    rtt: Option<i64>,
    addr: String,
    last_seen: i64,
}

struct PendingPing {
    peer_id: String,
    sent_at: i64,
}

pub struct GossipNode {
    pub node_id: String,
    listen_port: AtomicU16,
    bootstrap: Vec<String>,
    peers: Mutex<HashMap<String, PeerHandle>>,
    pending_pings: Mutex<HashMap<String, PendingPing>>,
    seen: Mutex<HashMap<String, i64>>,
    query_waiters: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    peers_file: Option<PathBuf>,
    cfg: GossipConfig,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl GossipNode {
    pub fn new(
        node_id: String,
        bootstrap: Vec<String>,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
        peers_file: Option<PathBuf>,
        cfg: GossipConfig,
    ) -> Self {
        Self {
            node_id,
            listen_port: AtomicU16::new(0),
            bootstrap,
            peers: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
            query_waiters: Mutex::new(HashMap::new()),
            inbound_tx,
            peers_file,
            cfg,
        }
    }

    /// Bind the listener, dial bootstrap and remembered peers, start the
    /// heartbeat and re-dial workers. Returns the actual bound port.
    pub async fn start(self: Arc<Self>, port: u16) -> Result<u16> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| MeshError::Network(format!("bind {}: {}", addr, e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| MeshError::Network(e.to_string()))?
            .port();
        self.listen_port.store(local_port, Ordering::Relaxed);
        tracing::info!(port = local_port, node = %self.node_id, "gossip listener bound");

        let node = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            node.handle_connection(stream, remote.to_string()).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        let mut dial_targets = self.bootstrap.clone();
        dial_targets.extend(self.load_known_peers());
        dial_targets.sort();
        dial_targets.dedup();
        for target in dial_targets {
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                node.connect(target).await;
            });
        }

        Arc::clone(&self).spawn_heartbeat();
        Arc::clone(&self).spawn_redial();
        Ok(local_port)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    /// Dial a peer and run its connection to completion.
    pub async fn connect(self: Arc<Self>, addr: String) {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                self.handle_connection(stream, addr).await;
            }
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "dial failed");
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_key: String) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        self.peers.lock().insert(
            remote_key.clone(),
            PeerHandle {
                sender: tx.clone(),
                rtt: None,
                addr: remote_key.clone(),
                last_seen: now_ms(),
            },
        );
        ACTIVE_PEERS.store(self.peers.lock().len(), Ordering::Relaxed);

        // Announce ourselves first; the connection has no stable peer
        // identity until the matching handshake arrives.
        let mut hello = WireMessage::new(MessageKind::Handshake, json!({}));
        hello.node_id = Some(self.node_id.clone());
        hello.port = Some(self.listen_port());
        if let Ok(text) = serde_json::to_string(&hello) {
            let _ = tx.send(text);
        }

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        let mut line = String::new();
        let mut peer_id: Option<String> = None;
        loop {
            line.clear();
            let n = match reader.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(peer = %remote_key, error = %e, "read error");
                    break;
                }
            };
            if n == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Malformed lines are dropped silently; the socket stays up.
            let message: WireMessage = match serde_json::from_str(trimmed) {
                Ok(m) => m,
                Err(_) => {
                    MALFORMED_LINES.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            MESSAGES_IN.fetch_add(1, Ordering::Relaxed);

            if message.kind == MessageKind::Handshake {
                if let Some(id) = message.node_id.clone() {
                    self.rekey_peer(&remote_key, &id, message.port);
                    peer_id = Some(id);
                }
                continue;
            }
            let active_peer = peer_id.clone().unwrap_or_else(|| remote_key.clone());

            if !self.should_process(&message) {
                continue;
            }

            match message.kind {
                MessageKind::Ping => {
                    let pong = WireMessage::new(MessageKind::Pong, message.payload.clone());
                    if let Ok(text) = serde_json::to_string(&pong) {
                        let _ = tx.send(text);
                        MESSAGES_OUT.fetch_add(1, Ordering::Relaxed);
                    }
                }
                MessageKind::Pong => {
                    self.note_pong(&message.payload);
                }
                MessageKind::QueryResponse => {
                    if let Some(request_id) = &message.request_id {
                        if let Some(waiter) = self.query_waiters.lock().remove(request_id) {
                            let _ = waiter.send(message.payload.clone());
                            continue;
                        }
                    }
                    // No local waiter: hand it to the coordinator anyway.
                    let _ = self.inbound_tx.send(Inbound {
                        peer_id: active_peer.clone(),
                        message,
                    });
                }
                MessageKind::Unknown => {
                    UNKNOWN_KINDS.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    let relay_candidate = message.clone();
                    let _ = self.inbound_tx.send(Inbound {
                        peer_id: active_peer.clone(),
                        message,
                    });
                    self.relay(relay_candidate, &active_peer);
                }
            }
        }

        if let Some(id) = peer_id {
            self.peers.lock().remove(&id);
        } else {
            self.peers.lock().remove(&remote_key);
        }
        ACTIVE_PEERS.store(self.peers.lock().len(), Ordering::Relaxed);
        tracing::debug!(peer = %remote_key, "connection closed");
    }

    /// After a handshake, the connection is addressed by the peer's node
    /// id rather than its socket address, and its listen address is
    /// remembered for re-dialing.
    fn rekey_peer(&self, remote_key: &str, node_id: &str, announced_port: Option<u16>) {
        let mut peers = self.peers.lock();
        if let Some(mut handle) = peers.remove(remote_key) {
            handle.last_seen = now_ms();
            if let Some(port) = announced_port {
                if let Some(host) = remote_key.rsplit_once(':').map(|(h, _)| h) {
                    handle.addr = format!("{}:{}", host, port);
                }
            }
            let addr = handle.addr.clone();
            peers.insert(node_id.to_string(), handle);
            drop(peers);
            self.remember_peer(&addr);
        }
    }

    /// Seen-set check: a message id already present is dropped without
    /// delivery or relay; ids are recorded on first sight. Messages
    /// without an id (control traffic) always pass.
    fn should_process(&self, message: &WireMessage) -> bool {
        if message.hops_left.map(|h| h < 0).unwrap_or(false) {
            return false;
        }
        let Some(id) = &message.message_id else {
            return true;
        };
        let mut seen = self.seen.lock();
        if seen.contains_key(id) {
            DUPLICATES_DROPPED.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let now = now_ms();
        seen.insert(id.clone(), now);
        cleanup_seen(&mut seen, now, self.cfg.seen_ttl_ms, self.cfg.max_seen);
        true
    }

    fn note_pong(&self, payload: &Value) {
        let Some(ping_id) = payload.get("pingId").and_then(|v| v.as_str()) else {
            return;
        };
        let pending = self.pending_pings.lock().remove(ping_id);
        if let Some(pending) = pending {
            let rtt = now_ms() - pending.sent_at;
            let mut peers = self.peers.lock();
            if let Some(handle) = peers.get_mut(&pending.peer_id) {
                handle.rtt = Some(rtt);
                handle.last_seen = now_ms();
            }
        }
    }

    /// Relay a delivered message onward with decremented hops, excluding
    /// the peer it came from.
    fn relay(&self, mut message: WireMessage, from_peer: &str) {
        if !message.kind.is_relayable() {
            return;
        }
        let default_hops = if message.kind.is_task_class() {
            self.cfg.task_hops
        } else {
            self.cfg.default_hops
        };
        let next_hops = message.hops_left.unwrap_or(default_hops) - 1;
        if next_hops < 0 {
            return;
        }
        message.hops_left = Some(next_hops);
        let fanout = if message.kind.is_task_class() {
            self.cfg.task_fanout
        } else {
            self.cfg.default_fanout
        };
        for peer in self.select_peers(fanout, Some(from_peer)) {
            self.send_raw(&peer, &message);
        }
    }

    /// Broadcast a message to `fanout` peers, stamping a message id and
    /// marking it seen locally so our own relays cannot echo back.
    pub fn broadcast(&self, mut message: WireMessage) {
        let id = message.ensure_message_id();
        self.seen.lock().insert(id, now_ms());
        if message.hops_left.is_none() {
            message.hops_left = Some(if message.kind.is_task_class() {
                self.cfg.task_hops
            } else {
                self.cfg.default_hops
            });
        }
        let fanout = if message.kind.is_task_class() {
            self.cfg.task_fanout
        } else {
            self.cfg.default_fanout
        };
        for peer in self.select_peers(fanout, None) {
            self.send_raw(&peer, &message);
        }
    }

    pub fn send_to_peer(&self, peer_id: &str, message: &WireMessage) {
        self.send_raw(peer_id, message);
    }

    fn send_raw(&self, peer_id: &str, message: &WireMessage) {
        let mut peers = self.peers.lock();
        let Some(handle) = peers.get(peer_id) else {
            return;
        };
        let text = match serde_json::to_string(message) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "serialize wire message failed");
                return;
            }
        };
        if handle.sender.send(text).is_err() {
            // Writer task is gone; disconnection is idempotent.
            peers.remove(peer_id);
            ACTIVE_PEERS.store(peers.len(), Ordering::Relaxed);
        } else {
            MESSAGES_OUT.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Peers ordered by measured RTT ascending; unmeasured peers are
    /// shuffled in after the measured ones; truncated to `fanout`.
    fn select_peers(&self, fanout: usize, exclude: Option<&str>) -> Vec<String> {
        let peers = self.peers.lock();
        let mut measured: Vec<(String, i64)> = Vec::new();
        let mut unmeasured: Vec<String> = Vec::new();
        for (peer_id, handle) in peers.iter() {
            if exclude == Some(peer_id.as_str()) {
                continue;
            }
            match handle.rtt {
                Some(rtt) => measured.push((peer_id.clone(), rtt)),
                None => unmeasured.push(peer_id.clone()),
            }
        }
        drop(peers);
        measured.sort_by_key(|(_, rtt)| *rtt);
        let mut ordered: Vec<String> = measured.into_iter().map(|(id, _)| id).collect();
        unmeasured.shuffle(&mut rand::thread_rng());
        ordered.extend(unmeasured);
        if fanout > 0 && ordered.len() > fanout {
            ordered.truncate(fanout);
        }
        ordered
    }

    /// The lowest-RTT peer, or any connected peer if none is measured.
    pub fn best_peer(&self) -> Option<String> {
        self.select_peers(1, None).into_iter().next()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// True once the handshake established this peer id.
    pub fn has_peer(&self, node_id: &str) -> bool {
        self.peers.lock().contains_key(node_id)
    }

    /// Connected-peer summaries for the operator surface.
    pub fn peer_summaries(&self) -> Vec<Value> {
        self.peers
            .lock()
            .iter()
            .map(|(peer_id, handle)| {
                json!({
                    "nodeId": peer_id,
                    "addr": handle.addr,
                    "rttMs": handle.rtt,
                    "lastSeen": handle.last_seen,
                })
            })
            .collect()
    }

    /// Ask nearby peers for capsule metadata matching `filter`; the first
    /// response wins. Queries are direct request/response, never relayed.
    pub async fn query_memories(&self, filter: Value) -> Result<Vec<Value>> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.query_waiters.lock().insert(request_id.clone(), tx);
        let message = WireMessage::new(
            MessageKind::Query,
            json!({ "type": "memories", "filter": filter }),
        )
        .with_request_id(request_id.clone());
        let targets = self.select_peers(3, None);
        if targets.is_empty() {
            self.query_waiters.lock().remove(&request_id);
            return Ok(vec![]);
        }
        for peer in targets {
            self.send_raw(&peer, &message);
        }
        let response = tokio::time::timeout(
            std::time::Duration::from_secs(QUERY_TIMEOUT_SECS),
            rx,
        )
        .await;
        self.query_waiters.lock().remove(&request_id);
        match response {
            Ok(Ok(payload)) => Ok(payload
                .get("memories")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default()),
            Ok(Err(_)) => Ok(vec![]),
            Err(_) => Err(MeshError::Timeout("query_response")),
        }
    }

    fn spawn_heartbeat(self: Arc<Self>) {
        let node = self;
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
            loop {
                tick.tick().await;
                let now = now_ms();
                node.pending_pings
                    .lock()
                    .retain(|_, p| now - p.sent_at <= PING_STALE_MS);
                let peer_ids: Vec<String> = node.peers.lock().keys().cloned().collect();
                for peer_id in peer_ids {
                    let ping_id = Uuid::new_v4().to_string();
                    node.pending_pings.lock().insert(
                        ping_id.clone(),
                        PendingPing {
                            peer_id: peer_id.clone(),
                            sent_at: now,
                        },
                    );
                    let ping = WireMessage::new(
                        MessageKind::Ping,
                        json!({ "pingId": ping_id, "timestamp": now }),
                    );
                    node.send_raw(&peer_id, &ping);
                }
            }
        });
    }

    fn spawn_redial(self: Arc<Self>) {
        let node = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(REDIAL_SECS));
            // The first tick fires immediately; skip it, we just dialed.
            tick.tick().await;
            loop {
                tick.tick().await;
                let connected: Vec<String> = node
                    .peers
                    .lock()
                    .values()
                    .map(|h| h.addr.clone())
                    .collect();
                let mut candidates = node.bootstrap.clone();
                candidates.extend(node.load_known_peers());
                candidates.sort();
                candidates.dedup();
                candidates.retain(|a| !connected.contains(a));
                for addr in candidates.into_iter().take(3) {
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        node.connect(addr).await;
                    });
                }
            }
        });
    }

    fn load_known_peers(&self) -> Vec<String> {
        let Some(path) = &self.peers_file else {
            return vec![];
        };
        std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<Vec<String>>(&text).ok())
            .unwrap_or_default()
    }

    /// Persist a peer's listen address for re-dialing on restart.
    /// Atomic write: temp file then rename.
    fn remember_peer(&self, addr: &str) {
        let Some(path) = &self.peers_file else {
            return;
        };
        let mut known = self.load_known_peers();
        if known.iter().any(|a| a == addr) {
            return;
        }
        known.push(addr.to_string());
        known.sort();
        known.truncate(256);
        if let Ok(json) = serde_json::to_string(&known) {
            let tmp = path.with_extension("tmp");
            if std::fs::write(&tmp, &json).is_ok() {
                let _ = std::fs::rename(&tmp, path);
            }
        }
    }
}

fn cleanup_seen(seen: &mut HashMap<String, i64>, now: i64, ttl_ms: i64, max: usize) {
    seen.retain(|_, at| now - *at <= ttl_ms);
    while seen.len() > max {
        let oldest = seen
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(k) => {
                seen.remove(&k);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_cleanup_evicts_expired_and_oldest() {
        let mut seen = HashMap::new();
        seen.insert("a".to_string(), 0);
        seen.insert("b".to_string(), 5_000);
        seen.insert("c".to_string(), 9_000);
        cleanup_seen(&mut seen, 10_000, 6_000, 10);
        assert!(!seen.contains_key("a"));
        assert!(seen.contains_key("b"));

        cleanup_seen(&mut seen, 10_000, 60_000, 1);
        assert_eq!(seen.len(), 1);
        assert!(seen.contains_key("c"));
    }
}
