//! Subscriber distribution hub
//!
//! Maintains subscriber connections keyed by topic pattern, replays the most
//! recent buffered message per topic on subscribe, fans out new decoded
//! messages, and runs connection liveness checks. Delivery is non-blocking
//! per client: a slow client's full queue drops messages for that client
//! only, never stalling the rest of the fan-out.

use crate::health::PerfMode;
use crate::types::{DecodedMessage, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

/// Topic namespace for live decoded messages
pub const REALTIME_PREFIX: &str = "realtime/";

/// Wildcard pattern matching every realtime topic
pub const WILDCARD_PATTERN: &str = "realtime/*";

/// Catch-all alias; subscribing to it receives every topic regardless of name
pub const OVERVIEW_PATTERN: &str = "realtime/overview";

/// How often the liveness task pings connections
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// A connection silent for longer than this is forcibly closed
pub const PONG_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Topic name for a decoded message
pub fn topic_for(message_name: &str) -> String {
    format!("{}{}", REALTIME_PREFIX, message_name)
}

/// Whether a subscription pattern matches a concrete topic
fn pattern_matches(pattern: &str, topic: &str) -> bool {
    pattern == topic || pattern == WILDCARD_PATTERN || pattern == OVERVIEW_PATTERN
}

/// Inbound subscriber protocol
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientRequest {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Pong,
}

/// Outbound broadcast envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub data: DecodedMessage,
    pub sequence: u64,
}

/// Outcome of one broadcast fan-out, or cumulative delivery totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BroadcastStats {
    pub delivered: u64,
    pub failed: u64,
}

/// Tuning knobs for the hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Topics retained in the replay buffer in normal mode
    pub buffer_capacity: usize,
    /// Topics retained in low-resource mode
    pub degraded_buffer_capacity: usize,
    /// Per-client outbound queue depth
    pub client_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            degraded_buffer_capacity: 100,
            client_queue_capacity: 64,
        }
    }
}

struct Connection {
    patterns: HashSet<String>,
    sender: mpsc::Sender<String>,
    last_pong: Timestamp,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, Connection>,
    /// Most recent serialized envelope per topic
    last_messages: HashMap<String, String>,
    /// Topic insertion order for replay-buffer eviction
    insertion_order: VecDeque<String>,
    delivered: u64,
    failed: u64,
}

/// The distribution hub
pub struct DistributionHub {
    state: RwLock<HubState>,
    sequence: AtomicU64,
    config: HubConfig,
    mode: watch::Receiver<PerfMode>,
}

impl DistributionHub {
    pub fn new(config: HubConfig, mode: watch::Receiver<PerfMode>) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            sequence: AtomicU64::new(0),
            config,
            mode,
        }
    }

    /// Register a new connection; the returned id keys all later calls.
    /// Messages for the client are queued on `sender` as serialized JSON.
    pub async fn register(&self, sender: mpsc::Sender<String>) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.write().await;
        state.connections.insert(
            id,
            Connection {
                patterns: HashSet::new(),
                sender,
                last_pong: Utc::now(),
            },
        );
        log::info!("Client {} connected, {} total", id, state.connections.len());
        id
    }

    /// Remove a connection (socket closed or liveness timeout)
    pub async fn disconnect(&self, id: Uuid) {
        let mut state = self.state.write().await;
        if state.connections.remove(&id).is_some() {
            log::info!("Client {} disconnected, {} total", id, state.connections.len());
        }
    }

    /// Dispatch an inbound protocol message from a client
    pub async fn handle_request(&self, id: Uuid, request: ClientRequest) {
        match request {
            ClientRequest::Subscribe { topics } => self.subscribe(id, &topics).await,
            ClientRequest::Unsubscribe { topics } => self.unsubscribe(id, &topics).await,
            ClientRequest::Pong => self.pong(id).await,
        }
    }

    /// Add patterns to a connection and replay the most recent buffered
    /// message for every topic the new patterns match
    pub async fn subscribe(&self, id: Uuid, patterns: &[String]) {
        let mut state = self.state.write().await;

        let mut replay = Vec::new();
        for (topic, payload) in &state.last_messages {
            if patterns.iter().any(|p| pattern_matches(p, topic)) {
                replay.push(payload.clone());
            }
        }

        let Some(connection) = state.connections.get_mut(&id) else {
            return;
        };
        for pattern in patterns {
            connection.patterns.insert(pattern.clone());
        }
        log::debug!("Client {} subscribed to {:?}", id, patterns);

        let mut delivered = 0u64;
        let mut failed = 0u64;
        for payload in replay {
            if connection.sender.try_send(payload).is_ok() {
                delivered += 1;
            } else {
                failed += 1;
            }
        }
        state.delivered += delivered;
        state.failed += failed;
    }

    /// Remove patterns from a connection
    pub async fn unsubscribe(&self, id: Uuid, patterns: &[String]) {
        let mut state = self.state.write().await;
        if let Some(connection) = state.connections.get_mut(&id) {
            for pattern in patterns {
                connection.patterns.remove(pattern);
            }
        }
    }

    /// Record a liveness response from a client
    pub async fn pong(&self, id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(connection) = state.connections.get_mut(&id) {
            connection.last_pong = Utc::now();
        }
    }

    /// Fan a decoded message out to every subscribed connection
    ///
    /// Updates the per-topic replay buffer, assigns the next sequence number,
    /// and delivers non-blockingly; a full client queue counts as a failure
    /// for that client only.
    pub async fn broadcast(&self, message: &DecodedMessage) -> BroadcastStats {
        let topic = topic_for(&message.name);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope {
            topic: topic.clone(),
            data: message.clone(),
            sequence,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                log::error!("Failed to serialize envelope for {}: {}", topic, e);
                return BroadcastStats::default();
            }
        };

        let buffer_capacity = if *self.mode.borrow() == PerfMode::Low {
            self.config.degraded_buffer_capacity
        } else {
            self.config.buffer_capacity
        };

        let mut state = self.state.write().await;
        self.buffer_message(&mut state, &topic, payload.clone(), buffer_capacity);

        let mut stats = BroadcastStats::default();
        for connection in state.connections.values() {
            if !connection.patterns.iter().any(|p| pattern_matches(p, &topic)) {
                continue;
            }
            match connection.sender.try_send(payload.clone()) {
                Ok(()) => stats.delivered += 1,
                Err(_) => stats.failed += 1,
            }
        }
        state.delivered += stats.delivered;
        state.failed += stats.failed;
        stats
    }

    /// Store the latest message for a topic, evicting the oldest-inserted
    /// topic when the buffer is full
    fn buffer_message(&self, state: &mut HubState, topic: &str, payload: String, capacity: usize) {
        if state.last_messages.insert(topic.to_string(), payload).is_none() {
            state.insertion_order.push_back(topic.to_string());
        }
        while state.last_messages.len() > capacity {
            if let Some(oldest) = state.insertion_order.pop_front() {
                state.last_messages.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Ping all connections and close the ones that have not echoed a pong
    /// within the timeout; returns the ids of closed connections
    pub async fn run_liveness_check(&self, now: Timestamp) -> Vec<Uuid> {
        let ping = format!(
            "{{\"type\":\"ping\",\"timestamp\":{}}}",
            now.timestamp_millis()
        );
        let timeout = chrono::Duration::from_std(PONG_TIMEOUT).unwrap_or(chrono::Duration::seconds(30));

        let mut state = self.state.write().await;
        let mut expired = Vec::new();
        for (id, connection) in &state.connections {
            if now - connection.last_pong > timeout {
                expired.push(*id);
            } else {
                // Best-effort; an unresponsive queue will fail the pong check
                let _ = connection.sender.try_send(ping.clone());
            }
        }
        for id in &expired {
            state.connections.remove(id);
            log::warn!("Client {} timed out, closing", id);
        }
        expired
    }

    /// Number of open connections
    pub async fn connected_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Cumulative delivery counters since startup, replay sends included;
    /// surfaced in the pipeline's health snapshot
    pub async fn delivery_stats(&self) -> BroadcastStats {
        let state = self.state.read().await;
        BroadcastStats {
            delivered: state.delivered,
            failed: state.failed,
        }
    }

    /// Topics currently held in the replay buffer
    pub async fn buffered_topics(&self) -> usize {
        self.state.read().await.last_messages.len()
    }
}
