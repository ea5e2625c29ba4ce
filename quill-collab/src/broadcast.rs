//! Per-session fan-out to participant connections.
//!
//! Every participant owns a bounded outbound channel. Delivery never waits:
//! a channel that is full (or already closed) marks its participant for
//! eviction, and the session then runs the normal leave path for it.
//! Acks for a participant's own operations go through the same channel, so
//! each participant observes broadcasts and acks in revision order.
//!
//! The channel capacity ([`SessionConfig::outbound_capacity`]) is the
//! slow-consumer bound. Time spent blocked on the socket is bounded
//! separately by the writer's `write_timeout` in [`crate::server`]; once the
//! writer stalls, the channel fills and the next delivery evicts.
//!
//! [`SessionConfig::outbound_capacity`]: crate::session::SessionConfig::outbound_capacity

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::{ParticipantId, ServerMessage};

/// Sending half of a participant's ordered outbound channel.
pub type Outbound = mpsc::Sender<Arc<ServerMessage>>;

/// Identifies one transport of a participant, distinct across reconnects.
pub type ConnectionId = Uuid;

/// A participant's transport as seen by a session.
///
/// The id scopes disconnects: a late drop of an old socket must not remove
/// the same participant's newer connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: Outbound,
}

impl Connection {
    /// Wrap an existing sender under a fresh connection id.
    pub fn new(outbound: Outbound) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
        }
    }

    /// Create a connection together with the receiving half of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<ServerMessage>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Broadcast health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Messages accepted by a participant channel
    pub messages_sent: u64,
    /// Participants dropped for a full or closed channel
    pub evicted: u64,
    /// Connections currently registered across all groups
    pub active_connections: usize,
}

/// Atomic counters, shared with whoever reports stats.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    evicted: AtomicU64,
    active_connections: AtomicUsize,
}

impl AtomicBroadcastStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

/// Connections of one document session. Owned by the session coordinator.
///
/// A participant is evicted as soon as its channel holds `capacity`
/// undelivered messages; there is no further grace period. Size
/// [`SessionConfig::outbound_capacity`] for the burst a healthy client may
/// lag behind by.
///
/// [`SessionConfig::outbound_capacity`]: crate::session::SessionConfig::outbound_capacity
pub struct BroadcastGroup {
    connections: HashMap<ParticipantId, Connection>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Empty group reporting into `stats`, which may be shared across sessions.
    pub fn new(stats: Arc<AtomicBroadcastStats>) -> Self {
        Self {
            connections: HashMap::new(),
            stats,
        }
    }

    /// Register a participant's connection, returning the one it replaces.
    pub fn add(&mut self, participant_id: ParticipantId, connection: Connection) -> Option<Connection> {
        let replaced = self.connections.insert(participant_id, connection);
        if replaced.is_none() {
            self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    /// Drop a participant's channel. The receiving side then sees it closed.
    pub fn remove(&mut self, participant_id: &ParticipantId) -> bool {
        let removed = self.connections.remove(participant_id).is_some();
        if removed {
            self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// True if the participant currently has a channel in this group.
    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.connections.contains_key(participant_id)
    }

    /// Id of the participant's current connection, used to scope disconnects.
    pub fn connection_id(&self, participant_id: &ParticipantId) -> Option<ConnectionId> {
        self.connections.get(participant_id).map(Connection::id)
    }

    /// Participants with a registered channel, in no particular order.
    pub fn participants(&self) -> Vec<ParticipantId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Deliver `msg` to everyone except `exclude`.
    ///
    /// Returns participants whose channel could not take the message.
    pub fn broadcast(&self, msg: Arc<ServerMessage>, exclude: Option<ParticipantId>) -> Vec<ParticipantId> {
        let mut failed = Vec::new();
        for (id, conn) in &self.connections {
            if Some(*id) == exclude {
                continue;
            }
            if !self.deliver(id, &conn.outbound, msg.clone()) {
                failed.push(*id);
            }
        }
        failed
    }

    /// Deliver `msg` to a single participant. False if it must be evicted.
    ///
    /// Unknown participants are ignored and report success.
    pub fn send_to(&self, participant_id: &ParticipantId, msg: Arc<ServerMessage>) -> bool {
        match self.connections.get(participant_id) {
            Some(conn) => self.deliver(participant_id, &conn.outbound, msg),
            None => true,
        }
    }

    /// Count an eviction carried out by the session.
    pub fn record_eviction(&self) {
        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters shared by every group built over the same stats.
    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }

    fn deliver(&self, id: &ParticipantId, tx: &Outbound, msg: Arc<ServerMessage>) -> bool {
        match tx.try_send(msg) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(msg)) => {
                log::warn!("Outbound queue full for {id}, dropping {}", msg.kind());
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Outbound channel for {id} already closed");
                false
            }
        }
    }
}
