//! Connection lifecycle manager.
//!
//! Maps document ids to running sessions, creating a session on first join
//! and routing every participant request to it. A session removes itself
//! from the map when it shuts down; each session carries a generation so a
//! stale handle can never evict its successor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use quill_core::Operation;

use crate::auth::{AllowAll, Authorizer};
use crate::broadcast::{AtomicBroadcastStats, BroadcastStats, Connection, ConnectionId};
use crate::error::{CollabError, CollabResult};
use crate::protocol::{DocumentId, ParticipantId};
use crate::session::{
    self, Ack, SessionCommand, SessionConfig, SessionContext, SessionCounters, SessionHandle,
    SessionMap, SessionSnapshot,
};
use crate::storage::{MemoryStore, SnapshotStore, VersionHistory};

/// Registry-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub operations_applied: u64,
    pub operations_rejected: u64,
    pub checkpoints: u64,
    pub checkpoint_failures: u64,
    pub broadcast: BroadcastStats,
}

pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    ctx: Arc<SessionContext>,
    authorizer: Arc<dyn Authorizer>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn SnapshotStore>,
        authorizer: Arc<dyn Authorizer>,
        history: Option<Arc<dyn VersionHistory>>,
    ) -> Self {
        let sessions: Arc<SessionMap> = Arc::new(Mutex::new(HashMap::new()));
        let ctx = Arc::new(SessionContext {
            config,
            store,
            history,
            sessions: Arc::downgrade(&sessions),
            broadcast_stats: Arc::new(AtomicBroadcastStats::default()),
            counters: Arc::new(SessionCounters::default()),
        });
        Self {
            sessions,
            ctx,
            authorizer,
            next_generation: AtomicU64::new(1),
        }
    }

    /// In-memory storage, every participant allowed.
    pub fn in_memory(config: SessionConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()), Arc::new(AllowAll), None)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Register `participant_id` on the document's session and return the
    /// state to synchronise from. The same state is also queued on the
    /// connection as a `Sync` message.
    pub async fn join(
        &self,
        document_id: DocumentId,
        participant_id: ParticipantId,
        connection: Connection,
    ) -> CollabResult<SessionSnapshot> {
        if !self.authorizer.can_access(participant_id, document_id).await {
            log::warn!("Access to {document_id} denied for {participant_id}");
            return Err(CollabError::DocumentAccessDenied {
                document_id,
                participant_id,
            });
        }

        loop {
            let handle = self.session_for(document_id).await;
            let attempt = connection.clone();
            let result = handle
                .request(|reply| SessionCommand::Join {
                    participant_id,
                    connection: attempt,
                    reply,
                })
                .await
                .and_then(|joined| joined);

            match result {
                Err(CollabError::SessionClosed(_)) => {
                    log::debug!(
                        "Session {document_id} (generation {}) closing, waiting to rejoin",
                        handle.generation()
                    );
                    handle.terminated().await;
                    self.forget(document_id, handle.generation()).await;
                }
                other => return other,
            }
        }
    }

    /// Submit an operation and wait until it is applied or rejected.
    pub async fn submit_operation(
        &self,
        document_id: DocumentId,
        participant_id: ParticipantId,
        base_revision: u64,
        operation: Operation,
    ) -> CollabResult<Ack> {
        let handle = self.joined_session(document_id, participant_id).await?;
        handle
            .request(|reply| SessionCommand::Submit {
                participant_id,
                base_revision,
                operation,
                reply: Some(reply),
            })
            .await
            .and_then(|result| result)
    }

    /// Enqueue an operation. The outcome arrives on the participant's
    /// connection as an `Ack` or `Error` message.
    pub async fn send_operation(
        &self,
        document_id: DocumentId,
        participant_id: ParticipantId,
        base_revision: u64,
        operation: Operation,
    ) -> CollabResult<()> {
        let handle = self.joined_session(document_id, participant_id).await?;
        handle
            .send(SessionCommand::Submit {
                participant_id,
                base_revision,
                operation,
                reply: None,
            })
            .await
    }

    /// Best-effort cursor update.
    pub async fn move_cursor(&self, document_id: DocumentId, participant_id: ParticipantId, position: usize, seq: u64) {
        if let Some(handle) = self.existing(document_id).await {
            let _ = handle
                .send(SessionCommand::Cursor {
                    participant_id,
                    position,
                    seq,
                })
                .await;
        }
    }

    /// Remove a participant. Returns false if it was not present.
    pub async fn leave(&self, document_id: DocumentId, participant_id: ParticipantId) -> bool {
        let Some(handle) = self.existing(document_id).await else {
            return false;
        };
        handle
            .request(|reply| SessionCommand::Leave {
                participant_id,
                connection: None,
                reply: Some(reply),
            })
            .await
            .unwrap_or(false)
    }

    /// Transport-detected drop of one connection. A no-op if the
    /// participant has since joined over another connection.
    pub async fn disconnect(&self, document_id: DocumentId, participant_id: ParticipantId, connection: ConnectionId) {
        if let Some(handle) = self.existing(document_id).await {
            let _ = handle
                .send(SessionCommand::Leave {
                    participant_id,
                    connection: Some(connection),
                    reply: None,
                })
                .await;
        }
    }

    /// Full resynchronisation. The snapshot is also queued on the
    /// participant's connection, ordered with the operation stream.
    pub async fn sync(&self, document_id: DocumentId, participant_id: ParticipantId) -> CollabResult<SessionSnapshot> {
        let handle = self.joined_session(document_id, participant_id).await?;
        handle
            .request(|reply| SessionCommand::Sync {
                participant_id: Some(participant_id),
                reply,
            })
            .await
            .and_then(|result| result)
    }

    /// Live state of an active document, without joining it.
    pub async fn snapshot(&self, document_id: DocumentId) -> Option<SessionSnapshot> {
        let handle = self.existing(document_id).await?;
        handle
            .request(|reply| SessionCommand::Sync {
                participant_id: None,
                reply,
            })
            .await
            .and_then(|result| result)
            .ok()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_active(&self, document_id: DocumentId) -> bool {
        self.sessions.lock().await.contains_key(&document_id)
    }

    pub async fn stats(&self) -> RegistryStats {
        let counters = &self.ctx.counters;
        RegistryStats {
            active_sessions: self.session_count().await,
            operations_applied: counters.applied.load(Ordering::Relaxed),
            operations_rejected: counters.rejected.load(Ordering::Relaxed),
            checkpoints: counters.checkpoints.load(Ordering::Relaxed),
            checkpoint_failures: counters.checkpoint_failures.load(Ordering::Relaxed),
            broadcast: self.ctx.broadcast_stats.snapshot(),
        }
    }

    /// Close every session, waiting for their final checkpoints.
    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        log::info!("Closing {} sessions", handles.len());
        let waiters: Vec<_> = handles.into_iter().map(SessionHandle::into_termination).collect();
        for mut waiter in waiters {
            let _ = waiter.wait_for(|done| *done).await;
        }
    }

    async fn session_for(&self, document_id: DocumentId) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&document_id) {
            if !handle.is_terminated() {
                return handle.clone();
            }
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = session::spawn(document_id, generation, self.ctx.clone());
        sessions.insert(document_id, handle.clone());
        log::debug!("Created session for {document_id} (generation {generation})");
        handle
    }

    async fn existing(&self, document_id: DocumentId) -> Option<SessionHandle> {
        self.sessions.lock().await.get(&document_id).cloned()
    }

    async fn joined_session(&self, document_id: DocumentId, participant_id: ParticipantId) -> CollabResult<SessionHandle> {
        self.existing(document_id)
            .await
            .ok_or(CollabError::NotJoined {
                document_id,
                participant_id,
            })
    }

    async fn forget(&self, document_id: DocumentId, generation: u64) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(&document_id).is_some_and(|h| h.generation() == generation) {
            sessions.remove(&document_id);
        }
    }
}
