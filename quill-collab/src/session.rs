//! Session coordinator: the single owner of a document while it is edited.
//!
//! Each active document runs one task that drains an inbox of commands one
//! at a time. Nothing else touches the live buffer, so every submission is
//! applied completely or not at all.
//!
//! ```text
//! join / submit / cursor / leave / sync
//!            │   (mpsc inbox, arrival order)
//!            ▼
//! ┌────────────────────────────────────────────┐
//! │ SessionCoordinator                         │
//! │   DocumentState ── RevisionHistory         │──► BroadcastGroup ──► connections
//! │   PresenceRegistry ── CrdtMirror (opt.)    │
//! └──────────────┬─────────────────────────────┘
//!                │ checkpoint (blocking task)
//!                ▼
//!          SnapshotStore
//! ```
//!
//! Lifecycle: the task loads the latest snapshot, serves commands, and once
//! it has had no participants for `idle_grace` it closes its inbox, rejects
//! whatever is still queued with `SessionClosed`, writes a final checkpoint,
//! unregisters itself and only then signals termination. A join racing with
//! teardown waits for that signal and starts a fresh session, which then
//! reads the final checkpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use quill_core::Operation;

use crate::broadcast::{AtomicBroadcastStats, BroadcastGroup, Connection, ConnectionId};
use crate::document::{DocumentState, HistoryEntry, RevisionHistory};
use crate::error::{CollabError, CollabResult};
use crate::mirror::CrdtMirror;
use crate::presence::PresenceRegistry;
use crate::protocol::{DocumentId, ParticipantId, PresenceEvent, ServerMessage};
use crate::storage::{Snapshot, SnapshotStore, StoreError, VersionHistory};

const INBOX_CAPACITY: usize = 1024;

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Applied operations kept for rebasing stale submissions
    pub history_limit: usize,
    /// How long a session with no participants stays alive
    pub idle_grace: Duration,
    /// Periodic checkpoint interval while the document is dirty
    pub checkpoint_interval: Duration,
    /// Messages buffered per participant. A delivery that finds the channel
    /// full evicts the participant immediately
    pub outbound_capacity: usize,
    /// `InvalidRevision` submissions tolerated before eviction
    pub max_protocol_violations: u32,
    /// Maintain a derived yrs replica of each document
    pub crdt_mirror: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            idle_grace: Duration::from_secs(5),
            checkpoint_interval: Duration::from_secs(30),
            outbound_capacity: 256,
            max_protocol_violations: 3,
            crdt_mirror: false,
        }
    }
}

impl SessionConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            idle_grace: Duration::from_millis(100),
            checkpoint_interval: Duration::from_millis(200),
            outbound_capacity: 64,
            ..Self::default()
        }
    }
}

/// State handed to a participant on join or resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub document_id: DocumentId,
    pub content: String,
    pub revision: u64,
    pub participants: Vec<ParticipantId>,
    /// Encoded yrs update, when the CRDT mirror is enabled.
    pub crdt_state: Option<Vec<u8>>,
}

impl SessionSnapshot {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Sync {
            document_id: self.document_id,
            content: self.content.clone(),
            revision: self.revision,
            participants: self.participants.clone(),
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Revision produced by the operation.
    pub revision: u64,
    /// Sequence number assigned on submission.
    pub seq: u64,
    /// The operation as applied, after rebasing.
    pub operation: Operation,
}

/// Counters shared by every session of a registry.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub(crate) applied: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) checkpoints: AtomicU64,
    pub(crate) checkpoint_failures: AtomicU64,
}

pub(crate) type SessionMap = Mutex<HashMap<DocumentId, SessionHandle>>;

/// Collaborators and configuration shared by all sessions.
pub(crate) struct SessionContext {
    pub(crate) config: SessionConfig,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) history: Option<Arc<dyn VersionHistory>>,
    pub(crate) sessions: Weak<SessionMap>,
    pub(crate) broadcast_stats: Arc<AtomicBroadcastStats>,
    pub(crate) counters: Arc<SessionCounters>,
}

pub(crate) enum SessionCommand {
    Join {
        participant_id: ParticipantId,
        connection: Connection,
        reply: oneshot::Sender<CollabResult<SessionSnapshot>>,
    },
    Submit {
        participant_id: ParticipantId,
        base_revision: u64,
        operation: Operation,
        reply: Option<oneshot::Sender<CollabResult<Ack>>>,
    },
    Cursor {
        participant_id: ParticipantId,
        position: usize,
        seq: u64,
    },
    Leave {
        participant_id: ParticipantId,
        /// Only leave if this connection is still the registered one.
        connection: Option<ConnectionId>,
        reply: Option<oneshot::Sender<bool>>,
    },
    Sync {
        participant_id: Option<ParticipantId>,
        reply: oneshot::Sender<CollabResult<SessionSnapshot>>,
    },
}

impl SessionCommand {
    fn reject(self, err: CollabError) {
        match self {
            SessionCommand::Join { reply, .. } | SessionCommand::Sync { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Submit { reply: Some(reply), .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Leave { reply: Some(reply), .. } => {
                let _ = reply.send(false);
            }
            SessionCommand::Submit { reply: None, .. }
            | SessionCommand::Leave { reply: None, .. }
            | SessionCommand::Cursor { .. } => {}
        }
    }
}

/// Registry-side handle to a running session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    document_id: DocumentId,
    generation: u64,
    tx: mpsc::Sender<SessionCommand>,
    terminated: watch::Receiver<bool>,
}

impl SessionHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueue a command without waiting for it to be processed.
    pub(crate) async fn send(&self, cmd: SessionCommand) -> CollabResult<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| CollabError::SessionClosed(self.document_id))
    }

    /// Enqueue a command and wait for its reply.
    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> CollabResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| CollabError::SessionClosed(self.document_id))
    }

    pub(crate) fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Give up this handle's sender. Once every handle is gone the session
    /// shuts down; the returned receiver flips to `true` when it has.
    pub(crate) fn into_termination(self) -> watch::Receiver<bool> {
        self.terminated
    }

    /// Resolve once the session has written its final checkpoint and
    /// unregistered.
    pub(crate) async fn terminated(&self) {
        let mut rx = self.terminated.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Start the coordinator task for `document_id`.
pub(crate) fn spawn(document_id: DocumentId, generation: u64, ctx: Arc<SessionContext>) -> SessionHandle {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let (terminated_tx, terminated) = watch::channel(false);
    tokio::spawn(run_session(document_id, generation, ctx, rx, terminated_tx));
    SessionHandle {
        document_id,
        generation,
        tx,
        terminated,
    }
}

async fn run_session(
    document_id: DocumentId,
    generation: u64,
    ctx: Arc<SessionContext>,
    mut rx: mpsc::Receiver<SessionCommand>,
    terminated: watch::Sender<bool>,
) {
    match load_document(&ctx, document_id).await {
        Ok(document) => {
            let mut coordinator = SessionCoordinator::new(document, ctx.clone());
            coordinator.run(&mut rx).await;
            coordinator.shutdown(&mut rx).await;
        }
        Err(e) => {
            log::error!("Failed to load document {document_id}: {e}");
            rx.close();
            while let Some(cmd) = rx.recv().await {
                cmd.reject(CollabError::Storage(e.clone()));
            }
        }
    }

    if let Some(sessions) = ctx.sessions.upgrade() {
        let mut sessions = sessions.lock().await;
        if sessions.get(&document_id).is_some_and(|h| h.generation == generation) {
            sessions.remove(&document_id);
        }
    }
    // Release the store before anyone waiting on termination reopens it.
    drop(ctx);
    let _ = terminated.send(true);
}

async fn load_document(ctx: &SessionContext, document_id: DocumentId) -> Result<DocumentState, StoreError> {
    let store = ctx.store.clone();
    let snapshot = tokio::task::spawn_blocking(move || store.load_snapshot(document_id))
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))??;

    Ok(match snapshot {
        Some(snapshot) => {
            log::info!(
                "Loaded document {document_id} at revision {} ({} bytes)",
                snapshot.revision,
                snapshot.content.len()
            );
            DocumentState::from_snapshot(snapshot)
        }
        None => {
            log::info!("Starting new document {document_id}");
            DocumentState::new(document_id, String::new(), 0)
        }
    })
}

struct SessionCoordinator {
    ctx: Arc<SessionContext>,
    document: DocumentState,
    history: RevisionHistory,
    presence: PresenceRegistry,
    group: BroadcastGroup,
    mirror: Option<CrdtMirror>,
    next_seq: u64,
    /// Highest revision known to be durably stored.
    persisted: Arc<AtomicU64>,
    checkpoint: Option<JoinHandle<()>>,
    idle_deadline: Option<Instant>,
}

impl SessionCoordinator {
    fn new(document: DocumentState, ctx: Arc<SessionContext>) -> Self {
        let mirror = ctx
            .config
            .crdt_mirror
            .then(|| CrdtMirror::new(document.content()));
        let history = RevisionHistory::new(ctx.config.history_limit);
        let group = BroadcastGroup::new(ctx.broadcast_stats.clone());
        let persisted = Arc::new(AtomicU64::new(document.revision()));
        let idle_deadline = Some(Instant::now() + ctx.config.idle_grace);
        Self {
            ctx,
            document,
            history,
            presence: PresenceRegistry::new(),
            group,
            mirror,
            next_seq: 1,
            persisted,
            checkpoint: None,
            idle_deadline,
        }
    }

    fn document_id(&self) -> DocumentId {
        self.document.document_id()
    }

    async fn run(&mut self, rx: &mut mpsc::Receiver<SessionCommand>) {
        let period = self.ctx.config.checkpoint_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let idle = idle_timer(self.idle_deadline);
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = ticker.tick() => self.checkpoint_if_dirty(),
                _ = idle => {
                    if self.presence.is_empty() {
                        log::info!("Session {} idle, closing", self.document_id());
                        break;
                    }
                    self.idle_deadline = None;
                }
            }
        }
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join { participant_id, connection, reply } => {
                let _ = reply.send(self.join(participant_id, connection));
            }
            SessionCommand::Submit { participant_id, base_revision, operation, reply } => {
                let result = self.submit(participant_id, base_revision, operation);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SessionCommand::Cursor { participant_id, position, seq } => {
                self.move_cursor(participant_id, position, seq);
            }
            SessionCommand::Leave { participant_id, connection, reply } => {
                let left = self.leave(participant_id, connection);
                if let Some(reply) = reply {
                    let _ = reply.send(left);
                }
            }
            SessionCommand::Sync { participant_id, reply } => {
                let _ = reply.send(self.sync(participant_id));
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            document_id: self.document_id(),
            content: self.document.content().to_owned(),
            revision: self.document.revision(),
            participants: self.presence.participants(),
            crdt_state: self.mirror.as_ref().map(CrdtMirror::encode_state),
        }
    }

    fn join(&mut self, participant_id: ParticipantId, connection: Connection) -> CollabResult<SessionSnapshot> {
        let is_new = self.presence.join(participant_id);
        if self.group.add(participant_id, connection).is_some() {
            log::debug!("Participant {participant_id} reconnected to {}", self.document_id());
        }
        self.idle_deadline = None;

        // The sync message goes first on the channel, before any broadcast
        // for a later revision.
        let snapshot = self.snapshot();
        if !self.group.send_to(&participant_id, Arc::new(snapshot.to_message())) {
            self.evict(vec![participant_id]);
            return Err(CollabError::ConnectionEvicted(participant_id));
        }

        if is_new {
            log::info!(
                "Participant {participant_id} joined {} at revision {} ({} present)",
                self.document_id(),
                snapshot.revision,
                self.presence.len()
            );
            let joined = ServerMessage::presence(participant_id, PresenceEvent::Joined);
            let failed = self.group.broadcast(Arc::new(joined), Some(participant_id));
            self.evict(failed);
        }
        Ok(snapshot)
    }

    fn submit(&mut self, participant_id: ParticipantId, base_revision: u64, operation: Operation) -> CollabResult<Ack> {
        if !self.presence.contains(&participant_id) {
            return Err(CollabError::NotJoined {
                document_id: self.document_id(),
                participant_id,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        match self.sequence(participant_id, seq, base_revision, operation) {
            Ok(ack) => Ok(ack),
            Err(err) => {
                self.reject(participant_id, &err);
                Err(err)
            }
        }
    }

    fn sequence(
        &mut self,
        participant_id: ParticipantId,
        seq: u64,
        base_revision: u64,
        operation: Operation,
    ) -> CollabResult<Ack> {
        let current = self.document.revision();
        let operation = if base_revision == current {
            operation
        } else {
            self.history.rebase(operation, base_revision, current)?
        };

        let before = self.mirror.as_ref().map(|_| self.document.content().to_owned());
        let revision = self.document.apply(&operation)?;
        if let (Some(mirror), Some(before)) = (self.mirror.as_mut(), before) {
            mirror.apply(&before, &operation);
        }
        self.presence.shift_cursors(&operation);
        self.history.push(HistoryEntry {
            revision,
            seq,
            sender: participant_id,
            operation: operation.clone(),
        });
        self.ctx.counters.applied.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "Applied op #{seq} from {participant_id} to {} (base {base_revision} → revision {revision})",
            self.document_id()
        );

        let broadcast = ServerMessage::Operation {
            operation: operation.clone(),
            revision,
            sender_id: participant_id,
            seq,
        };
        let mut failed = self.group.broadcast(Arc::new(broadcast), Some(participant_id));
        if !self.group.send_to(&participant_id, Arc::new(ServerMessage::Ack { revision, seq })) {
            failed.push(participant_id);
        }
        self.evict(failed);

        Ok(Ack { revision, seq, operation })
    }

    fn reject(&mut self, participant_id: ParticipantId, err: &CollabError) {
        self.ctx.counters.rejected.fetch_add(1, Ordering::Relaxed);
        log::warn!("Rejected operation from {participant_id} on {}: {err}", self.document_id());

        let mut evict = !self.group.send_to(&participant_id, Arc::new(ServerMessage::error(err)));
        if matches!(err, CollabError::InvalidRevision { .. }) {
            let violations = self.presence.record_violation(&participant_id);
            if violations >= self.ctx.config.max_protocol_violations {
                log::warn!("Participant {participant_id} reached {violations} protocol violations");
                evict = true;
            }
        }
        if evict {
            self.evict(vec![participant_id]);
        }
    }

    fn move_cursor(&mut self, participant_id: ParticipantId, position: usize, seq: u64) {
        let Some(position) = self.presence.move_cursor(&participant_id, position, seq, self.document.len()) else {
            return;
        };
        log::trace!("Cursor {participant_id} → {position} on {}", self.document_id());
        let cursor = ServerMessage::Cursor {
            participant_id,
            position,
            seq,
        };
        let failed = self.group.broadcast(Arc::new(cursor), Some(participant_id));
        self.evict(failed);
    }

    fn leave(&mut self, participant_id: ParticipantId, connection: Option<ConnectionId>) -> bool {
        if !self.presence.contains(&participant_id) {
            return false;
        }
        if connection.is_some() && self.group.connection_id(&participant_id) != connection {
            log::debug!("Ignoring disconnect of a replaced connection for {participant_id}");
            return false;
        }
        log::info!("Participant {participant_id} left {}", self.document_id());
        let failed = self.depart(participant_id);
        self.evict(failed);
        true
    }

    fn sync(&mut self, participant_id: Option<ParticipantId>) -> CollabResult<SessionSnapshot> {
        let snapshot = self.snapshot();
        if let Some(participant_id) = participant_id {
            if !self.presence.contains(&participant_id) {
                return Err(CollabError::NotJoined {
                    document_id: self.document_id(),
                    participant_id,
                });
            }
            if !self.group.send_to(&participant_id, Arc::new(snapshot.to_message())) {
                self.evict(vec![participant_id]);
            }
        }
        Ok(snapshot)
    }

    /// Evict participants whose channel failed, along with anyone who then
    /// fails to take the departure notice.
    fn evict(&mut self, participants: Vec<ParticipantId>) {
        let mut pending = participants;
        while let Some(participant_id) = pending.pop() {
            if !self.presence.contains(&participant_id) {
                continue;
            }
            log::warn!("Evicting {participant_id} from {}", self.document_id());
            self.group.record_eviction();
            pending.extend(self.depart(participant_id));
        }
    }

    /// Remove a participant and announce it. Returns failed deliveries.
    fn depart(&mut self, participant_id: ParticipantId) -> Vec<ParticipantId> {
        self.presence.leave(&participant_id);
        self.group.remove(&participant_id);
        if self.presence.is_empty() {
            self.idle_deadline = Some(Instant::now() + self.ctx.config.idle_grace);
        }
        let left = ServerMessage::presence(participant_id, PresenceEvent::Left);
        self.group.broadcast(Arc::new(left), None)
    }

    fn is_dirty(&self) -> bool {
        self.document.revision() > self.persisted.load(Ordering::Acquire)
    }

    /// Start a background checkpoint unless one is already running.
    fn checkpoint_if_dirty(&mut self) {
        if !self.is_dirty() {
            return;
        }
        if self.checkpoint.as_ref().is_some_and(|task| !task.is_finished()) {
            log::debug!("Checkpoint of {} still running, skipping", self.document_id());
            return;
        }
        self.checkpoint = Some(tokio::task::spawn_blocking(self.checkpoint_job()));
    }

    fn checkpoint_job(&self) -> impl FnOnce() + Send + 'static {
        let snapshot = self.document.snapshot();
        let store = self.ctx.store.clone();
        let history = self.ctx.history.clone();
        let persisted = self.persisted.clone();
        let counters = self.ctx.counters.clone();
        move || write_checkpoint(store.as_ref(), history.as_deref(), &snapshot, &persisted, &counters)
    }

    async fn shutdown(mut self, rx: &mut mpsc::Receiver<SessionCommand>) {
        let document_id = self.document_id();
        rx.close();
        while let Some(cmd) = rx.recv().await {
            cmd.reject(CollabError::SessionClosed(document_id));
        }

        if let Some(task) = self.checkpoint.take() {
            if let Err(e) = task.await {
                log::error!("Checkpoint task for {document_id} failed: {e}");
            }
        }
        if self.is_dirty() {
            if let Err(e) = tokio::task::spawn_blocking(self.checkpoint_job()).await {
                log::error!("Final checkpoint task for {document_id} failed: {e}");
            }
        }

        log::info!(
            "Session {document_id} closed at revision {} ({} ops in history)",
            self.document.revision(),
            self.history.len()
        );
    }
}

async fn idle_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn write_checkpoint(
    store: &dyn SnapshotStore,
    history: Option<&dyn VersionHistory>,
    snapshot: &Snapshot,
    persisted: &AtomicU64,
    counters: &SessionCounters,
) {
    match store.save_snapshot(snapshot) {
        Ok(()) => {
            persisted.fetch_max(snapshot.revision, Ordering::AcqRel);
            counters.checkpoints.fetch_add(1, Ordering::Relaxed);
            if let Some(history) = history {
                history.checkpointed(snapshot);
            }
            log::debug!("Checkpointed {} at revision {}", snapshot.document_id, snapshot.revision);
        }
        Err(e) => {
            counters.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "Checkpoint of {} at revision {} failed: {e}",
                snapshot.document_id,
                snapshot.revision
            );
        }
    }
}
