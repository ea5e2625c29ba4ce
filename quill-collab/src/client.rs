//! WebSocket sync client.
//!
//! Keeps a local copy of the document and the OT pending-operation state:
//! - local edits apply immediately and go to the server one at a time
//! - remote operations are transformed against whatever is still pending
//! - a rejected submission or a revision gap triggers a full resync
//!
//! Application code consumes [`SyncEvent`]s from the event receiver.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use quill_core::{ClientState, Operation, Outgoing};

use crate::error::{CollabError, CollabResult, ErrorCode};
use crate::protocol::{
    self, ClientMessage, DocumentId, Encoding, Frame, ParticipantId, PresenceEvent, ProtocolError, ServerMessage,
};

const CHANNEL_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Full state received (initial join or resync)
    Synced {
        revision: u64,
        participants: Vec<ParticipantId>,
    },
    /// A remote operation was applied locally, already transformed
    RemoteOperation {
        sender_id: ParticipantId,
        revision: u64,
        operation: Operation,
    },
    /// Our in-flight operation was applied as `revision`
    Acknowledged { revision: u64 },
    Presence {
        participant_id: ParticipantId,
        event: PresenceEvent,
    },
    Cursor {
        participant_id: ParticipantId,
        position: usize,
    },
    Error { code: ErrorCode, message: String },
    Disconnected,
}

/// Local replica.
struct Replica {
    content: String,
    state: ClientState,
    synced: bool,
    cursor_seq: u64,
    remote_cursor_seq: HashMap<ParticipantId, u64>,
}

impl Replica {
    fn new() -> Self {
        Self {
            content: String::new(),
            state: ClientState::new(0),
            synced: false,
            cursor_seq: 0,
            remote_cursor_seq: HashMap::new(),
        }
    }
}

/// The sync client.
pub struct SyncClient {
    participant_id: ParticipantId,
    document_id: DocumentId,
    server_url: String,
    encoding: Encoding,
    replica: Arc<Mutex<Replica>>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(participant_id: ParticipantId, document_id: DocumentId, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            participant_id,
            document_id,
            server_url: server_url.into(),
            encoding: Encoding::Binary,
            replica: Arc::new(Mutex::new(Replica::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Speak JSON text frames instead of bincode.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and join the document. The initial state arrives as
    /// [`SyncEvent::Synced`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
        let encoding = self.encoding;
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let message = match protocol::encode(&msg, encoding) {
                    Ok(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
                    Ok(Frame::Text(text)) => Message::Text(text.into()),
                    Err(e) => {
                        log::error!("Failed to encode {msg:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.replica.lock().await = Replica::new();
        let join = ClientMessage::Join {
            document_id: self.document_id,
            participant_id: self.participant_id,
        };
        out_tx.send(join).await.map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx.clone());
        *self.state.write().await = ConnectionState::Connected;

        // Reader task: process incoming server messages
        let reader = Reader {
            replica: self.replica.clone(),
            out_tx,
            event_tx: self.event_tx.clone(),
        };
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let frame = match msg {
                    Ok(Message::Binary(data)) => Frame::Binary(data.into()),
                    Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match protocol::decode::<ServerMessage>(&frame) {
                    Ok(msg) => reader.handle(msg).await,
                    Err(e) => log::warn!("Undecodable frame from server: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = reader.event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Apply a local edit and submit it.
    pub async fn edit(&self, operation: Operation) -> CollabResult<()> {
        let outgoing = {
            let mut replica = self.replica.lock().await;
            if !replica.synced {
                return Err(CollabError::Protocol(ProtocolError::UnexpectedMessage(
                    "edit while not synchronized".into(),
                )));
            }
            let len = replica.content.chars().count();
            let next = operation
                .apply(&replica.content)
                .map_err(|e| CollabError::from_ot(e, len))?;
            let outgoing = replica
                .state
                .apply_client(operation)
                .map_err(|e| CollabError::from_ot(e, len))?;
            replica.content = next;
            outgoing
        };
        if let Some(outgoing) = outgoing {
            self.send(submit(outgoing)).await?;
        }
        Ok(())
    }

    /// Insert `text` at char offset `offset`.
    pub async fn insert(&self, offset: usize, text: &str) -> CollabResult<()> {
        let len = self.len().await;
        self.edit(Operation::insert_at(len, offset.min(len), text)).await
    }

    /// Delete `count` chars starting at `offset`.
    pub async fn delete(&self, offset: usize, count: usize) -> CollabResult<()> {
        let len = self.len().await;
        let offset = offset.min(len);
        self.edit(Operation::delete_at(len, offset, count.min(len - offset))).await
    }

    /// Report our cursor position.
    pub async fn move_cursor(&self, position: usize) -> CollabResult<()> {
        let seq = {
            let mut replica = self.replica.lock().await;
            replica.cursor_seq += 1;
            replica.cursor_seq
        };
        self.send(ClientMessage::Cursor { position, seq }).await
    }

    /// Ask for a full resynchronisation. Pending local edits are dropped
    /// when the snapshot arrives.
    pub async fn resync(&self) -> CollabResult<()> {
        self.replica.lock().await.synced = false;
        self.send(ClientMessage::Sync).await
    }

    pub async fn ping(&self) -> CollabResult<()> {
        self.send(ClientMessage::Ping).await
    }

    /// Leave the document and close the connection.
    pub async fn leave(&mut self) -> CollabResult<()> {
        let result = self.send(ClientMessage::Leave).await;
        self.outgoing_tx = None;
        result
    }

    /// Current local content, including unacknowledged edits.
    pub async fn content(&self) -> String {
        self.replica.lock().await.content.clone()
    }

    /// Last server revision incorporated locally.
    pub async fn revision(&self) -> u64 {
        self.replica.lock().await.state.revision()
    }

    /// True once synced with nothing pending.
    pub async fn is_synchronized(&self) -> bool {
        let replica = self.replica.lock().await;
        replica.synced && replica.state.is_synchronized()
    }

    async fn len(&self) -> usize {
        self.replica.lock().await.content.chars().count()
    }

    async fn send(&self, msg: ClientMessage) -> CollabResult<()> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(CollabError::Protocol(ProtocolError::ConnectionClosed))?;
        tx.send(msg)
            .await
            .map_err(|_| CollabError::Protocol(ProtocolError::ConnectionClosed))
    }
}

fn submit(outgoing: Outgoing) -> ClientMessage {
    ClientMessage::Operation {
        base_revision: outgoing.base_revision,
        operation: outgoing.operation,
    }
}

/// State shared with the reader task.
struct Reader {
    replica: Arc<Mutex<Replica>>,
    out_tx: mpsc::Sender<ClientMessage>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Reader {
    async fn handle(&self, msg: ServerMessage) {
        let (event, reply) = self.apply(msg).await;
        if let Some(reply) = reply {
            let _ = self.out_tx.send(reply).await;
        }
        if let Some(event) = event {
            let _ = self.event_tx.send(event).await;
        }
    }

    /// Update the replica. Returns the event to emit and a message to send.
    async fn apply(&self, msg: ServerMessage) -> (Option<SyncEvent>, Option<ClientMessage>) {
        let mut replica = self.replica.lock().await;
        match msg {
            ServerMessage::Sync { content, revision, participants, .. } => {
                replica.content = content;
                replica.state.resync(revision);
                replica.synced = true;
                log::debug!("Synced at revision {revision}");
                (Some(SyncEvent::Synced { revision, participants }), None)
            }
            ServerMessage::Operation { operation, revision, sender_id, .. } => {
                if !replica.synced {
                    return (None, None);
                }
                if revision != replica.state.revision() + 1 {
                    log::warn!(
                        "Revision gap (have {}, got {revision}), resyncing",
                        replica.state.revision()
                    );
                    replica.synced = false;
                    return (None, Some(ClientMessage::Sync));
                }
                let applied = replica
                    .state
                    .apply_server(&operation)
                    .and_then(|local| local.apply(&replica.content).map(|next| (local, next)));
                match applied {
                    Ok((local, next)) => {
                        replica.content = next;
                        let event = SyncEvent::RemoteOperation {
                            sender_id,
                            revision,
                            operation: local,
                        };
                        (Some(event), None)
                    }
                    Err(e) => {
                        log::error!("Failed to apply remote operation at revision {revision}: {e}");
                        replica.synced = false;
                        (None, Some(ClientMessage::Sync))
                    }
                }
            }
            ServerMessage::Ack { revision, .. } => {
                // Awaiting a snapshot: it already covers this operation and
                // the buffer is about to be discarded.
                if !replica.synced {
                    return (None, None);
                }
                match replica.state.server_ack() {
                    Ok(next) => (Some(SyncEvent::Acknowledged { revision }), next.map(submit)),
                    Err(e) => {
                        log::warn!("Unexpected ack for revision {revision}: {e}");
                        (None, None)
                    }
                }
            }
            ServerMessage::Cursor { participant_id, position, seq } => {
                let last = replica.remote_cursor_seq.entry(participant_id).or_insert(0);
                if seq <= *last {
                    return (None, None);
                }
                *last = seq;
                (Some(SyncEvent::Cursor { participant_id, position }), None)
            }
            ServerMessage::Presence { participant_id, event, .. } => {
                if event == PresenceEvent::Left {
                    replica.remote_cursor_seq.remove(&participant_id);
                }
                (Some(SyncEvent::Presence { participant_id, event }), None)
            }
            ServerMessage::Error { code, message } => {
                log::warn!("Server error {code:?}: {message}");
                // A rejected submission is never acked; start over from a snapshot.
                let rejected = code.is_operation_rejection();
                if rejected {
                    replica.synced = false;
                }
                (Some(SyncEvent::Error { code, message }), rejected.then_some(ClientMessage::Sync))
            }
            ServerMessage::Pong => {
                log::trace!("Pong");
                (None, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn reader() -> (Reader, mpsc::Receiver<ClientMessage>, mpsc::Receiver<SyncEvent>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let reader = Reader {
            replica: Arc::new(Mutex::new(Replica::new())),
            out_tx,
            event_tx,
        };
        (reader, out_rx, event_rx)
    }

    fn sync(content: &str, revision: u64) -> ServerMessage {
        ServerMessage::Sync {
            document_id: Uuid::new_v4(),
            content: content.into(),
            revision,
            participants: vec![],
        }
    }

    #[tokio::test]
    async fn test_sync_then_remote_operation() {
        let (reader, _out, mut events) = reader();
        reader.handle(sync("AB", 4)).await;
        assert!(matches!(events.recv().await, Some(SyncEvent::Synced { revision: 4, .. })));

        let sender = Uuid::new_v4();
        reader
            .handle(ServerMessage::Operation {
                operation: Operation::insert_at(2, 1, "X"),
                revision: 5,
                sender_id: sender,
                seq: 1,
            })
            .await;
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::RemoteOperation { revision: 5, .. })
        ));

        let replica = reader.replica.lock().await;
        assert_eq!(replica.content, "AXB");
        assert_eq!(replica.state.revision(), 5);
    }

    #[tokio::test]
    async fn test_revision_gap_requests_resync() {
        let (reader, mut out, _events) = reader();
        reader.handle(sync("AB", 4)).await;
        reader
            .handle(ServerMessage::Operation {
                operation: Operation::insert_at(2, 1, "X"),
                revision: 7,
                sender_id: Uuid::new_v4(),
                seq: 3,
            })
            .await;

        assert_eq!(out.recv().await, Some(ClientMessage::Sync));
        assert_eq!(reader.replica.lock().await.content, "AB");
    }

    #[tokio::test]
    async fn test_ack_sends_buffered_edit() {
        let (reader, mut out, _events) = reader();
        reader.handle(sync("", 0)).await;
        {
            let mut replica = reader.replica.lock().await;
            replica.state.apply_client(Operation::insert_at(0, 0, "a")).unwrap();
            replica.state.apply_client(Operation::insert_at(1, 1, "b")).unwrap();
        }

        reader.handle(ServerMessage::Ack { revision: 1, seq: 1 }).await;
        match out.recv().await {
            Some(ClientMessage::Operation { base_revision, operation }) => {
                assert_eq!(base_revision, 1);
                assert_eq!(operation.apply("a").unwrap(), "ab");
            }
            other => panic!("Expected buffered operation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_triggers_resync() {
        let (reader, mut out, mut events) = reader();
        reader.handle(sync("hello", 5)).await;
        let _ = events.recv().await;

        reader
            .handle(ServerMessage::Error {
                code: ErrorCode::RevisionTooOld,
                message: "too old".into(),
            })
            .await;
        assert_eq!(out.recv().await, Some(ClientMessage::Sync));
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::Error { code: ErrorCode::RevisionTooOld, .. })
        ));
        assert!(!reader.replica.lock().await.synced);
    }

    #[tokio::test]
    async fn test_out_of_order_cursor_dropped() {
        let (reader, _out, mut events) = reader();
        let peer = Uuid::new_v4();
        reader
            .handle(ServerMessage::Cursor { participant_id: peer, position: 4, seq: 2 })
            .await;
        reader
            .handle(ServerMessage::Cursor { participant_id: peer, position: 1, seq: 1 })
            .await;
        reader
            .handle(ServerMessage::Cursor { participant_id: peer, position: 6, seq: 3 })
            .await;

        assert_eq!(events.recv().await, Some(SyncEvent::Cursor { participant_id: peer, position: 4 }));
        assert_eq!(events.recv().await, Some(SyncEvent::Cursor { participant_id: peer, position: 6 }));
    }

    #[tokio::test]
    async fn test_edit_requires_connection() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://127.0.0.1:1");
        assert!(client.edit(Operation::insert_at(0, 0, "x")).await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
