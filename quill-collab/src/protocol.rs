//! Wire protocol between participants and the collaboration server.
//!
//! Every message kind is a variant of a closed enum, so adding one is a
//! compile-checked change to every `match` that handles it.
//!
//! Frames come in two encodings:
//! ```text
//! Binary frame ── bincode (serde, standard config) ── compact, default
//! Text frame   ── JSON                             ── browser clients
//! ```
//! The server replies in whichever encoding the client last used.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

use quill_core::Operation;

use crate::error::{CollabError, ErrorCode};

pub type DocumentId = Uuid;
pub type ParticipantId = Uuid;

/// Presence transitions announced to the other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    Joined,
    Left,
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Enter a document's session. The participant id is taken as already
    /// authenticated by whatever fronts this server.
    Join {
        document_id: DocumentId,
        participant_id: ParticipantId,
    },
    /// Submit an edit computed against `base_revision`.
    Operation {
        base_revision: u64,
        operation: Operation,
    },
    /// Cursor moved. `seq` increases per sender.
    Cursor { position: usize, seq: u64 },
    /// Request a full resynchronisation.
    Sync,
    Leave,
    Ping,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full document state, on join or on request.
    Sync {
        document_id: DocumentId,
        content: String,
        revision: u64,
        participants: Vec<ParticipantId>,
    },
    /// An applied operation, already transformed to `revision - 1`.
    Operation {
        operation: Operation,
        revision: u64,
        sender_id: ParticipantId,
        seq: u64,
    },
    /// The recipient's own operation was applied as `revision`.
    Ack { revision: u64, seq: u64 },
    Cursor {
        participant_id: ParticipantId,
        position: usize,
        seq: u64,
    },
    Presence {
        participant_id: ParticipantId,
        event: PresenceEvent,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },
    Error { message: String, code: ErrorCode },
    Pong,
}

impl ServerMessage {
    pub fn presence(participant_id: ParticipantId, event: PresenceEvent) -> Self {
        ServerMessage::Presence {
            participant_id,
            event,
            timestamp: now_millis(),
        }
    }

    pub fn error(err: &CollabError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
            code: err.code(),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Sync { .. } => "sync",
            ServerMessage::Operation { .. } => "operation",
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Cursor { .. } => "cursor",
            ServerMessage::Presence { .. } => "presence",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
        }
    }
}

/// Wire encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Binary,
    Json,
}

/// Transport-agnostic frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    pub fn encoding(&self) -> Encoding {
        match self {
            Frame::Binary(_) => Encoding::Binary,
            Frame::Text(_) => Encoding::Json,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Binary(b) => b.len(),
            Frame::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialize `msg` into a frame of the given encoding.
pub fn encode<T: Serialize>(msg: &T, encoding: Encoding) -> Result<Frame, ProtocolError> {
    match encoding {
        Encoding::Binary => bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map(Frame::Binary)
            .map_err(|e| ProtocolError::SerializationError(e.to_string())),
        Encoding::Json => serde_json::to_string(msg)
            .map(Frame::Text)
            .map_err(|e| ProtocolError::SerializationError(e.to_string())),
    }
}

/// Deserialize a frame, whichever encoding it uses.
pub fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, ProtocolError> {
    match frame {
        Frame::Binary(bytes) => {
            let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
            Ok(msg)
        }
        Frame::Text(text) => serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
}
