//! Error taxonomy for the collaboration core.
//!
//! Every per-operation failure is local to the submitting participant:
//! a rejected operation is never applied and never advances the revision.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use quill_core::OtError;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

pub type CollabResult<T> = Result<T, CollabError>;

/// Stable error codes carried by `error` messages on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    MalformedOperation,
    OperationOutOfBounds,
    RevisionTooOld,
    InvalidRevision,
    DocumentAccessDenied,
    NotJoined,
    Unavailable,
    Protocol,
    Internal,
}

impl ErrorCode {
    /// The submission was not applied; the sender should resynchronise.
    pub fn is_operation_rejection(self) -> bool {
        matches!(
            self,
            ErrorCode::MalformedOperation
                | ErrorCode::OperationOutOfBounds
                | ErrorCode::RevisionTooOld
                | ErrorCode::InvalidRevision
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum CollabError {
    /// Operation does not cover the whole buffer it claims to edit.
    #[error("Malformed operation: base length {base_len}, document length {doc_len}")]
    MalformedOperation { base_len: usize, doc_len: usize },

    /// Operation reaches past the end of the buffer.
    #[error("Operation out of bounds: base length {base_len}, document length {doc_len}")]
    OperationOutOfBounds { base_len: usize, doc_len: usize },

    /// Base revision has fallen out of the rolling history; client must resync.
    #[error("Revision {base_revision} too old (oldest available {oldest})")]
    RevisionTooOld { base_revision: u64, oldest: u64 },

    /// Base revision is ahead of the document. Protocol violation.
    #[error("Invalid revision {base_revision} (current {current})")]
    InvalidRevision { base_revision: u64, current: u64 },

    #[error("Access to document {document_id} denied for {participant_id}")]
    DocumentAccessDenied { document_id: Uuid, participant_id: Uuid },

    /// Participant's outbound channel stayed full; triggers `leave`.
    #[error("Connection for {0} evicted")]
    ConnectionEvicted(Uuid),

    #[error("Participant {participant_id} has not joined document {document_id}")]
    NotJoined { document_id: Uuid, participant_id: Uuid },

    /// The session shut down while the request was queued.
    #[error("Session for document {0} closed")]
    SessionClosed(Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    /// Classify a length failure of `op` against a buffer of `doc_len` chars.
    pub fn from_lengths(base_len: usize, doc_len: usize) -> Self {
        if base_len > doc_len {
            CollabError::OperationOutOfBounds { base_len, doc_len }
        } else {
            CollabError::MalformedOperation { base_len, doc_len }
        }
    }

    /// Map a transform-engine failure against a buffer of `doc_len` chars.
    pub fn from_ot(err: OtError, doc_len: usize) -> Self {
        match err {
            OtError::OutOfBounds { needed, .. } => {
                CollabError::OperationOutOfBounds { base_len: needed, doc_len }
            }
            OtError::LengthMismatch { covered, .. } => {
                CollabError::MalformedOperation { base_len: covered, doc_len }
            }
            OtError::IncompatibleLengths { actual, .. } => Self::from_lengths(actual, doc_len),
            OtError::LengthOverflow => CollabError::MalformedOperation { base_len: usize::MAX, doc_len },
            OtError::UnexpectedAck => CollabError::Protocol(ProtocolError::InvalidMessageType),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CollabError::MalformedOperation { .. } => ErrorCode::MalformedOperation,
            CollabError::OperationOutOfBounds { .. } => ErrorCode::OperationOutOfBounds,
            CollabError::RevisionTooOld { .. } => ErrorCode::RevisionTooOld,
            CollabError::InvalidRevision { .. } => ErrorCode::InvalidRevision,
            CollabError::DocumentAccessDenied { .. } => ErrorCode::DocumentAccessDenied,
            CollabError::NotJoined { .. } => ErrorCode::NotJoined,
            CollabError::SessionClosed(_) | CollabError::Storage(_) => ErrorCode::Unavailable,
            CollabError::Protocol(_) => ErrorCode::Protocol,
            CollabError::ConnectionEvicted(_) => ErrorCode::Internal,
        }
    }

    /// True for rejections of a single operation that leave the session untouched.
    pub fn is_operation_rejection(&self) -> bool {
        self.code().is_operation_rejection()
    }
}
