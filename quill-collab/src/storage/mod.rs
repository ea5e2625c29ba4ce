//! Durable storage collaborators.
//!
//! The collaboration core never persists individual edits. It hands a
//! point-in-time [`Snapshot`] to a [`SnapshotStore`] on checkpoint and
//! reads one back when a session is created:
//!
//! ```text
//! ┌───────────────────┐  save_snapshot (blocking task)  ┌──────────────┐
//! │ SessionCoordinator│ ──────────────────────────────► │ SnapshotStore│
//! │ (live buffer)     │ ◄────────────────────────────── │ Rocks/Memory │
//! └─────────┬─────────┘  load_snapshot (session start)  └──────────────┘
//!           │ after each successful checkpoint
//!           ▼
//!   VersionHistory::checkpointed
//! ```

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::DocumentId;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};

/// Point-in-time copy of a document handed to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document_id: DocumentId,
    pub content: String,
    pub revision: u64,
}

impl Snapshot {
    /// Empty document at revision 0.
    pub fn empty(document_id: DocumentId) -> Self {
        Self {
            document_id,
            content: String::new(),
            revision: 0,
        }
    }
}

/// Durable snapshot storage. Calls may block; the core runs them on
/// blocking tasks.
pub trait SnapshotStore: Send + Sync {
    fn load_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError>;

    /// Store `snapshot`. A snapshot older than the stored one is ignored.
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// Optional observer notified on checkpoint boundaries.
pub trait VersionHistory: Send + Sync {
    fn checkpointed(&self, snapshot: &Snapshot);
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Storage task failed: {0}")]
    TaskFailed(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
