//! In-process snapshot store for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{Snapshot, SnapshotStore, StoreError};
use crate::protocol::DocumentId;

#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<DocumentId, Snapshot>>,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, as if it had been checkpointed earlier.
    pub fn with_document(self, document_id: DocumentId, content: &str, revision: u64) -> Self {
        if let Ok(mut map) = self.snapshots.write() {
            map.insert(
                document_id,
                Snapshot {
                    document_id,
                    content: content.to_owned(),
                    revision,
                },
            );
        }
        self
    }

    /// Number of accepted `save_snapshot` calls.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn get(&self, document_id: DocumentId) -> Option<Snapshot> {
        self.snapshots.read().ok()?.get(&document_id).cloned()
    }
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError> {
        let map = self
            .snapshots
            .read()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(map.get(&document_id).cloned())
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut map = self
            .snapshots
            .write()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        if let Some(existing) = map.get(&snapshot.document_id) {
            if existing.revision > snapshot.revision {
                log::debug!(
                    "Ignoring stale snapshot for {} (revision {} < {})",
                    snapshot.document_id,
                    snapshot.revision,
                    existing.revision
                );
                return Ok(());
            }
        }
        map.insert(snapshot.document_id, snapshot.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
