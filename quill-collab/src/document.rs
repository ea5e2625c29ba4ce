//! Authoritative document buffer and the rolling operation history used
//! to rebase stale submissions.

use std::collections::VecDeque;

use quill_core::{transform, Operation};

use crate::error::{CollabError, CollabResult};
use crate::protocol::{DocumentId, ParticipantId};
use crate::storage::Snapshot;

/// Live document content. Only the session coordinator holds one.
#[derive(Debug, Clone)]
pub struct DocumentState {
    document_id: DocumentId,
    content: String,
    /// Length of `content` in chars.
    len: usize,
    revision: u64,
}

impl DocumentState {
    pub fn new(document_id: DocumentId, content: String, revision: u64) -> Self {
        let len = content.chars().count();
        Self {
            document_id,
            content,
            len,
            revision,
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self::new(snapshot.document_id, snapshot.content, snapshot.revision)
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Apply `op` against the current revision.
    ///
    /// On error neither content nor revision changes.
    pub fn apply(&mut self, op: &Operation) -> CollabResult<u64> {
        if op.base_len() != self.len {
            return Err(CollabError::from_lengths(op.base_len(), self.len));
        }
        let next = op
            .apply(&self.content)
            .map_err(|e| CollabError::from_ot(e, self.len))?;
        let len = next.chars().count();
        if len != op.target_len() {
            return Err(CollabError::MalformedOperation { base_len: op.base_len(), doc_len: self.len });
        }
        self.content = next;
        self.len = len;
        self.revision += 1;
        Ok(self.revision)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            document_id: self.document_id,
            content: self.content.clone(),
            revision: self.revision,
        }
    }
}

/// An applied operation as recorded in the history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Revision this operation produced.
    pub revision: u64,
    /// Submission sequence number.
    pub seq: u64,
    pub sender: ParticipantId,
    pub operation: Operation,
}

/// The last `limit` applied operations, oldest first.
#[derive(Debug)]
pub struct RevisionHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl RevisionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1024)),
            limit,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest base revision that can still be rebased at `current`.
    pub fn oldest_base(&self, current: u64) -> u64 {
        current.saturating_sub(self.entries.len() as u64)
    }

    /// Operations applied after `base_revision`, oldest first.
    pub fn ops_since(
        &self,
        base_revision: u64,
        current: u64,
    ) -> CollabResult<impl Iterator<Item = &HistoryEntry>> {
        if base_revision > current {
            return Err(CollabError::InvalidRevision { base_revision, current });
        }
        let oldest = self.oldest_base(current);
        if base_revision < oldest {
            return Err(CollabError::RevisionTooOld { base_revision, oldest });
        }
        let skip = (base_revision - oldest) as usize;
        Ok(self.entries.iter().skip(skip))
    }

    /// Rebase `op`, computed against `base_revision`, onto `current`.
    ///
    /// Each historic operation was sequenced earlier, so it takes the
    /// priority side of the transform and wins insert ties.
    pub fn rebase(&self, op: Operation, base_revision: u64, current: u64) -> CollabResult<Operation> {
        let mut op = op;
        for entry in self.ops_since(base_revision, current)? {
            let (_, rebased) = transform(&entry.operation, &op)
                .map_err(|_| CollabError::from_lengths(op.base_len(), entry.operation.base_len()))?;
            op = rebased;
        }
        Ok(op)
    }
}
