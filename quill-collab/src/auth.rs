//! Document access checks performed on join.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::protocol::{DocumentId, ParticipantId};

/// Decides whether a participant may open a document.
///
/// Implementations may consult a database, so the check is async.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_access(&self, participant_id: ParticipantId, document_id: DocumentId) -> bool;
}

/// Grants every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_access(&self, _participant_id: ParticipantId, _document_id: DocumentId) -> bool {
        true
    }
}

/// Static per-document access list. Documents without an entry are denied.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    grants: HashMap<DocumentId, HashSet<ParticipantId>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, document_id: DocumentId, participant_id: ParticipantId) -> Self {
        self.grants.entry(document_id).or_default().insert(participant_id);
        self
    }

    pub fn revoke(&mut self, document_id: DocumentId, participant_id: ParticipantId) -> bool {
        self.grants
            .get_mut(&document_id)
            .is_some_and(|set| set.remove(&participant_id))
    }
}

#[async_trait]
impl Authorizer for AccessList {
    async fn can_access(&self, participant_id: ParticipantId, document_id: DocumentId) -> bool {
        self.grants
            .get(&document_id)
            .is_some_and(|set| set.contains(&participant_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.can_access(Uuid::new_v4(), Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_access_list() {
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut acl = AccessList::new().grant(doc, alice);

        assert!(acl.can_access(alice, doc).await);
        assert!(!acl.can_access(bob, doc).await);
        assert!(!acl.can_access(alice, Uuid::new_v4()).await);

        assert!(acl.revoke(doc, alice));
        assert!(!acl.revoke(doc, alice));
        assert!(!acl.can_access(alice, doc).await);
    }
}
