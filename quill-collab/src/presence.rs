//! Presence registry: who is in a document and where their cursor is.
//!
//! Presence is not ordered against revisions. The only ordering kept is
//! per sender: cursor updates carry a sequence number and anything older
//! than the last accepted update from that sender is dropped.
//!
//! ```text
//! join ──► Participant { cursor: None }
//! cursor(pos, seq) ──► clamp to doc length ──► keep if seq > last seq
//! applied operation ──► shift every cursor through it
//! leave ──► removed (idempotent)
//! ```

use std::collections::HashMap;
use std::time::SystemTime;

use quill_core::Operation;

use crate::protocol::ParticipantId;

/// One connected editor within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub participant_id: ParticipantId,
    /// Last known cursor, in chars.
    pub cursor: Option<usize>,
    /// Sequence number of the accepted cursor update.
    pub cursor_seq: u64,
    /// Orders the participant list handed out on sync.
    pub joined_at: SystemTime,
    /// Protocol violations recorded so far.
    pub violations: u32,
}

impl Participant {
    fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            cursor: None,
            cursor_seq: 0,
            joined_at: SystemTime::now(),
            violations: 0,
        }
    }
}

/// Participants of one document session, keyed by id.
///
/// Owned by the session coordinator, so every method runs on the session
/// task and needs no locking.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    participants: HashMap<ParticipantId, Participant>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant. Returns false if it was already present.
    pub fn join(&mut self, participant_id: ParticipantId) -> bool {
        if self.participants.contains_key(&participant_id) {
            return false;
        }
        self.participants.insert(participant_id, Participant::new(participant_id));
        true
    }

    /// Remove a participant. A second call is a no-op returning `None`.
    pub fn leave(&mut self, participant_id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(participant_id)
    }

    /// Record a cursor move, clamped to `doc_len`.
    ///
    /// Returns the stored position, or `None` if the participant is unknown
    /// or the update is older than one already accepted.
    pub fn move_cursor(
        &mut self,
        participant_id: &ParticipantId,
        position: usize,
        seq: u64,
        doc_len: usize,
    ) -> Option<usize> {
        let participant = self.participants.get_mut(participant_id)?;
        if participant.cursor.is_some() && seq <= participant.cursor_seq {
            log::trace!(
                "Dropping stale cursor from {participant_id} (seq {seq} <= {})",
                participant.cursor_seq
            );
            return None;
        }
        let position = position.min(doc_len);
        participant.cursor = Some(position);
        participant.cursor_seq = seq;
        Some(position)
    }

    /// Move every known cursor through an applied operation.
    pub fn shift_cursors(&mut self, op: &Operation) {
        for participant in self.participants.values_mut() {
            if let Some(cursor) = participant.cursor.as_mut() {
                *cursor = op.transform_index((*cursor).min(op.base_len()));
            }
        }
    }

    /// Count a protocol violation. Returns the new total, or 0 if unknown.
    pub fn record_violation(&mut self, participant_id: &ParticipantId) -> u32 {
        match self.participants.get_mut(participant_id) {
            Some(participant) => {
                participant.violations += 1;
                participant.violations
            }
            None => 0,
        }
    }

    /// Current state of one participant.
    pub fn get(&self, participant_id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    /// True between a participant's join and its leave.
    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.participants.contains_key(participant_id)
    }

    /// Participant ids, oldest join first.
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut all: Vec<&Participant> = self.participants.values().collect();
        all.sort_by_key(|p| p.joined_at);
        all.into_iter().map(|p| p.participant_id).collect()
    }

    /// Number of joined participants.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_join_and_leave() {
        let mut presence = PresenceRegistry::new();
        let alice = Uuid::new_v4();

        assert!(presence.join(alice));
        assert!(!presence.join(alice));
        assert_eq!(presence.len(), 1);

        assert!(presence.leave(&alice).is_some());
        assert!(presence.leave(&alice).is_none());
        assert!(presence.is_empty());
    }

    #[test]
    fn test_cursor_clamped() {
        let mut presence = PresenceRegistry::new();
        let alice = Uuid::new_v4();
        presence.join(alice);

        assert_eq!(presence.move_cursor(&alice, 99, 1, 5), Some(5));
        assert_eq!(presence.get(&alice).unwrap().cursor, Some(5));
    }

    #[test]
    fn test_stale_cursor_dropped() {
        let mut presence = PresenceRegistry::new();
        let alice = Uuid::new_v4();
        presence.join(alice);

        assert_eq!(presence.move_cursor(&alice, 3, 5, 10), Some(3));
        assert_eq!(presence.move_cursor(&alice, 1, 4, 10), None);
        assert_eq!(presence.move_cursor(&alice, 1, 5, 10), None);
        assert_eq!(presence.move_cursor(&alice, 7, 6, 10), Some(7));
    }

    #[test]
    fn test_cursor_unknown_participant() {
        let mut presence = PresenceRegistry::new();
        assert_eq!(presence.move_cursor(&Uuid::new_v4(), 0, 1, 0), None);
    }

    #[test]
    fn test_cursors_shift_through_operations() {
        let mut presence = PresenceRegistry::new();
        let before = Uuid::new_v4();
        let after = Uuid::new_v4();
        presence.join(before);
        presence.join(after);
        presence.move_cursor(&before, 1, 1, 5);
        presence.move_cursor(&after, 4, 1, 5);

        // "hello" → "heyyllo"
        presence.shift_cursors(&Operation::insert_at(5, 2, "yy"));
        assert_eq!(presence.get(&before).unwrap().cursor, Some(1));
        assert_eq!(presence.get(&after).unwrap().cursor, Some(6));

        // delete everything
        presence.shift_cursors(&Operation::delete_at(7, 0, 7));
        assert_eq!(presence.get(&after).unwrap().cursor, Some(0));
    }

    #[test]
    fn test_contains_tracks_membership() {
        let mut presence = PresenceRegistry::new();
        let alice = Uuid::new_v4();
        assert!(!presence.contains(&alice));
        assert!(presence.get(&alice).is_none());

        presence.join(alice);
        assert!(presence.contains(&alice));
        assert_eq!(presence.participants(), vec![alice]);
        let joined = presence.get(&alice).unwrap();
        assert_eq!(joined.cursor, None);
        assert_eq!(joined.cursor_seq, 0);

        presence.leave(&alice);
        assert!(!presence.contains(&alice));
        assert!(presence.participants().is_empty());
    }

    #[test]
    fn test_violations_counted() {
        let mut presence = PresenceRegistry::new();
        let alice = Uuid::new_v4();
        presence.join(alice);
        assert_eq!(presence.record_violation(&alice), 1);
        assert_eq!(presence.record_violation(&alice), 2);
        assert_eq!(presence.record_violation(&Uuid::new_v4()), 0);
    }
}
