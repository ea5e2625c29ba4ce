//! Client-side OT state machine.
//!
//! A participant keeps at most one operation in flight. Local edits made
//! while waiting for the acknowledgement are composed into a buffer and
//! sent once the in-flight operation is confirmed.
//!
//! ```text
//!                 local edit                 local edit
//! Synchronized ─────────────► AwaitingConfirm ─────────► AwaitingWithBuffer
//!      ▲                          │    ▲                        │
//!      └──────── ack ─────────────┘    └────────── ack ─────────┘
//! ```
//!
//! Remote operations are always sequenced before anything still pending
//! locally, so they take the left (priority) side of [`transform`].

use crate::operation::{Operation, OtError};
use crate::transform::{compose, transform};

/// Pending-operation state of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Synchronized,
    AwaitingConfirm(Operation),
    AwaitingWithBuffer(Operation, Operation),
}

/// An operation ready to be submitted to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub base_revision: u64,
    pub operation: Operation,
}

/// Tracks the last revision seen from the server and what is pending.
#[derive(Debug, Clone)]
pub struct ClientState {
    revision: u64,
    state: SyncState,
}

impl ClientState {
    pub fn new(revision: u64) -> Self {
        Self {
            revision,
            state: SyncState::Synchronized,
        }
    }

    /// Last server revision incorporated locally.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn is_synchronized(&self) -> bool {
        self.state == SyncState::Synchronized
    }

    /// Record a local edit. Returns the operation to send now, if any.
    pub fn apply_client(&mut self, op: Operation) -> Result<Option<Outgoing>, OtError> {
        let (next, outgoing) = match std::mem::replace(&mut self.state, SyncState::Synchronized) {
            SyncState::Synchronized => {
                let outgoing = Outgoing {
                    base_revision: self.revision,
                    operation: op.clone(),
                };
                (SyncState::AwaitingConfirm(op), Some(outgoing))
            }
            SyncState::AwaitingConfirm(inflight) => (SyncState::AwaitingWithBuffer(inflight, op), None),
            SyncState::AwaitingWithBuffer(inflight, buffer) => match compose(&buffer, &op) {
                Ok(merged) => (SyncState::AwaitingWithBuffer(inflight, merged), None),
                Err(e) => {
                    self.state = SyncState::AwaitingWithBuffer(inflight, buffer);
                    return Err(e);
                }
            },
        };
        self.state = next;
        Ok(outgoing)
    }

    /// Incorporate an operation broadcast by the server.
    ///
    /// Returns the operation to apply to the local buffer.
    pub fn apply_server(&mut self, op: &Operation) -> Result<Operation, OtError> {
        let (next, local) = match &self.state {
            SyncState::Synchronized => (SyncState::Synchronized, op.clone()),
            SyncState::AwaitingConfirm(inflight) => {
                let (op_prime, inflight_prime) = transform(op, inflight)?;
                (SyncState::AwaitingConfirm(inflight_prime), op_prime)
            }
            SyncState::AwaitingWithBuffer(inflight, buffer) => {
                let (op_prime, inflight_prime) = transform(op, inflight)?;
                let (op_second, buffer_prime) = transform(&op_prime, buffer)?;
                (SyncState::AwaitingWithBuffer(inflight_prime, buffer_prime), op_second)
            }
        };
        self.state = next;
        self.revision += 1;
        Ok(local)
    }

    /// The in-flight operation was applied by the server.
    ///
    /// Returns the buffered operation to send next, if any.
    pub fn server_ack(&mut self) -> Result<Option<Outgoing>, OtError> {
        let (next, outgoing) = match std::mem::replace(&mut self.state, SyncState::Synchronized) {
            SyncState::Synchronized => return Err(OtError::UnexpectedAck),
            SyncState::AwaitingConfirm(_) => (SyncState::Synchronized, None),
            SyncState::AwaitingWithBuffer(_, buffer) => {
                let outgoing = Outgoing {
                    base_revision: self.revision + 1,
                    operation: buffer.clone(),
                };
                (SyncState::AwaitingConfirm(buffer), Some(outgoing))
            }
        };
        self.revision += 1;
        self.state = next;
        Ok(outgoing)
    }

    /// Drop pending state after a full resynchronisation.
    pub fn resync(&mut self, revision: u64) {
        if !self.is_synchronized() {
            log::debug!("Discarding pending local edits on resync to revision {revision}");
        }
        self.revision = revision;
        self.state = SyncState::Synchronized;
    }
}
