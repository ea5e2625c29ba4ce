//! # quill-core — Operational transform engine for Quill
//!
//! Pure, synchronous building blocks shared by the collaboration server
//! and its clients:
//!
//! - [`operation`] — `Operation` (retain/insert/delete spans) and `apply`
//! - [`transform`] — `compose` and `transform` for concurrent edits
//! - [`client`] — client-side pending-operation state machine
//!
//! Nothing here performs I/O or holds shared state.

pub mod operation;
pub mod transform;
pub mod client;

pub use operation::{Component, Operation, OtError};
pub use transform::{compose, transform};
pub use client::{ClientState, Outgoing, SyncState};
