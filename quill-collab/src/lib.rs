//! # quill-collab — Real-time collaborative editing service for Quill
//!
//! Serializes concurrent edits to shared notes through one coordinator per
//! document and fans the result out to every participant.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │  bincode / JSON     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────────┐
//! │ ClientState │                     │ SessionRegistry │
//! │ + content   │                     └──────┬──────────┘
//! └─────────────┘                            │ one actor per document
//!                                    ┌───────┴──────────┐
//!                                    │ SessionCoordinator│──► SnapshotStore
//!                                    │ presence, history │
//!                                    └───────┬──────────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — wire messages and frame encoding
//! - [`registry`] — connection lifecycle: join, submit, cursor, leave, sync
//! - [`session`] — per-document coordinator actor
//! - [`document`] — authoritative buffer and rolling revision history
//! - [`presence`] — participants and cursors
//! - [`broadcast`] — bounded per-connection fan-out with eviction
//! - [`storage`] — snapshot stores (RocksDB, in-memory)
//! - [`auth`] — document access checks
//! - [`mirror`] — optional derived yrs replica
//! - [`server`] / [`client`] — WebSocket transport

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod error;
pub mod mirror;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AccessList, AllowAll, Authorizer};
pub use broadcast::{BroadcastGroup, BroadcastStats, Connection, ConnectionId, Outbound};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use document::{DocumentState, RevisionHistory};
pub use error::{CollabError, CollabResult, ErrorCode};
pub use mirror::CrdtMirror;
pub use presence::{Participant, PresenceRegistry};
pub use protocol::{
    ClientMessage, DocumentId, Encoding, Frame, ParticipantId, PresenceEvent, ProtocolError, ServerMessage,
    decode, encode,
};
pub use registry::{RegistryStats, SessionRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Ack, SessionConfig, SessionSnapshot};
pub use storage::{
    MemoryStore, RocksStore, Snapshot, SnapshotMetadata, SnapshotStore, StoreConfig, StoreError, VersionHistory,
};
