//! # obra-collab — Real-time sync engine for the Obra canvas
//!
//! Multiplayer editing over WebSockets with last-write-wins field
//! merging, advisory locks, presence, and an offline mutation queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    bincode frames   │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ BoardReplica│                     │ EntityStore │
//! │ (local)     │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ Room fan-out  │
//!                                    │ + RocksDB     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]  — Binary wire protocol (bincode-encoded frames)
//! - [`store`]     — Authoritative entity store with change feed
//! - [`locks`]     — Advisory per-entity locks
//! - [`presence`]  — Ephemeral cursors and active views
//! - [`lease`]     — Connection leases for disconnect cleanup
//! - [`broadcast`] — Room-based fan-out of pre-encoded frames
//! - [`server`]    — WebSocket sync server
//! - [`client`]    — Sync client with offline queue and replay
//! - [`replica`]   — Local mirror with field-mask reconciliation
//! - [`session`]   — One-board-at-a-time session supervision
//! - [`storage`]   — RocksDB project store and queue journal

pub mod broadcast;
pub mod client;
pub mod lease;
pub mod locks;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use broadcast::{ChannelStats, ProjectChannel, Room, RoomRegistry};
pub use client::{
    ClientConfig, ClientError, ClientEvent, DrainReport, LinkState, SyncClient,
};
pub use lease::{Lease, LeaseRegistry};
pub use locks::LockManager;
pub use offline::{OfflineQueue, QueuedOp};
pub use presence::{PresenceError, PresenceTable};
pub use protocol::{
    ActorProfile, ClientFrame, EntityOp, ErrorCode, FeedEvent, LockMap, LockOp, LockRecord,
    PresenceMap, PresenceOp, PresenceRecord, ProtocolError, ServerFrame,
};
pub use replica::{BoardReplica, ReplicaError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{BoardSession, SessionContext, SessionEvent};
pub use storage::{
    JournalError, JournalRecord, ProjectMetadata, ProjectStore, QueueJournal, StorageError,
    StoreConfig,
};
pub use store::{EntityStore, StoreError};
