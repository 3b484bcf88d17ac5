//! Persistent storage layer for canvas projects.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  write-through  ┌──────────────┐
//! │ EntityStore │ ──────────────► │ ProjectStore │
//! │ (in-memory) │                 │ (RocksDB)    │
//! └──────┬──────┘                 └──────┬───────┘
//!        │                               │
//!        │ on room reopen                │ column families
//!        ▼                               ▼
//! ┌─────────────┐     ┌──────────────────────────────────┐
//! │ entity table│     │ CF "shapes" — shape entities      │
//! │ (restored)  │     │ CF "layers" — layer entities      │
//! └─────────────┘     │ CF "boards" — board state         │
//!                     │ CF "meta"   — project metadata    │
//!                     └──────────────────────────────────┘
//! ```
//!
//! The client side has its own durable piece, `QueueJournal`, an
//! append-only file that makes the offline mutation queue survive a
//! process restart.

pub mod journal;
pub mod project;

pub use journal::{JournalError, JournalRecord, QueueJournal};
pub use project::{ProjectMetadata, ProjectStore, StorageError, StoreConfig};
