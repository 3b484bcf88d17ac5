//! # obra-core — Entity model for the Obra collaborative canvas
//!
//! The shared vocabulary between the sync engine (`obra-collab`), the UI,
//! and the read-only consumers (material/pricing/schedule calculators):
//!
//! - [`geometry`] — points and colors
//! - [`entity`]   — shapes, layers, board state, creation drafts
//! - [`patch`]    — field-level patches with last-write-wins merge
//! - [`snapshot`] — read-only board snapshots for external consumers
//!
//! Entities carry a `client_clock`: a per-client monotonic counter used
//! only for same-field conflict ordering, never compared across fields
//! and never treated as synchronized wall time.

pub mod entity;
pub mod geometry;
pub mod patch;
pub mod snapshot;

pub use entity::{
    now_ms, Audit, BoardDraft, BoardState, Entity, EntityDraft, Layer, LayerDraft, Shape,
    ShapeDraft, ShapeKind, ValidationError,
};
pub use geometry::{Point, Rgba};
pub use patch::{BoardPatch, EntityPatch, FieldMask, LayerPatch, Patch, ShapePatch};
pub use snapshot::BoardSnapshot;
