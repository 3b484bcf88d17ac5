//! Local board replica: optimistic apply plus feed reconciliation.
//!
//! The replica mirrors the server's entity table for one project. Local
//! mutations are applied immediately (the UI never waits on the wire)
//! and the touched fields are remembered as a pending [`FieldMask`].
//! The server echoes every accepted mutation back on the feed, to the
//! originator included, and reconciliation happens there:
//!
//! - the echo of our own write (or anything at least as new) is
//!   accepted wholesale and the pending mask is cleared;
//! - a remote write that lost the same-field race (its `client_clock`
//!   is older than our pending one) still lands, but our masked fields
//!   are copied back over it so the locally newer values survive.
//!
//! Only shapes carry a `client_clock`; for layers and board state the
//! remote echo always wins.

use std::collections::HashMap;
use uuid::Uuid;

use obra_core::{Entity, EntityPatch, FieldMask, ShapePatch, ValidationError};

use crate::protocol::FeedEvent;

/// Replica mutation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaError {
    NotFound(Uuid),
    /// Patch kind does not match the entity kind.
    KindMismatch { entity: &'static str, patch: &'static str },
    Validation(ValidationError),
}

impl std::fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaError::NotFound(id) => write!(f, "Entity not found: {id}"),
            ReplicaError::KindMismatch { entity, patch } => {
                write!(f, "Cannot apply {patch} patch to {entity} entity")
            }
            ReplicaError::Validation(e) => write!(f, "Validation error: {e}"),
        }
    }
}

impl std::error::Error for ReplicaError {}

impl From<ValidationError> for ReplicaError {
    fn from(e: ValidationError) -> Self {
        ReplicaError::Validation(e)
    }
}

/// Unconfirmed local write: which fields, at which local clock.
#[derive(Debug, Clone)]
struct PendingWrite {
    mask: FieldMask,
    client_clock: u64,
}

/// Client-side mirror of one project's entity table.
#[derive(Debug, Default)]
pub struct BoardReplica {
    entities: HashMap<Uuid, Entity>,
    pending: HashMap<Uuid, PendingWrite>,
}

impl BoardReplica {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Optimistic Local Writes ──────────────────────────────────────

    /// Insert a locally created entity.
    pub fn apply_local_create(&mut self, entity: Entity) {
        self.entities.insert(entity.id(), entity);
    }

    /// Apply a patch locally before the server has confirmed it.
    ///
    /// The touched fields join the entity's pending mask at
    /// `client_clock`, to be resolved against the feed echo.
    pub fn apply_local(
        &mut self,
        entity_id: Uuid,
        patch: &EntityPatch,
        client_clock: u64,
    ) -> Result<FieldMask, ReplicaError> {
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(ReplicaError::NotFound(entity_id))?;
        let mask = match patch.apply(entity) {
            Some(result) => result?,
            None => {
                return Err(ReplicaError::KindMismatch {
                    entity: entity.kind_name(),
                    patch: patch.kind_name(),
                })
            }
        };
        if let Entity::Shape(shape) = entity {
            shape.client_clock = client_clock;
        }

        let pending = self.pending.entry(entity_id).or_insert_with(|| PendingWrite {
            mask: FieldMask::new(),
            client_clock,
        });
        for &field in mask.fields() {
            pending.mask.insert(field);
        }
        pending.client_clock = pending.client_clock.max(client_clock);
        Ok(mask)
    }

    /// Position fast-path for cursor-driven dragging.
    pub fn apply_local_position(
        &mut self,
        entity_id: Uuid,
        x: f32,
        y: f32,
        client_clock: u64,
    ) -> Result<(), ReplicaError> {
        let patch = EntityPatch::Shape(ShapePatch::position(x, y));
        self.apply_local(entity_id, &patch, client_clock)?;
        Ok(())
    }

    /// Remove a locally deleted entity.
    pub fn apply_local_delete(&mut self, entity_id: Uuid) {
        self.entities.remove(&entity_id);
        self.pending.remove(&entity_id);
    }

    // ─── Feed Reconciliation ──────────────────────────────────────────

    /// Fold one feed event into the replica.
    pub fn apply_event(&mut self, event: &FeedEvent) {
        match event {
            FeedEvent::Added(entity) => {
                self.entities.insert(entity.id(), entity.clone());
            }
            FeedEvent::Removed(entity) => {
                // Deletes win over any unconfirmed local edit.
                self.entities.remove(&entity.id());
                self.pending.remove(&entity.id());
            }
            FeedEvent::Modified(remote) => self.reconcile(remote),
        }
    }

    /// Fold a feed batch (including a full snapshot) into the replica.
    pub fn apply_feed(&mut self, events: &[FeedEvent]) {
        for event in events {
            self.apply_event(event);
        }
    }

    fn reconcile(&mut self, remote: &Entity) {
        let id = remote.id();
        let locally_newer = match (self.pending.get(&id), remote) {
            (Some(pending), Entity::Shape(shape)) => pending.client_clock > shape.client_clock,
            _ => false,
        };

        if !locally_newer {
            // Our own echo, or a remote write at least as new: the
            // server's version is authoritative.
            self.entities.insert(id, remote.clone());
            self.pending.remove(&id);
            return;
        }

        // The remote write lost the same-field race. Accept it for the
        // fields we did not touch, keep our masked fields on top.
        let mut merged = remote.clone();
        if let (Entity::Shape(merged), Some(Entity::Shape(local))) =
            (&mut merged, self.entities.get(&id))
        {
            let mask = &self.pending[&id].mask;
            if mask.contains("origin") {
                merged.origin = local.origin;
            }
            if mask.contains("color") {
                merged.color = local.color;
            }
            if mask.contains("layer_id") {
                merged.layer_id = local.layer_id;
            }
            if mask.contains("kind") {
                merged.kind = local.kind.clone();
            }
            merged.client_clock = local.client_clock;
        }
        self.entities.insert(id, merged);
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn get(&self, entity_id: Uuid) -> Option<&Entity> {
        self.entities.get(&entity_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn has_pending(&self, entity_id: Uuid) -> bool {
        self.pending.contains_key(&entity_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything, e.g. before folding in a fresh full snapshot.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.pending.clear();
    }
}
