//! Per-project entity store with an incremental change feed.
//!
//! ```text
//! create/update/delete ──► entity table ──► FeedEvent batch
//!                              │                  │
//!                              ▼                  ▼
//!                        ProjectStore      broadcast::channel
//!                        (write-through)   (every subscriber,
//!                                           incl. originator)
//! ```
//!
//! Conflict policy: field-level last-write-wins. Concurrent edits to
//! disjoint fields of the same entity both survive; concurrent edits to
//! the same field resolve to whichever write the store applies last.
//! No vector clocks, no operational transforms.
//!
//! Delivery contract: at-least-once, ordered per entity id as seen from
//! one subscription (a single per-project channel gives each subscriber
//! a total order). Consumers apply `Added`/`Modified` as upserts so
//! re-delivery is harmless.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use obra_core::{Entity, EntityDraft, EntityPatch, ShapePatch, ValidationError};

use crate::protocol::FeedEvent;
use crate::storage::ProjectStore;

/// Entity store errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Mutate/delete on a missing entity. Surfaced, never retried.
    NotFound(Uuid),
    /// Create with an id that already exists.
    DuplicateId(Uuid),
    /// Malformed payload, rejected before any write attempt.
    Validation(ValidationError),
    /// Patch kind does not match the stored entity kind.
    KindMismatch { entity: &'static str, patch: &'static str },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "Entity not found: {id}"),
            StoreError::DuplicateId(id) => write!(f, "Entity id already exists: {id}"),
            StoreError::Validation(e) => write!(f, "Validation error: {e}"),
            StoreError::KindMismatch { entity, patch } => {
                write!(f, "Patch kind {patch} does not match {entity}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<ValidationError> for StoreError {
    fn from(e: ValidationError) -> Self {
        StoreError::Validation(e)
    }
}

/// The per-project entity store.
pub struct EntityStore {
    project_id: Uuid,
    entities: RwLock<HashMap<Uuid, Entity>>,
    feed: broadcast::Sender<Arc<Vec<FeedEvent>>>,
    /// Write-through persistence; failures are logged, never fail the mutation.
    persist: Option<Arc<ProjectStore>>,
}

impl EntityStore {
    pub fn new(project_id: Uuid, feed_capacity: usize, persist: Option<Arc<ProjectStore>>) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity);
        Self {
            project_id,
            entities: RwLock::new(HashMap::new()),
            feed,
            persist,
        }
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Fill the table from persisted state when a room reopens.
    ///
    /// No feed events are emitted: there are no subscribers yet, and new
    /// subscribers receive the full state via `snapshot_events`.
    pub async fn load_existing(&self, entities: Vec<Entity>) {
        let mut table = self.entities.write().await;
        for entity in entities {
            table.insert(entity.id(), entity);
        }
    }

    /// Create an entity from a validated draft. Emits `Added`.
    pub async fn create(
        &self,
        entity_id: Uuid,
        draft: EntityDraft,
        actor_id: Uuid,
    ) -> Result<Entity, StoreError> {
        draft.validate()?;

        let mut table = self.entities.write().await;
        if table.contains_key(&entity_id) {
            return Err(StoreError::DuplicateId(entity_id));
        }
        if let EntityDraft::Shape(ref shape) = draft {
            if let Some(layer_id) = shape.layer_id {
                if !matches!(table.get(&layer_id), Some(Entity::Layer(_))) {
                    return Err(StoreError::Validation(ValidationError::MissingLayer(layer_id)));
                }
            }
        }

        let entity = draft.into_entity(entity_id, actor_id, 0);
        table.insert(entity_id, entity.clone());
        drop(table);

        self.write_through(&entity);
        self.emit(FeedEvent::Added(entity.clone()));
        Ok(entity)
    }

    /// Merge a field-level patch into an existing entity. Emits `Modified`.
    ///
    /// `client_clock` is stored verbatim on shapes; it is compared only
    /// for same-field tie-breaking on the client, never as wall time.
    pub async fn update(
        &self,
        entity_id: Uuid,
        patch: EntityPatch,
        actor_id: Uuid,
        client_clock: u64,
    ) -> Result<Entity, StoreError> {
        let mut table = self.entities.write().await;

        if let Some(layer_id) = patch.referenced_layer() {
            if !matches!(table.get(&layer_id), Some(Entity::Layer(_))) {
                return Err(StoreError::Validation(ValidationError::MissingLayer(layer_id)));
            }
        }

        let entity = table
            .get_mut(&entity_id)
            .ok_or(StoreError::NotFound(entity_id))?;

        match patch.apply(entity) {
            None => {
                return Err(StoreError::KindMismatch {
                    entity: entity.kind_name(),
                    patch: patch.kind_name(),
                })
            }
            Some(Err(e)) => return Err(StoreError::Validation(e)),
            Some(Ok(_mask)) => {}
        }

        match entity {
            Entity::Shape(s) => {
                s.audit.touch(actor_id);
                s.client_clock = client_clock;
            }
            Entity::Layer(l) => l.audit.touch(actor_id),
            Entity::Board(b) => b.audit.touch(actor_id),
        }

        let updated = entity.clone();
        drop(table);

        self.write_through(&updated);
        self.emit(FeedEvent::Modified(updated.clone()));
        Ok(updated)
    }

    /// Position fast-path: an origin-only patch.
    pub async fn update_position(
        &self,
        entity_id: Uuid,
        x: f32,
        y: f32,
        actor_id: Uuid,
        client_clock: u64,
    ) -> Result<Entity, StoreError> {
        self.update(
            entity_id,
            EntityPatch::Shape(ShapePatch::position(x, y)),
            actor_id,
            client_clock,
        )
        .await
    }

    /// Remove an entity. Emits `Removed` carrying the final snapshot.
    ///
    /// Deleting a layer does not cascade to its shapes; that is the
    /// caller's responsibility.
    pub async fn delete(&self, entity_id: Uuid) -> Result<Entity, StoreError> {
        let mut table = self.entities.write().await;
        let entity = table
            .remove(&entity_id)
            .ok_or(StoreError::NotFound(entity_id))?;
        drop(table);

        self.delete_through(&entity);
        self.emit(FeedEvent::Removed(entity.clone()));
        Ok(entity)
    }

    /// Subscribe to the incremental change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<FeedEvent>>> {
        self.feed.subscribe()
    }

    /// The full current state as one `Added` batch.
    ///
    /// This is what a fresh or renewed subscription receives; resync
    /// correctness depends on full-snapshot delivery, not incremental
    /// catch-up.
    pub async fn snapshot_events(&self) -> Vec<FeedEvent> {
        self.entities
            .read()
            .await
            .values()
            .cloned()
            .map(FeedEvent::Added)
            .collect()
    }

    pub async fn get(&self, entity_id: Uuid) -> Option<Entity> {
        self.entities.read().await.get(&entity_id).cloned()
    }

    pub async fn entities(&self) -> Vec<Entity> {
        self.entities.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    fn emit(&self, event: FeedEvent) {
        // No receivers is fine; the room may be freshly opened.
        let _ = self.feed.send(Arc::new(vec![event]));
    }

    fn write_through(&self, entity: &Entity) {
        if let Some(ref store) = self.persist {
            if let Err(e) = store.put_entity(self.project_id, entity) {
                log::error!(
                    "Failed to persist {} {}: {e}",
                    entity.kind_name(),
                    entity.id()
                );
            }
        }
    }

    fn delete_through(&self, entity: &Entity) {
        if let Some(ref store) = self.persist {
            if let Err(e) = store.delete_entity(self.project_id, entity) {
                log::error!(
                    "Failed to delete persisted {} {}: {e}",
                    entity.kind_name(),
                    entity.id()
                );
            }
        }
    }
}
