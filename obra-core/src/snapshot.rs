//! Read-only board snapshots.
//!
//! The interface consumed by the external calculators (material
//! quantities, pricing, schedules): a point-in-time copy of one
//! project's entities with convenience queries, no live subscription.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{now_ms, BoardState, Entity, Layer, Shape};

/// A point-in-time copy of one project's board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub project_id: Uuid,
    pub board: Option<BoardState>,
    pub shapes: Vec<Shape>,
    pub layers: Vec<Layer>,
    /// Milliseconds since epoch when the snapshot was taken.
    pub taken_at: u64,
}

impl BoardSnapshot {
    /// Build a snapshot from a flat entity list.
    pub fn from_entities(project_id: Uuid, entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut board = None;
        let mut shapes = Vec::new();
        let mut layers = Vec::new();

        for entity in entities {
            match entity {
                Entity::Shape(s) => shapes.push(s),
                Entity::Layer(l) => layers.push(l),
                Entity::Board(b) => board = Some(b),
            }
        }

        Self { project_id, board, shapes, layers, taken_at: now_ms() }
    }

    pub fn shape(&self, id: Uuid) -> Option<&Shape> {
        self.shapes.iter().find(|s| s.id == id)
    }

    pub fn layer(&self, id: Uuid) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Shapes assigned to the given layer.
    pub fn shapes_on_layer(&self, layer_id: Uuid) -> Vec<&Shape> {
        self.shapes
            .iter()
            .filter(|s| s.layer_id == Some(layer_id))
            .collect()
    }

    /// Layers in ascending z-order.
    pub fn ordered_layers(&self) -> Vec<&Layer> {
        let mut layers: Vec<&Layer> = self.layers.iter().collect();
        layers.sort_by_key(|l| l.order);
        layers
    }

    /// Shapes whose layer is visible, plus unassigned shapes.
    pub fn visible_shapes(&self) -> Vec<&Shape> {
        self.shapes
            .iter()
            .filter(|s| match s.layer_id {
                Some(layer_id) => self.layer(layer_id).map(|l| l.visible).unwrap_or(false),
                None => true,
            })
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.shapes.len() + self.layers.len() + usize::from(self.board.is_some())
    }
}
