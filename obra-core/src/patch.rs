//! Field-level patches with last-write-wins merge.
//!
//! A patch names exactly the fields the caller wants to overwrite;
//! everything else is kept. Concurrent patches to disjoint fields of the
//! same entity both survive. Concurrent patches to the same field resolve
//! to whichever write the store applies last; no vector clocks, no OT.
//!
//! Applying a patch reports the touched fields as a [`FieldMask`], which
//! client-side reconciliation uses to keep locally-newer same-field writes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{BoardState, Entity, Layer, Shape, ShapeKind, ValidationError};
use crate::geometry::{Point, Rgba};

/// One field in a patch: kept, overwritten, or cleared.
///
/// `Clear` is valid only for optional fields; on a required field it is
/// rejected as a [`ValidationError`] before any write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Patch<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

/// The set of field names a patch touched.
///
/// In-process only; the field names are static and never round-trip
/// the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: Vec<&'static str>,
}

impl FieldMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: &'static str) {
        if !self.fields.contains(&field) {
            self.fields.push(field);
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| *f == field)
    }

    pub fn overlaps(&self, other: &FieldMask) -> bool {
        self.fields.iter().any(|f| other.contains(f))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }
}

/// Partial update for a shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapePatch {
    pub origin: Patch<Point>,
    pub color: Patch<Rgba>,
    pub layer_id: Patch<Uuid>,
    pub kind: Patch<ShapeKind>,
}

impl ShapePatch {
    /// An origin-only patch: the position fast-path.
    pub fn position(x: f32, y: f32) -> Self {
        Self {
            origin: Patch::Set(Point::new(x, y)),
            ..Self::default()
        }
    }

    /// Every field is validated before the first write, so a rejected
    /// patch leaves the shape untouched.
    pub fn apply(&self, shape: &mut Shape) -> Result<FieldMask, ValidationError> {
        self.validate()?;

        let mut mask = FieldMask::new();
        if let Patch::Set(p) = &self.origin {
            shape.origin = *p;
            mask.insert("origin");
        }
        if let Patch::Set(c) = &self.color {
            shape.color = *c;
            mask.insert("color");
        }
        match &self.layer_id {
            Patch::Keep => {}
            Patch::Set(id) => {
                shape.layer_id = Some(*id);
                mask.insert("layer_id");
            }
            Patch::Clear => {
                shape.layer_id = None;
                mask.insert("layer_id");
            }
        }
        if let Patch::Set(kind) = &self.kind {
            shape.kind = kind.clone();
            mask.insert("kind");
        }
        Ok(mask)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match &self.origin {
            Patch::Set(p) if !p.is_finite() => {
                return Err(ValidationError::NonFiniteGeometry("origin"));
            }
            Patch::Clear => return Err(ValidationError::ClearOnRequiredField("origin")),
            _ => {}
        }
        if matches!(self.color, Patch::Clear) {
            return Err(ValidationError::ClearOnRequiredField("color"));
        }
        match &self.kind {
            Patch::Set(kind) => kind.validate()?,
            Patch::Clear => return Err(ValidationError::ClearOnRequiredField("kind")),
            Patch::Keep => {}
        }
        Ok(())
    }
}

/// Partial update for a layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerPatch {
    pub name: Patch<String>,
    pub shape_ids: Patch<Vec<Uuid>>,
    pub visible: Patch<bool>,
    pub locked: Patch<bool>,
    pub order: Patch<u32>,
}

impl LayerPatch {
    /// Every field is validated before the first write, so a rejected
    /// patch leaves the layer untouched.
    pub fn apply(&self, layer: &mut Layer) -> Result<FieldMask, ValidationError> {
        self.validate()?;

        let mut mask = FieldMask::new();
        if let Patch::Set(name) = &self.name {
            layer.name = name.clone();
            mask.insert("name");
        }
        if let Patch::Set(ids) = &self.shape_ids {
            layer.shape_ids = ids.clone();
            mask.insert("shape_ids");
        }
        if let Patch::Set(v) = &self.visible {
            layer.visible = *v;
            mask.insert("visible");
        }
        if let Patch::Set(v) = &self.locked {
            layer.locked = *v;
            mask.insert("locked");
        }
        if let Patch::Set(v) = &self.order {
            layer.order = *v;
            mask.insert("order");
        }
        Ok(mask)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match &self.name {
            Patch::Set(name) if name.trim().is_empty() => {
                return Err(ValidationError::EmptyName);
            }
            Patch::Clear => return Err(ValidationError::ClearOnRequiredField("name")),
            _ => {}
        }
        if matches!(self.shape_ids, Patch::Clear) {
            return Err(ValidationError::ClearOnRequiredField("shape_ids"));
        }
        if matches!(self.visible, Patch::Clear) {
            return Err(ValidationError::ClearOnRequiredField("visible"));
        }
        if matches!(self.locked, Patch::Clear) {
            return Err(ValidationError::ClearOnRequiredField("locked"));
        }
        if matches!(self.order, Patch::Clear) {
            return Err(ValidationError::ClearOnRequiredField("order"));
        }
        Ok(())
    }
}

/// Partial update for the board singleton.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardPatch {
    pub active_layer_id: Patch<Uuid>,
}

impl BoardPatch {
    pub fn apply(&self, board: &mut BoardState) -> Result<FieldMask, ValidationError> {
        let mut mask = FieldMask::new();
        match &self.active_layer_id {
            Patch::Keep => {}
            Patch::Set(id) => {
                board.active_layer_id = Some(*id);
                mask.insert("active_layer_id");
            }
            Patch::Clear => {
                board.active_layer_id = None;
                mask.insert("active_layer_id");
            }
        }
        Ok(mask)
    }
}

/// Partial update for any entity kind.
///
/// Applying a patch of the wrong kind is a store-level error; the
/// kind check lives with the store, which owns the entity tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityPatch {
    Shape(ShapePatch),
    Layer(LayerPatch),
    Board(BoardPatch),
}

impl EntityPatch {
    pub fn kind_name(&self) -> &'static str {
        match self {
            EntityPatch::Shape(_) => "shape",
            EntityPatch::Layer(_) => "layer",
            EntityPatch::Board(_) => "board",
        }
    }

    /// Apply to a matching entity; `None` if the kinds disagree.
    pub fn apply(&self, entity: &mut Entity) -> Option<Result<FieldMask, ValidationError>> {
        match (self, entity) {
            (EntityPatch::Shape(p), Entity::Shape(s)) => Some(p.apply(s)),
            (EntityPatch::Layer(p), Entity::Layer(l)) => Some(p.apply(l)),
            (EntityPatch::Board(p), Entity::Board(b)) => Some(p.apply(b)),
            _ => None,
        }
    }

    /// The layer a shape patch re-parents to, if any. Used by the store
    /// to enforce the layer-reference invariant before mutation.
    pub fn referenced_layer(&self) -> Option<Uuid> {
        match self {
            EntityPatch::Shape(p) => match p.layer_id {
                Patch::Set(id) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }
}
