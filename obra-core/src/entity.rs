//! Canvas entities: shapes, layers, and the per-project board state.
//!
//! Shape kind-specific fields live in a tagged union ([`ShapeKind`]) so a
//! record is decoded into exactly one well-typed variant at the store
//! boundary; there are no loosely coexisting optional fields.
//!
//! Entity ids are assigned by the creating client, never by the server:
//! an offline client must be able to reference a new entity (move it,
//! lock it) before the create has ever reached the wire.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::geometry::{Point, Rgba};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Audit quad carried by every entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_at: u64,
    pub created_by: Uuid,
    pub updated_at: u64,
    pub updated_by: Uuid,
}

impl Audit {
    /// Fresh audit stamp for a newly created entity.
    pub fn stamp(actor_id: Uuid) -> Self {
        let now = now_ms();
        Self {
            created_at: now,
            created_by: actor_id,
            updated_at: now,
            updated_by: actor_id,
        }
    }

    /// Bump the updated half on mutation.
    pub fn touch(&mut self, actor_id: Uuid) {
        self.updated_at = now_ms();
        self.updated_by = actor_id;
    }
}

/// Shape kind with kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShapeKind {
    Rect { width: f32, height: f32 },
    Circle { radius: f32 },
    Text { content: String, font_size: f32 },
    Line { end: Point },
    Polyline { points: Vec<Point> },
    Polygon { points: Vec<Point> },
}

impl ShapeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ShapeKind::Rect { .. } => "rect",
            ShapeKind::Circle { .. } => "circle",
            ShapeKind::Text { .. } => "text",
            ShapeKind::Line { .. } => "line",
            ShapeKind::Polyline { .. } => "polyline",
            ShapeKind::Polygon { .. } => "polygon",
        }
    }

    /// Reject malformed geometry before it reaches any store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ShapeKind::Rect { width, height } => {
                if !width.is_finite() || !height.is_finite() {
                    return Err(ValidationError::NonFiniteGeometry("rect"));
                }
                if *width < 0.0 || *height < 0.0 {
                    return Err(ValidationError::NegativeDimension("rect"));
                }
            }
            ShapeKind::Circle { radius } => {
                if !radius.is_finite() {
                    return Err(ValidationError::NonFiniteGeometry("circle"));
                }
                if *radius < 0.0 {
                    return Err(ValidationError::NegativeDimension("circle"));
                }
            }
            ShapeKind::Text { font_size, .. } => {
                if !font_size.is_finite() || *font_size <= 0.0 {
                    return Err(ValidationError::NonFiniteGeometry("text"));
                }
            }
            ShapeKind::Line { end } => {
                if !end.is_finite() {
                    return Err(ValidationError::NonFiniteGeometry("line"));
                }
            }
            ShapeKind::Polyline { points } => {
                if points.len() < 2 {
                    return Err(ValidationError::TooFewPoints { kind: "polyline", min: 2 });
                }
                if points.iter().any(|p| !p.is_finite()) {
                    return Err(ValidationError::NonFiniteGeometry("polyline"));
                }
            }
            ShapeKind::Polygon { points } => {
                if points.len() < 3 {
                    return Err(ValidationError::TooFewPoints { kind: "polygon", min: 3 });
                }
                if points.iter().any(|p| !p.is_finite()) {
                    return Err(ValidationError::NonFiniteGeometry("polygon"));
                }
            }
        }
        Ok(())
    }
}

/// A drawable shape on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: Uuid,
    pub kind: ShapeKind,
    /// Position anchor in board coordinates.
    pub origin: Point,
    pub color: Rgba,
    /// Owning layer, if the shape is assigned to one.
    pub layer_id: Option<Uuid>,
    pub audit: Audit,
    /// Client-local monotonic counter for same-field conflict ordering.
    pub client_clock: u64,
}

/// A named, ordered grouping of shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: Uuid,
    pub name: String,
    pub shape_ids: Vec<Uuid>,
    pub visible: bool,
    pub locked: bool,
    /// Z-order index among the project's layers.
    pub order: u32,
    pub audit: Audit,
}

/// Singleton per-project board state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    pub id: Uuid,
    pub active_layer_id: Option<Uuid>,
    pub audit: Audit,
}

/// Any record in the shared canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Shape(Shape),
    Layer(Layer),
    Board(BoardState),
}

impl Entity {
    pub fn id(&self) -> Uuid {
        match self {
            Entity::Shape(s) => s.id,
            Entity::Layer(l) => l.id,
            Entity::Board(b) => b.id,
        }
    }

    pub fn audit(&self) -> &Audit {
        match self {
            Entity::Shape(s) => &s.audit,
            Entity::Layer(l) => &l.audit,
            Entity::Board(b) => &b.audit,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Entity::Shape(_) => "shape",
            Entity::Layer(_) => "layer",
            Entity::Board(_) => "board",
        }
    }

    pub fn as_shape(&self) -> Option<&Shape> {
        match self {
            Entity::Shape(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_layer(&self) -> Option<&Layer> {
        match self {
            Entity::Layer(l) => Some(l),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Creation drafts
// ───────────────────────────────────────────────────────────────────

/// Creation payload for a shape. The caller supplies the entity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeDraft {
    pub kind: ShapeKind,
    pub origin: Point,
    pub color: Rgba,
    pub layer_id: Option<Uuid>,
}

/// Creation payload for a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDraft {
    pub name: String,
    pub visible: bool,
    pub locked: bool,
    pub order: u32,
}

/// Creation payload for the board singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardDraft {
    pub active_layer_id: Option<Uuid>,
}

/// Creation payload for any entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityDraft {
    Shape(ShapeDraft),
    Layer(LayerDraft),
    Board(BoardDraft),
}

impl EntityDraft {
    /// Validate the payload before any write attempt.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            EntityDraft::Shape(d) => {
                if !d.origin.is_finite() {
                    return Err(ValidationError::NonFiniteGeometry("origin"));
                }
                d.kind.validate()
            }
            EntityDraft::Layer(d) => {
                if d.name.trim().is_empty() {
                    return Err(ValidationError::EmptyName);
                }
                Ok(())
            }
            EntityDraft::Board(_) => Ok(()),
        }
    }

    /// Materialize the draft into an entity with a fresh audit stamp.
    pub fn into_entity(self, id: Uuid, actor_id: Uuid, client_clock: u64) -> Entity {
        let audit = Audit::stamp(actor_id);
        match self {
            EntityDraft::Shape(d) => Entity::Shape(Shape {
                id,
                kind: d.kind,
                origin: d.origin,
                color: d.color,
                layer_id: d.layer_id,
                audit,
                client_clock,
            }),
            EntityDraft::Layer(d) => Entity::Layer(Layer {
                id,
                name: d.name,
                shape_ids: Vec::new(),
                visible: d.visible,
                locked: d.locked,
                order: d.order,
                audit,
            }),
            EntityDraft::Board(d) => Entity::Board(BoardState {
                id,
                active_layer_id: d.active_layer_id,
                audit,
            }),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            EntityDraft::Shape(_) => "shape",
            EntityDraft::Layer(_) => "layer",
            EntityDraft::Board(_) => "board",
        }
    }
}

/// Malformed payload, rejected before any write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Layer name is empty or whitespace.
    EmptyName,
    /// Geometry contains NaN/Inf.
    NonFiniteGeometry(&'static str),
    /// Width/height/radius below zero.
    NegativeDimension(&'static str),
    /// Polyline/polygon with too few points.
    TooFewPoints { kind: &'static str, min: usize },
    /// `Clear` applied to a non-optional field.
    ClearOnRequiredField(&'static str),
    /// Referenced layer does not exist.
    MissingLayer(Uuid),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyName => write!(f, "Layer name must not be empty"),
            ValidationError::NonFiniteGeometry(field) => {
                write!(f, "Non-finite geometry in {field}")
            }
            ValidationError::NegativeDimension(kind) => {
                write!(f, "Negative dimension on {kind}")
            }
            ValidationError::TooFewPoints { kind, min } => {
                write!(f, "{kind} requires at least {min} points")
            }
            ValidationError::ClearOnRequiredField(field) => {
                write!(f, "Cannot clear required field {field}")
            }
            ValidationError::MissingLayer(id) => write!(f, "Referenced layer not found: {id}"),
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_draft() -> EntityDraft {
        EntityDraft::Shape(ShapeDraft {
            kind: ShapeKind::Rect { width: 10.0, height: 20.0 },
            origin: Point::new(1.0, 2.0),
            color: Rgba::default(),
            layer_id: None,
        })
    }

    #[test]
    fn test_draft_validate_ok() {
        assert!(rect_draft().validate().is_ok());
    }

    #[test]
    fn test_draft_rejects_negative_dimension() {
        let draft = EntityDraft::Shape(ShapeDraft {
            kind: ShapeKind::Rect { width: -1.0, height: 5.0 },
            origin: Point::ZERO,
            color: Rgba::default(),
            layer_id: None,
        });
        assert_eq!(draft.validate(), Err(ValidationError::NegativeDimension("rect")));
    }

    #[test]
    fn test_draft_rejects_nan_origin() {
        let draft = EntityDraft::Shape(ShapeDraft {
            kind: ShapeKind::Circle { radius: 1.0 },
            origin: Point::new(f32::NAN, 0.0),
            color: Rgba::default(),
            layer_id: None,
        });
        assert_eq!(draft.validate(), Err(ValidationError::NonFiniteGeometry("origin")));
    }

    #[test]
    fn test_draft_rejects_degenerate_polygon() {
        let draft = EntityDraft::Shape(ShapeDraft {
            kind: ShapeKind::Polygon {
                points: vec![Point::ZERO, Point::new(1.0, 1.0)],
            },
            origin: Point::ZERO,
            color: Rgba::default(),
            layer_id: None,
        });
        assert_eq!(
            draft.validate(),
            Err(ValidationError::TooFewPoints { kind: "polygon", min: 3 })
        );
    }

    #[test]
    fn test_draft_rejects_empty_layer_name() {
        let draft = EntityDraft::Layer(LayerDraft {
            name: "   ".into(),
            visible: true,
            locked: false,
            order: 0,
        });
        assert_eq!(draft.validate(), Err(ValidationError::EmptyName));
    }

    #[test]
    fn test_into_entity_stamps_audit() {
        let actor = Uuid::new_v4();
        let id = Uuid::new_v4();
        let entity = rect_draft().into_entity(id, actor, 7);

        assert_eq!(entity.id(), id);
        assert_eq!(entity.audit().created_by, actor);
        assert_eq!(entity.audit().updated_by, actor);
        assert_eq!(entity.audit().created_at, entity.audit().updated_at);
        match entity {
            Entity::Shape(s) => assert_eq!(s.client_clock, 7),
            other => panic!("expected shape, got {other:?}"),
        }
    }

    #[test]
    fn test_audit_touch_bumps_updated() {
        let creator = Uuid::new_v4();
        let editor = Uuid::new_v4();
        let mut audit = Audit::stamp(creator);
        audit.touch(editor);

        assert_eq!(audit.created_by, creator);
        assert_eq!(audit.updated_by, editor);
        assert!(audit.updated_at >= audit.created_at);
    }

    #[test]
    fn test_layer_draft_has_empty_shape_list() {
        let draft = EntityDraft::Layer(LayerDraft {
            name: "Walls".into(),
            visible: true,
            locked: false,
            order: 3,
        });
        match draft.into_entity(Uuid::new_v4(), Uuid::new_v4(), 0) {
            Entity::Layer(l) => {
                assert!(l.shape_ids.is_empty());
                assert_eq!(l.order, 3);
                assert_eq!(l.name, "Walls");
            }
            other => panic!("expected layer, got {other:?}"),
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ShapeKind::Circle { radius: 1.0 }.kind_name(), "circle");
        assert_eq!(rect_draft().kind_name(), "shape");
    }
}
