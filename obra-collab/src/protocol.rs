//! Binary wire protocol between sync clients and the server.
//!
//! Frames are bincode-encoded and carried as WebSocket binary messages:
//!
//! ```text
//! client ──► ClientFrame { Join | Entity | Lock | Presence | Resubscribe | LeaseRenew | Ping }
//! server ──► ServerFrame { Joined | Feed | Locks | Presence | Ack | Error | Pong }
//! ```
//!
//! Frames carrying a nonzero `seq` are acknowledged individually with
//! `Ack { seq }` or `Error { seq, .. }` directed at the sender only; the
//! entity feed itself fans out to every subscriber including the
//! originator, whose reconciliation depends on the echo.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use obra_core::{EntityDraft, EntityPatch, Rgba};

/// Peer identity supplied by the external identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActorProfile {
    pub user_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/lock badge rendering.
    pub color: Rgba,
}

impl ActorProfile {
    pub fn new(name: impl Into<String>) -> Self {
        let user_id = Uuid::new_v4();
        Self {
            user_id,
            name: name.into(),
            color: Rgba::from_uuid(user_id),
        }
    }

    /// Create with explicit user_id (for testing).
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: Rgba::from_uuid(user_id),
        }
    }
}

/// Advisory lock record: at most one per entity id, overwritable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub user_id: Uuid,
    pub user_name: String,
    pub acquired_at: u64,
}

/// Ephemeral per-user presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub name: String,
    pub color: Rgba,
    pub cursor_x: f32,
    pub cursor_y: f32,
    pub last_seen: u64,
    pub active_view: String,
}

/// Lock map keyed by entity id.
pub type LockMap = HashMap<Uuid, LockRecord>;
/// Presence map keyed by user id.
pub type PresenceMap = HashMap<Uuid, PresenceRecord>;

/// Entity mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityOp {
    Create {
        entity_id: Uuid,
        draft: EntityDraft,
        actor_id: Uuid,
    },
    Update {
        entity_id: Uuid,
        patch: EntityPatch,
        actor_id: Uuid,
        client_clock: u64,
    },
    /// Origin-only fast path for cursor-driven dragging.
    UpdatePosition {
        entity_id: Uuid,
        x: f32,
        y: f32,
        actor_id: Uuid,
        client_clock: u64,
    },
    Delete {
        entity_id: Uuid,
    },
}

/// Advisory lock operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockOp {
    Acquire {
        entity_id: Uuid,
        user_id: Uuid,
        user_name: String,
    },
    Release {
        entity_id: Uuid,
    },
}

/// Presence operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceOp {
    Set { user_id: Uuid, name: String, color: Rgba },
    Cursor { user_id: Uuid, x: f32, y: f32 },
    View { user_id: Uuid, view: String },
    Remove { user_id: Uuid },
}

/// An incremental change-feed event.
///
/// `Removed` carries the final entity snapshot so subscribers can
/// clean up references without a second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedEvent {
    Added(obra_core::Entity),
    Modified(obra_core::Entity),
    Removed(obra_core::Entity),
}

impl FeedEvent {
    pub fn entity(&self) -> &obra_core::Entity {
        match self {
            FeedEvent::Added(e) | FeedEvent::Modified(e) | FeedEvent::Removed(e) => e,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        self.entity().id()
    }
}

/// Error taxonomy surfaced over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    PermissionDenied,
    Validation,
    Internal,
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame on every connection.
    Join {
        project_id: Uuid,
        actor: ActorProfile,
    },
    Entity { seq: u64, op: EntityOp },
    Lock { seq: u64, op: LockOp },
    Presence { seq: u64, op: PresenceOp },
    /// Request a fresh full snapshot plus lock/presence maps.
    Resubscribe,
    /// Explicit lease heartbeat (any frame also renews).
    LeaseRenew,
    Ping,
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Joined {
        project_id: Uuid,
        lease_ttl_ms: u64,
    },
    Feed { events: Vec<FeedEvent> },
    Locks { map: LockMap },
    Presence { map: PresenceMap },
    Ack { seq: u64 },
    Error {
        seq: u64,
        code: ErrorCode,
        message: String,
        entity_id: Option<Uuid>,
    },
    Pong,
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// The ack sequence carried by this frame, if any.
    pub fn seq(&self) -> Option<u64> {
        match self {
            ClientFrame::Entity { seq, .. }
            | ClientFrame::Lock { seq, .. }
            | ClientFrame::Presence { seq, .. } => (*seq != 0).then_some(*seq),
            _ => None,
        }
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn error(seq: u64, code: ErrorCode, message: impl Into<String>, entity_id: Option<Uuid>) -> Self {
        ServerFrame::Error { seq, code, message: message.into(), entity_id }
    }
}
