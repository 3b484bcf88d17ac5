//! Ephemeral per-user presence: cursor position, display profile, and
//! the view the user is looking at.
//!
//! Presence is never persisted. A record exists only while the owning
//! connection's lease is live; expiry or disconnect removes it. The
//! population is bounded (one record per connected user), so the full
//! map is pushed to subscribers on every change instead of an
//! incremental feed.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use obra_core::{now_ms, Rgba};

use crate::protocol::{PresenceMap, PresenceRecord};

/// Presence errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// Cursor/view update for a user with no live record.
    NotFound(Uuid),
}

impl std::fmt::Display for PresenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceError::NotFound(id) => write!(f, "No presence record for user {id}"),
        }
    }
}

impl std::error::Error for PresenceError {}

pub struct PresenceTable {
    records: RwLock<HashMap<Uuid, PresenceRecord>>,
    tx: broadcast::Sender<Arc<PresenceMap>>,
}

impl PresenceTable {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            records: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Initialize (or reset) a user's record with cursor at the origin.
    pub async fn set_presence(&self, user_id: Uuid, name: String, color: Rgba) -> PresenceRecord {
        let record = PresenceRecord {
            user_id,
            name,
            color,
            cursor_x: 0.0,
            cursor_y: 0.0,
            last_seen: now_ms(),
            active_view: String::new(),
        };
        {
            let mut records = self.records.write().await;
            records.insert(user_id, record.clone());
        }
        self.notify().await;
        record
    }

    /// Partial write of the cursor fields.
    ///
    /// The 2-second timeout race lives on the client side; here a cursor
    /// update is an ordinary map write.
    pub async fn update_cursor(&self, user_id: Uuid, x: f32, y: f32) -> Result<(), PresenceError> {
        {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(&user_id)
                .ok_or(PresenceError::NotFound(user_id))?;
            record.cursor_x = x;
            record.cursor_y = y;
            record.last_seen = now_ms();
        }
        self.notify().await;
        Ok(())
    }

    /// Single-field update of the active view.
    pub async fn update_view(&self, user_id: Uuid, view: String) -> Result<(), PresenceError> {
        {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(&user_id)
                .ok_or(PresenceError::NotFound(user_id))?;
            record.active_view = view;
            record.last_seen = now_ms();
        }
        self.notify().await;
        Ok(())
    }

    /// Explicit cleanup; also called on lease expiry.
    pub async fn remove_presence(&self, user_id: Uuid) -> Option<PresenceRecord> {
        let removed = {
            let mut records = self.records.write().await;
            records.remove(&user_id)
        };
        if removed.is_some() {
            self.notify().await;
        }
        removed
    }

    /// The full map is pushed on every change.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PresenceMap>> {
        self.tx.subscribe()
    }

    pub async fn get(&self, user_id: Uuid) -> Option<PresenceRecord> {
        self.records.read().await.get(&user_id).cloned()
    }

    pub async fn snapshot(&self) -> PresenceMap {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    async fn notify(&self) {
        let map = Arc::new(self.records.read().await.clone());
        let _ = self.tx.send(map);
    }
}
