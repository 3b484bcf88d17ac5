//! Advisory per-entity edit locks.
//!
//! Locks are UI-level signaling, not enforced mutual exclusion: holding
//! a lock never gates an entity store write. `acquire` always overwrites
//! any existing record, so a user refreshes their own lock by
//! re-acquiring it; at most one live record exists per entity id.
//!
//! Records are ephemeral. They are removed explicitly, or in bulk via
//! `release_owned_by` when the owner's lease expires or disconnects.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use uuid::Uuid;

use obra_core::now_ms;

use crate::protocol::{LockMap, LockRecord};

pub struct LockManager {
    locks: RwLock<HashMap<Uuid, LockRecord>>,
    all_tx: broadcast::Sender<Arc<LockMap>>,
    /// Per-entity watchers, created lazily by `subscribe_one`.
    watchers: RwLock<HashMap<Uuid, watch::Sender<Option<LockRecord>>>>,
}

impl LockManager {
    pub fn new(capacity: usize) -> Self {
        let (all_tx, _) = broadcast::channel(capacity);
        Self {
            locks: RwLock::new(HashMap::new()),
            all_tx,
            watchers: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire (or refresh) the lock for an entity.
    ///
    /// Always overwrites; the returned record is timestamped from this
    /// call.
    pub async fn acquire(&self, entity_id: Uuid, user_id: Uuid, user_name: String) -> LockRecord {
        let record = LockRecord {
            user_id,
            user_name,
            acquired_at: now_ms(),
        };
        {
            let mut locks = self.locks.write().await;
            locks.insert(entity_id, record.clone());
        }
        self.notify(entity_id, Some(record.clone())).await;
        record
    }

    /// Explicit removal. Any caller may release any lock (advisory).
    pub async fn release(&self, entity_id: Uuid) -> Option<LockRecord> {
        let removed = {
            let mut locks = self.locks.write().await;
            locks.remove(&entity_id)
        };
        if removed.is_some() {
            self.notify(entity_id, None).await;
        }
        removed
    }

    /// Bulk release on lease expiry or disconnect.
    ///
    /// Returns the entity ids whose locks were released.
    pub async fn release_owned_by(&self, user_id: Uuid) -> Vec<Uuid> {
        let released: Vec<Uuid> = {
            let mut locks = self.locks.write().await;
            let ids: Vec<Uuid> = locks
                .iter()
                .filter(|(_, record)| record.user_id == user_id)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                locks.remove(id);
            }
            ids
        };
        for id in &released {
            self.notify(*id, None).await;
        }
        released
    }

    pub async fn get(&self, entity_id: Uuid) -> Option<LockRecord> {
        self.locks.read().await.get(&entity_id).cloned()
    }

    pub async fn snapshot(&self) -> LockMap {
        self.locks.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }

    /// The full map is pushed on every change.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Arc<LockMap>> {
        self.all_tx.subscribe()
    }

    /// The current record for one entity, pushed on every change.
    pub async fn subscribe_one(&self, entity_id: Uuid) -> watch::Receiver<Option<LockRecord>> {
        let mut watchers = self.watchers.write().await;
        if let Some(tx) = watchers.get(&entity_id) {
            return tx.subscribe();
        }
        let current = self.locks.read().await.get(&entity_id).cloned();
        let (tx, rx) = watch::channel(current);
        watchers.insert(entity_id, tx);
        rx
    }

    async fn notify(&self, entity_id: Uuid, record: Option<LockRecord>) {
        let map = Arc::new(self.locks.read().await.clone());
        let _ = self.all_tx.send(map);

        let watchers = self.watchers.read().await;
        if let Some(tx) = watchers.get(&entity_id) {
            let _ = tx.send(record);
        }
    }
}
