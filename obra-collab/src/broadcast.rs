//! Per-project fan-out and room lifecycle.
//!
//! ```text
//! EntityStore feed ──┐
//! LockManager map  ──┼── forwarder tasks ── ProjectChannel ──► every
//! PresenceTable map ─┘    (encode once)     (Arc<Vec<u8>>)     subscriber
//! ```
//!
//! Frames are encoded once and fanned out as shared byte buffers; the
//! channel never re-serializes per subscriber. Stats are tracked via
//! atomics so the send path acquires no lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::locks::LockManager;
use crate::presence::PresenceTable;
use crate::protocol::{ProtocolError, ServerFrame};
use crate::storage::ProjectStore;
use crate::store::EntityStore;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub subscribers: usize,
}

/// Broadcast channel for one project's pre-encoded server frames.
pub struct ProjectChannel {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl ProjectChannel {
    /// `capacity` bounds how many frames a lagging subscriber may buffer
    /// before it starts dropping (backpressure).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Broadcast pre-encoded bytes (zero-copy fast path). Lock-free.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Encode a frame once and broadcast it to all subscribers.
    pub fn broadcast_frame(&self, frame: &ServerFrame) -> Result<usize, ProtocolError> {
        let encoded = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// One project's live state: entity store, lock manager, presence table,
/// and the fan-out channel they publish through.
pub struct Room {
    project_id: Uuid,
    pub store: Arc<EntityStore>,
    pub locks: Arc<LockManager>,
    pub presence: Arc<PresenceTable>,
    pub channel: Arc<ProjectChannel>,
    members: AtomicUsize,
    forwarders: Vec<JoinHandle<()>>,
}

impl Room {
    pub fn new(project_id: Uuid, capacity: usize, persist: Option<Arc<ProjectStore>>) -> Self {
        let store = Arc::new(EntityStore::new(project_id, capacity, persist));
        let locks = Arc::new(LockManager::new(capacity));
        let presence = Arc::new(PresenceTable::new(capacity));
        let channel = Arc::new(ProjectChannel::new(capacity));

        let forwarders = vec![
            Self::forward_feed(store.clone(), channel.clone()),
            Self::forward_locks(locks.clone(), channel.clone()),
            Self::forward_presence(presence.clone(), channel.clone()),
        ];

        Self {
            project_id,
            store,
            locks,
            presence,
            channel,
            members: AtomicUsize::new(0),
            forwarders,
        }
    }

    fn forward_feed(store: Arc<EntityStore>, channel: Arc<ProjectChannel>) -> JoinHandle<()> {
        let mut rx = store.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(batch) => {
                        let frame = ServerFrame::Feed { events: batch.to_vec() };
                        match frame.encode() {
                            Ok(bytes) => {
                                channel.broadcast_raw(Arc::new(bytes));
                            }
                            Err(e) => log::error!("Failed to encode feed frame: {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Feed forwarder lagged by {n} batches");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn forward_locks(locks: Arc<LockManager>, channel: Arc<ProjectChannel>) -> JoinHandle<()> {
        let mut rx = locks.subscribe_all();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(map) => {
                        let frame = ServerFrame::Locks { map: (*map).clone() };
                        match frame.encode() {
                            Ok(bytes) => {
                                channel.broadcast_raw(Arc::new(bytes));
                            }
                            Err(e) => log::error!("Failed to encode lock frame: {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Lock forwarder lagged by {n} updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn forward_presence(presence: Arc<PresenceTable>, channel: Arc<ProjectChannel>) -> JoinHandle<()> {
        let mut rx = presence.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(map) => {
                        let frame = ServerFrame::Presence { map: (*map).clone() };
                        match frame.encode() {
                            Ok(bytes) => {
                                channel.broadcast_raw(Arc::new(bytes));
                            }
                            Err(e) => log::error!("Failed to encode presence frame: {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Presence forwarder lagged by {n} updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn add_member(&self) -> usize {
        self.members.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn remove_member(&self) -> usize {
        self.members.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn member_count(&self) -> usize {
        self.members.load(Ordering::SeqCst)
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}

/// Maps project ids to rooms, isolating frames between projects.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    default_capacity: usize,
    persist: Option<Arc<ProjectStore>>,
}

impl RoomRegistry {
    pub fn new(default_capacity: usize, persist: Option<Arc<ProjectStore>>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            persist,
        }
    }

    /// Get or create a room, loading persisted entities on first open.
    pub async fn get_or_create(&self, project_id: Uuid) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&project_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&project_id) {
            return room.clone();
        }

        let room = Arc::new(Room::new(
            project_id,
            self.default_capacity,
            self.persist.clone(),
        ));
        if let Some(ref persist) = self.persist {
            match persist.load_project(project_id) {
                Ok(entities) if !entities.is_empty() => {
                    log::info!(
                        "Loaded {} persisted entities for project {project_id}",
                        entities.len()
                    );
                    room.store.load_existing(entities).await;
                }
                Ok(_) => {}
                Err(e) => log::error!("Failed to load project {project_id}: {e}"),
            }
        }
        rooms.insert(project_id, room.clone());
        room
    }

    pub async fn get(&self, project_id: Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&project_id).cloned()
    }

    /// Remove the room if no connection is a member.
    pub async fn remove_if_empty(&self, project_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&project_id) {
            if room.member_count() == 0 {
                rooms.remove(&project_id);
                log::info!("Room {project_id} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_projects(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
