//! WebSocket sync server with project-room routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (project_id) ── EntityStore ── ProjectChannel
//! Client B ──┘          │                  │
//!                       │                  └── ProjectStore (RocksDB)
//!                       ├── LockManager
//!                       ├── PresenceTable
//!                       │
//!            ┌──────────┼───────────┐
//!            ▼          ▼           ▼
//!         Client A   Client B    Client C
//! ```
//!
//! Every connection must open with `Join`; anything else is refused
//! with `PermissionDenied`. A joined connection holds a lease renewed
//! by any inbound frame. A periodic sweep expires stale leases and
//! runs the same cleanup a clean disconnect would: presence removed,
//! owned locks released.
//!
//! Acked frames (`seq != 0`) get `Ack` or `Error` directed at the
//! sender; the entity feed itself fans out through the room channel to
//! every subscriber, originator included.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Room, RoomRegistry};
use crate::lease::LeaseRegistry;
use crate::protocol::{
    ClientFrame, EntityOp, ErrorCode, LockOp, PresenceOp, ServerFrame,
};
use crate::storage::{ProjectStore, StoreConfig};
use crate::store::StoreError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum concurrent connections per project room
    pub max_clients_per_project: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How long a lease lives without renewal
    pub lease_ttl: Duration,
    /// How often expired leases are swept
    pub sweep_interval: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_project: 64,
            broadcast_capacity: 256,
            lease_ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub leases_expired: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomRegistry>,
    leases: Arc<LeaseRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<ProjectStore>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Result<Self, crate::storage::StorageError> {
        let store = match config.storage_path.as_ref() {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(ProjectStore::open(store_config)?))
            }
            None => None,
        };

        let rooms = Arc::new(RoomRegistry::new(config.broadcast_capacity, store.clone()));

        Ok(Self {
            config,
            rooms,
            leases: Arc::new(LeaseRegistry::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        match Self::new(ServerConfig::default()) {
            Ok(server) => server,
            // No storage path configured, so open cannot fail.
            Err(_) => unreachable!("in-memory server construction is infallible"),
        }
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, crate::storage::StorageError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop and the lease sweeper. Call from an
    /// async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        self.spawn_lease_sweeper();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let leases = self.leases.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, leases, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Expire stale leases and run disconnect cleanup for their owners.
    fn spawn_lease_sweeper(&self) {
        let leases = self.leases.clone();
        let rooms = self.rooms.clone();
        let stats = self.stats.clone();
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = leases.sweep().await;
                for lease in expired {
                    log::warn!(
                        "Lease {} expired for user {} on project {}",
                        lease.lease_id,
                        lease.user_id,
                        lease.project_id
                    );
                    if let Some(room) = rooms.get(lease.project_id).await {
                        room.presence.remove_presence(lease.user_id).await;
                        let released = room.locks.release_owned_by(lease.user_id).await;
                        if !released.is_empty() {
                            log::info!(
                                "Released {} locks held by expired user {}",
                                released.len(),
                                lease.user_id
                            );
                        }
                    }
                    let mut s = stats.write().await;
                    s.leases_expired += 1;
                }
            }
        });
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomRegistry>,
        leases: Arc<LeaseRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Connection state, set on Join
        let mut room: Option<Arc<Room>> = None;
        let mut user_id: Option<Uuid> = None;
        let mut project_id: Option<Uuid> = None;
        let mut lease_id: Option<Uuid> = None;
        let mut channel_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let frame = match ClientFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            // Any inbound frame renews the lease.
                            if let Some(id) = lease_id {
                                leases.renew(id).await;
                            }

                            match frame {
                                ClientFrame::Join { project_id: pid, actor } => {
                                    let joined = rooms.get_or_create(pid).await;
                                    if joined.member_count() >= config.max_clients_per_project {
                                        let refusal = ServerFrame::error(
                                            0,
                                            ErrorCode::PermissionDenied,
                                            "Project is full",
                                            None,
                                        );
                                        ws_sender
                                            .send(Message::Binary(refusal.encode()?.into()))
                                            .await?;
                                        log::warn!(
                                            "Refused join to full project {pid} from {addr}"
                                        );
                                        drop(joined);
                                        rooms.remove_if_empty(pid).await;
                                        break;
                                    }
                                    joined.add_member();
                                    channel_rx = Some(joined.channel.subscribe());

                                    let lease = leases
                                        .register(actor.user_id, pid, config.lease_ttl)
                                        .await;
                                    lease_id = Some(lease);
                                    user_id = Some(actor.user_id);
                                    project_id = Some(pid);

                                    let hello = ServerFrame::Joined {
                                        project_id: pid,
                                        lease_ttl_ms: config.lease_ttl.as_millis() as u64,
                                    };
                                    ws_sender.send(Message::Binary(hello.encode()?.into())).await?;
                                    Self::send_snapshot(&mut ws_sender, &joined).await?;

                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = rooms.room_count().await;
                                    }
                                    log::info!(
                                        "User {} ({}) joined project {pid}",
                                        actor.name,
                                        actor.user_id
                                    );
                                    room = Some(joined);
                                }

                                ClientFrame::Ping => {
                                    ws_sender
                                        .send(Message::Binary(ServerFrame::Pong.encode()?.into()))
                                        .await?;
                                }

                                ClientFrame::LeaseRenew => {
                                    // Renewal already happened above.
                                }

                                other if room.is_none() => {
                                    // Join-first violation: refuse and close.
                                    let refusal = ServerFrame::error(
                                        other.seq().unwrap_or(0),
                                        ErrorCode::PermissionDenied,
                                        "Join must be the first frame",
                                        None,
                                    );
                                    ws_sender
                                        .send(Message::Binary(refusal.encode()?.into()))
                                        .await?;
                                    log::warn!("Frame before Join from {addr}, closing");
                                    break;
                                }

                                ClientFrame::Resubscribe => {
                                    if let Some(ref r) = room {
                                        Self::send_snapshot(&mut ws_sender, r).await?;
                                    }
                                }

                                ClientFrame::Entity { seq, op } => {
                                    if let Some(ref r) = room {
                                        let outcome = Self::apply_entity_op(r, op).await;
                                        Self::reply(&mut ws_sender, seq, outcome).await?;
                                    }
                                }

                                ClientFrame::Lock { seq, op } => {
                                    if let Some(ref r) = room {
                                        match op {
                                            LockOp::Acquire { entity_id, user_id, user_name } => {
                                                r.locks.acquire(entity_id, user_id, user_name).await;
                                            }
                                            LockOp::Release { entity_id } => {
                                                r.locks.release(entity_id).await;
                                            }
                                        }
                                        Self::reply(&mut ws_sender, seq, Ok(())).await?;
                                    }
                                }

                                ClientFrame::Presence { seq, op } => {
                                    if let Some(ref r) = room {
                                        let outcome = Self::apply_presence_op(r, op).await;
                                        Self::reply(&mut ws_sender, seq, outcome).await?;
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Room fan-out, including echoes of this client's own ops.
                msg = async {
                    match channel_rx {
                        Some(ref mut rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Client {user_id:?} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: release lease, presence, and locks, then shrink the room.
        if let Some(id) = lease_id {
            leases.release(id).await;
        }
        if let (Some(uid), Some(pid), Some(r)) = (user_id, project_id, room) {
            r.presence.remove_presence(uid).await;
            let released = r.locks.release_owned_by(uid).await;
            if !released.is_empty() {
                log::info!("Released {} locks on disconnect of user {uid}", released.len());
            }
            r.remove_member();
            drop(r);
            rooms.remove_if_empty(pid).await;
        }

        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = rooms.room_count().await;

        Ok(())
    }

    /// Send the full project state directly to one client: entity
    /// snapshot plus current lock and presence maps.
    async fn send_snapshot<S>(ws_sender: &mut S, room: &Room) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: SinkExt<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let feed = ServerFrame::Feed { events: room.store.snapshot_events().await };
        let locks = ServerFrame::Locks { map: room.locks.snapshot().await };
        let presence = ServerFrame::Presence { map: room.presence.snapshot().await };

        ws_sender.send(Message::Binary(feed.encode()?.into())).await?;
        ws_sender.send(Message::Binary(locks.encode()?.into())).await?;
        ws_sender.send(Message::Binary(presence.encode()?.into())).await?;
        Ok(())
    }

    async fn apply_entity_op(
        room: &Room,
        op: EntityOp,
    ) -> Result<(), (ErrorCode, String, Option<Uuid>)> {
        let result = match op {
            EntityOp::Create { entity_id, draft, actor_id } => {
                room.store.create(entity_id, draft, actor_id).await
            }
            EntityOp::Update { entity_id, patch, actor_id, client_clock } => {
                room.store.update(entity_id, patch, actor_id, client_clock).await
            }
            EntityOp::UpdatePosition { entity_id, x, y, actor_id, client_clock } => {
                room.store.update_position(entity_id, x, y, actor_id, client_clock).await
            }
            EntityOp::Delete { entity_id } => room.store.delete(entity_id).await,
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let (code, entity_id) = match &e {
                    StoreError::NotFound(id) => (ErrorCode::NotFound, Some(*id)),
                    StoreError::DuplicateId(id) => (ErrorCode::Validation, Some(*id)),
                    StoreError::Validation(_) => (ErrorCode::Validation, None),
                    StoreError::KindMismatch { .. } => (ErrorCode::Validation, None),
                };
                Err((code, e.to_string(), entity_id))
            }
        }
    }

    async fn apply_presence_op(
        room: &Room,
        op: PresenceOp,
    ) -> Result<(), (ErrorCode, String, Option<Uuid>)> {
        let result = match op {
            PresenceOp::Set { user_id, name, color } => {
                room.presence.set_presence(user_id, name, color).await;
                Ok(())
            }
            PresenceOp::Cursor { user_id, x, y } => {
                room.presence.update_cursor(user_id, x, y).await
            }
            PresenceOp::View { user_id, view } => room.presence.update_view(user_id, view).await,
            PresenceOp::Remove { user_id } => {
                room.presence.remove_presence(user_id).await;
                Ok(())
            }
        };
        result.map_err(|e| (ErrorCode::NotFound, e.to_string(), None))
    }

    /// Ack or refuse an acked frame. Fire-and-forget frames (`seq == 0`)
    /// get no ack on success, but rejections are still reported.
    async fn reply<S>(
        ws_sender: &mut S,
        seq: u64,
        outcome: Result<(), (ErrorCode, String, Option<Uuid>)>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: SinkExt<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        match outcome {
            Ok(()) => {
                if seq != 0 {
                    let ack = ServerFrame::Ack { seq };
                    ws_sender.send(Message::Binary(ack.encode()?.into())).await?;
                }
            }
            Err((code, message, entity_id)) => {
                let error = ServerFrame::error(seq, code, message, entity_id);
                ws_sender.send(Message::Binary(error.encode()?.into())).await?;
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room registry.
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Get the lease registry.
    pub fn leases(&self) -> &Arc<LeaseRegistry> {
        &self.leases
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<ProjectStore>> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_clients_per_project, 64);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store.is_none());
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            broadcast_capacity: 512,
            lease_ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(500),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
        assert!(server.store.is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.leases_expired, 0);
    }

    #[tokio::test]
    async fn test_apply_entity_op_not_found() {
        let room = Room::new(Uuid::new_v4(), 16, None);
        let missing = Uuid::new_v4();
        let outcome = SyncServer::apply_entity_op(
            &room,
            EntityOp::Delete { entity_id: missing },
        )
        .await;
        match outcome {
            Err((ErrorCode::NotFound, _, Some(id))) => assert_eq!(id, missing),
            other => panic!("expected not-found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_apply_presence_op_unknown_user() {
        let room = Room::new(Uuid::new_v4(), 16, None);
        let outcome = SyncServer::apply_presence_op(
            &room,
            PresenceOp::Cursor { user_id: Uuid::new_v4(), x: 1.0, y: 1.0 },
        )
        .await;
        assert!(matches!(outcome, Err((ErrorCode::NotFound, _, None))));
    }
}
