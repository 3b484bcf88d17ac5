//! WebSocket sync client: connection supervisor and mutation API.
//!
//! Link state machine:
//! ```text
//! Online ──(loss detected)──► Offline ──(restored)──► Resyncing ──► Online
//! ```
//!
//! While `Online`, mutations are sent as fire-and-forget frames
//! (`seq == 0`); reconciliation rides on the echoed feed event, not on
//! acks. While `Offline`, the replay-safe subset of mutations is
//! redirected into the `OfflineQueue`; generic field updates and
//! deletes are refused instead, because replaying them against state
//! that moved on is destructive. `Resyncing` drains the queue with
//! per-item acks, then re-establishes subscriptions from a fresh full
//! snapshot.
//!
//! `update_cursor` is the one acked interactive call: it races the ack
//! against a timeout (2 s default) and rejects `Timeout` with no
//! automatic retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

use obra_core::{EntityDraft, EntityPatch};

use crate::offline::{OfflineQueue, QueuedOp};
use crate::protocol::{
    ActorProfile, ClientFrame, EntityOp, ErrorCode, FeedEvent, LockMap, LockOp, PresenceMap,
    PresenceOp, ProtocolError, ServerFrame,
};

/// Client link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Offline,
    Connecting,
    /// Connected, draining the offline queue before going fully online.
    Resyncing,
    Online,
}

/// Client-facing errors.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Acked call not answered in time; the update is dropped.
    Timeout,
    /// Transport down (or the call is not queueable while offline).
    ConnectionClosed,
    /// Offline queue at capacity; the op was dropped.
    QueueFull,
    /// Server-side lookup failure. Surfaced, never retried.
    NotFound(Uuid),
    /// Fatal for this call.
    PermissionDenied(String),
    /// Rejected before any write attempt.
    Validation(String),
    /// Server-side internal failure.
    Internal(String),
    /// Encode/decode failure.
    Protocol(ProtocolError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::ConnectionClosed => write!(f, "Connection closed"),
            ClientError::QueueFull => write!(f, "Offline queue full"),
            ClientError::NotFound(id) => write!(f, "Not found: {id}"),
            ClientError::PermissionDenied(reason) => write!(f, "Permission denied: {reason}"),
            ClientError::Validation(msg) => write!(f, "Validation error: {msg}"),
            ClientError::Internal(msg) => write!(f, "Internal server error: {msg}"),
            ClientError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

/// Translate a wire rejection into a typed client error.
fn rejection(code: ErrorCode, message: String, entity_id: Option<Uuid>) -> ClientError {
    match code {
        ErrorCode::NotFound => ClientError::NotFound(entity_id.unwrap_or_else(Uuid::nil)),
        ErrorCode::PermissionDenied => ClientError::PermissionDenied(message),
        ErrorCode::Validation => ClientError::Validation(message),
        ErrorCode::Internal => ClientError::Internal(message),
    }
}

/// Outcome of one replay pass over the offline queue.
///
/// `aborted` means the transport dropped mid-drain; everything not yet
/// acked stays queued for the next online transition.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub replayed: usize,
    pub failures: Vec<(QueuedOp, ClientError)>,
    pub aborted: bool,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        !self.aborted && self.failures.is_empty()
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Fully online (queue drained, fresh snapshot requested).
    LinkUp,
    /// Transport lost.
    LinkDown,
    /// Joined a project; carries the lease TTL the server granted.
    Joined { project_id: Uuid, lease_ttl_ms: u64 },
    /// Incremental change-feed batch (includes the full snapshot on
    /// join/resubscribe).
    Feed(Vec<FeedEvent>),
    /// Full lock map.
    Locks(LockMap),
    /// Full presence map.
    Presence(PresenceMap),
    /// One replay pass finished.
    QueueDrained(DrainReport),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server WebSocket URL
    pub server_url: String,
    /// Hard deadline for acked cursor updates
    pub cursor_timeout: Duration,
    /// Per-item ack deadline during queue drain
    pub ack_timeout: Duration,
    /// Outgoing/event channel capacity
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            cursor_timeout: Duration::from_millis(2000),
            ack_timeout: Duration::from_secs(5),
            channel_capacity: 256,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), ClientError>>>>>;

/// The sync client.
pub struct SyncClient {
    actor: ActorProfile,
    project_id: Uuid,
    config: ClientConfig,
    state: Arc<RwLock<LinkState>>,
    /// Per-client monotonic mutation counter, stored on shapes for
    /// same-field tie-breaking. Not wall time.
    client_clock: AtomicU64,
    /// Ack sequence allocator; 0 is reserved for fire-and-forget.
    next_seq: AtomicU64,
    pending: PendingMap,
    queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client with an in-memory offline queue.
    pub fn new(actor: ActorProfile, project_id: Uuid, config: ClientConfig) -> Self {
        Self::with_queue(actor, project_id, config, OfflineQueue::new())
    }

    /// Create a client with a caller-provided queue (e.g. journal-backed).
    pub fn with_queue(
        actor: ActorProfile,
        project_id: Uuid,
        config: ClientConfig,
        queue: OfflineQueue,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        Self {
            actor,
            project_id,
            config,
            state: Arc::new(RwLock::new(LinkState::Offline)),
            client_clock: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new(Mutex::new(queue)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the project, drain the offline queue, and request
    /// a fresh snapshot.
    ///
    /// Returns once the link is fully online. Transport loss mid-drain
    /// surfaces as `ConnectionClosed`; undrained ops stay queued.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        match self.connect_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Any failed attempt lands back in Offline with the
                // writer channel closed.
                self.outgoing_tx = None;
                *self.state.write().await = LinkState::Offline;
                Err(e)
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = LinkState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.config.server_url).await
        {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.config.server_url);
                return Err(ClientError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.channel_capacity);
        self.tasks.push(tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
        self.outgoing_tx = Some(out_tx);

        // Join must be the first frame.
        let join = ClientFrame::Join {
            project_id: self.project_id,
            actor: self.actor.clone(),
        };
        self.send_frame(&join).await?;

        // Wait for the server's verdict before starting the pump.
        let lease_ttl_ms = loop {
            match ws_reader.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match ServerFrame::decode(&bytes)? {
                        ServerFrame::Joined { lease_ttl_ms, .. } => break lease_ttl_ms,
                        ServerFrame::Error { code, message, entity_id, .. } => {
                            return Err(rejection(code, message, entity_id));
                        }
                        _ => continue,
                    }
                }
                Some(Ok(_)) => continue,
                _ => return Err(ClientError::ConnectionClosed),
            }
        };

        self.spawn_heartbeat(Duration::from_millis(lease_ttl_ms.max(3) / 3));
        self.spawn_pump(ws_reader);

        let _ = self
            .event_tx
            .send(ClientEvent::Joined { project_id: self.project_id, lease_ttl_ms })
            .await;

        // Replay offline mutations before declaring the link up.
        *self.state.write().await = LinkState::Resyncing;
        let report = self.drain_queue().await;
        let aborted = report.aborted;
        let _ = self.event_tx.send(ClientEvent::QueueDrained(report)).await;
        if aborted {
            return Err(ClientError::ConnectionClosed);
        }

        // Re-establish subscriptions from scratch: a full snapshot that
        // reflects the replayed ops.
        self.send_frame(&ClientFrame::Resubscribe).await?;

        *self.state.write().await = LinkState::Online;
        let _ = self.event_tx.send(ClientEvent::LinkUp).await;
        log::info!(
            "Client {} online on project {} (lease TTL {lease_ttl_ms}ms)",
            self.actor.user_id,
            self.project_id
        );
        Ok(())
    }

    /// Lease heartbeats at TTL/3 (any frame renews, these cover idle links).
    fn spawn_heartbeat(&mut self, interval: Duration) {
        let tx = match self.outgoing_tx.clone() {
            Some(tx) => tx,
            None => return,
        };
        let encoded = match ClientFrame::LeaseRenew.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode heartbeat frame: {e}");
                return;
            }
        };
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if tx.send(encoded.clone()).await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Pump: route inbound frames to acks, events, and state changes.
    fn spawn_pump(
        &mut self,
        mut ws_reader: impl StreamExt<
                Item = Result<
                    tokio_tungstenite::tungstenite::Message,
                    tokio_tungstenite::tungstenite::Error,
                >,
            > + Unpin
            + Send
            + 'static,
    ) {
        let event_tx = self.event_tx.clone();
        let pending = self.pending.clone();
        let state = self.state.clone();

        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match ServerFrame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Failed to decode server frame: {e}");
                                continue;
                            }
                        };
                        match frame {
                            ServerFrame::Ack { seq } => {
                                if let Some(tx) = pending.lock().await.remove(&seq) {
                                    let _ = tx.send(Ok(()));
                                } else {
                                    log::debug!("Ack for unknown seq {seq}");
                                }
                            }
                            ServerFrame::Error { seq, code, message, entity_id } => {
                                let err = rejection(code, message, entity_id);
                                match pending.lock().await.remove(&seq) {
                                    Some(tx) => {
                                        let _ = tx.send(Err(err));
                                    }
                                    // Fire-and-forget rejection: the feed
                                    // never echoes, the replica stays put.
                                    None => log::warn!("Server rejected op (seq {seq}): {err}"),
                                }
                            }
                            ServerFrame::Feed { events } => {
                                let _ = event_tx.send(ClientEvent::Feed(events)).await;
                            }
                            ServerFrame::Locks { map } => {
                                let _ = event_tx.send(ClientEvent::Locks(map)).await;
                            }
                            ServerFrame::Presence { map } => {
                                let _ = event_tx.send(ClientEvent::Presence(map)).await;
                            }
                            ServerFrame::Joined { .. } | ServerFrame::Pong => {}
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Transport lost: fail every waiter and flip the link down.
            *state.write().await = LinkState::Offline;
            pending.lock().await.clear();
            let _ = event_tx.send(ClientEvent::LinkDown).await;
            log::info!("Link down");
        }));
    }

    /// Drain queued ops for this project, in enqueue order, one ack at
    /// a time. Ops for other projects are retained.
    async fn drain_queue(&self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let op = {
                let queue = self.queue.lock().await;
                queue.front_for(self.project_id).cloned()
            };
            let Some(op) = op else { break };

            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(seq, tx);

            if self.send_frame(&op.to_frame(seq)).await.is_err() {
                self.pending.lock().await.remove(&seq);
                report.aborted = true;
                break;
            }

            match tokio::time::timeout(self.config.ack_timeout, rx).await {
                Ok(Ok(Ok(()))) => {
                    self.queue.lock().await.shift_for(self.project_id);
                    report.replayed += 1;
                }
                Ok(Ok(Err(e))) => {
                    // Typed rejection never halts the drain.
                    log::warn!("Replay of {} rejected: {e}", op.kind_name());
                    self.queue.lock().await.shift_for(self.project_id);
                    report.failures.push((op, e));
                }
                Ok(Err(_)) | Err(_) => {
                    self.pending.lock().await.remove(&seq);
                    report.aborted = true;
                    break;
                }
            }
        }

        {
            let mut queue = self.queue.lock().await;
            if queue.needs_compact() {
                if let Err(e) = queue.compact() {
                    log::error!("Failed to compact queue journal: {e}");
                }
            }
        }

        if report.replayed > 0 || !report.failures.is_empty() {
            log::info!(
                "Drained offline queue: {} replayed, {} rejected{}",
                report.replayed,
                report.failures.len(),
                if report.aborted { ", aborted" } else { "" }
            );
        }
        report
    }

    // ─── Entity Mutations ─────────────────────────────────────────────

    /// Create an entity with a client-assigned id.
    ///
    /// Offline, the create is queued for replay.
    pub async fn create_entity(&self, draft: EntityDraft) -> Result<Uuid, ClientError> {
        let entity_id = Uuid::new_v4();
        if self.is_online().await {
            let frame = ClientFrame::Entity {
                seq: 0,
                op: EntityOp::Create { entity_id, draft, actor_id: self.actor.user_id },
            };
            self.send_frame(&frame).await?;
        } else {
            self.enqueue(QueuedOp::CreateEntity {
                project_id: self.project_id,
                entity_id,
                draft,
                actor_id: self.actor.user_id,
            })
            .await?;
        }
        Ok(entity_id)
    }

    /// Apply a field-level patch. Not queueable: offline calls are
    /// refused rather than replayed against moved-on state.
    pub async fn update_entity(
        &self,
        entity_id: Uuid,
        patch: EntityPatch,
    ) -> Result<u64, ClientError> {
        if !self.is_online().await {
            return Err(ClientError::ConnectionClosed);
        }
        let client_clock = self.next_clock();
        let frame = ClientFrame::Entity {
            seq: 0,
            op: EntityOp::Update {
                entity_id,
                patch,
                actor_id: self.actor.user_id,
                client_clock,
            },
        };
        self.send_frame(&frame).await?;
        Ok(client_clock)
    }

    /// Move an entity. Offline, coalesced into the queue by entity id.
    pub async fn update_position(
        &self,
        entity_id: Uuid,
        x: f32,
        y: f32,
    ) -> Result<u64, ClientError> {
        let client_clock = self.next_clock();
        if self.is_online().await {
            let frame = ClientFrame::Entity {
                seq: 0,
                op: EntityOp::UpdatePosition {
                    entity_id,
                    x,
                    y,
                    actor_id: self.actor.user_id,
                    client_clock,
                },
            };
            self.send_frame(&frame).await?;
        } else {
            self.enqueue(QueuedOp::UpdatePosition {
                project_id: self.project_id,
                entity_id,
                x,
                y,
                actor_id: self.actor.user_id,
                client_clock,
            })
            .await?;
        }
        Ok(client_clock)
    }

    /// Delete an entity. Not queueable.
    pub async fn delete_entity(&self, entity_id: Uuid) -> Result<(), ClientError> {
        if !self.is_online().await {
            return Err(ClientError::ConnectionClosed);
        }
        let frame = ClientFrame::Entity { seq: 0, op: EntityOp::Delete { entity_id } };
        self.send_frame(&frame).await
    }

    // ─── Locks ────────────────────────────────────────────────────────

    pub async fn acquire_lock(&self, entity_id: Uuid) -> Result<(), ClientError> {
        if self.is_online().await {
            let frame = ClientFrame::Lock {
                seq: 0,
                op: LockOp::Acquire {
                    entity_id,
                    user_id: self.actor.user_id,
                    user_name: self.actor.name.clone(),
                },
            };
            self.send_frame(&frame).await
        } else {
            self.enqueue(QueuedOp::AcquireLock {
                project_id: self.project_id,
                entity_id,
                user_id: self.actor.user_id,
                user_name: self.actor.name.clone(),
            })
            .await
        }
    }

    pub async fn release_lock(&self, entity_id: Uuid) -> Result<(), ClientError> {
        if self.is_online().await {
            let frame = ClientFrame::Lock { seq: 0, op: LockOp::Release { entity_id } };
            self.send_frame(&frame).await
        } else {
            self.enqueue(QueuedOp::ReleaseLock { project_id: self.project_id, entity_id })
                .await
        }
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Announce presence (cursor starts at the origin server-side).
    pub async fn set_presence(&self) -> Result<(), ClientError> {
        if self.is_online().await {
            let frame = ClientFrame::Presence {
                seq: 0,
                op: PresenceOp::Set {
                    user_id: self.actor.user_id,
                    name: self.actor.name.clone(),
                    color: self.actor.color,
                },
            };
            self.send_frame(&frame).await
        } else {
            self.enqueue(QueuedOp::SetPresence {
                project_id: self.project_id,
                user_id: self.actor.user_id,
                name: self.actor.name.clone(),
                color: self.actor.color,
            })
            .await
        }
    }

    /// Move the cursor. Online, this is the one acked interactive call:
    /// the ack races the configured timeout, and a timeout means the
    /// update is dropped with no automatic retry.
    pub async fn update_cursor(&self, x: f32, y: f32) -> Result<(), ClientError> {
        if !self.is_online().await {
            return self
                .enqueue(QueuedOp::UpdateCursor {
                    project_id: self.project_id,
                    user_id: self.actor.user_id,
                    x,
                    y,
                })
                .await;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let frame = ClientFrame::Presence {
            seq,
            op: PresenceOp::Cursor { user_id: self.actor.user_id, x, y },
        };
        if let Err(e) = self.send_frame(&frame).await {
            self.pending.lock().await.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(self.config.cursor_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                log::debug!("Cursor update (seq {seq}) timed out, dropped");
                Err(ClientError::Timeout)
            }
        }
    }

    pub async fn update_view(&self, view: impl Into<String>) -> Result<(), ClientError> {
        let view = view.into();
        if self.is_online().await {
            let frame = ClientFrame::Presence {
                seq: 0,
                op: PresenceOp::View { user_id: self.actor.user_id, view },
            };
            self.send_frame(&frame).await
        } else {
            self.enqueue(QueuedOp::UpdateView {
                project_id: self.project_id,
                user_id: self.actor.user_id,
                view,
            })
            .await
        }
    }

    // ─── Link Management ──────────────────────────────────────────────

    /// Request a fresh full snapshot plus lock/presence maps.
    pub async fn resubscribe(&self) -> Result<(), ClientError> {
        if !self.is_online().await {
            return Err(ClientError::ConnectionClosed);
        }
        self.send_frame(&ClientFrame::Resubscribe).await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send_frame(&ClientFrame::Ping).await
    }

    /// Tear the connection down deterministically: background tasks are
    /// aborted and the writer channel dropped.
    pub async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.outgoing_tx = None;
        self.pending.lock().await.clear();
        *self.state.write().await = LinkState::Offline;
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub async fn link_state(&self) -> LinkState {
        *self.state.read().await
    }

    pub fn actor(&self) -> &ActorProfile {
        &self.actor
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn queue_snapshot(&self) -> Vec<QueuedOp> {
        self.queue.lock().await.iter().cloned().collect()
    }

    pub fn clock(&self) -> u64 {
        self.client_clock.load(Ordering::SeqCst)
    }

    // ─── Internals ────────────────────────────────────────────────────

    async fn is_online(&self) -> bool {
        *self.state.read().await == LinkState::Online
    }

    fn next_clock(&self) -> u64 {
        self.client_clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn enqueue(&self, op: QueuedOp) -> Result<(), ClientError> {
        let mut queue = self.queue.lock().await;
        if queue.push(op) {
            Ok(())
        } else {
            Err(ClientError::QueueFull)
        }
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let encoded = frame.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ClientError::ConnectionClosed),
            None => Err(ClientError::ConnectionClosed),
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
