//! Per-user session context: one active board connection at a time.
//!
//! Switching boards is strictly sequential: the old session is fully
//! disposed (client shut down, fold task terminated) before the new
//! connection is opened, so two sessions never overlap on the wire.
//!
//! Every session gets a generation number, and every event the context
//! re-emits is tagged with it. A consumer that still holds events from
//! a disposed session can drop them by comparing generations instead of
//! guessing from timing.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::{ClientConfig, ClientError, ClientEvent, SyncClient};
use crate::protocol::{ActorProfile, LockMap, PresenceMap};
use crate::replica::BoardReplica;

/// A client event tagged with the session generation that produced it.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: ClientEvent,
}

/// One live board connection with its local mirrors.
pub struct BoardSession {
    project_id: Uuid,
    generation: u64,
    client: SyncClient,
    replica: Arc<Mutex<BoardReplica>>,
    locks: Arc<Mutex<LockMap>>,
    presence: Arc<Mutex<PresenceMap>>,
    fold_task: Option<JoinHandle<()>>,
}

impl BoardSession {
    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    pub fn replica(&self) -> Arc<Mutex<BoardReplica>> {
        self.replica.clone()
    }

    pub fn locks(&self) -> Arc<Mutex<LockMap>> {
        self.locks.clone()
    }

    pub fn presence(&self) -> Arc<Mutex<PresenceMap>> {
        self.presence.clone()
    }
}

/// Session supervisor for one user.
pub struct SessionContext {
    actor: ActorProfile,
    config: ClientConfig,
    current: Option<BoardSession>,
    generation: u64,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl SessionContext {
    pub fn new(actor: ActorProfile, config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        Self {
            actor,
            config,
            current: None,
            generation: 0,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Take the session event receiver (can only be called once). The
    /// channel outlives individual sessions; filter on `generation`.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Switch to another board.
    ///
    /// Disposes the current session completely, then connects to the
    /// new project, drains the offline queue for it, and starts folding
    /// its feed into a fresh replica. On connection failure the context
    /// is left with no active session.
    pub async fn switch_board(&mut self, project_id: Uuid) -> Result<(), ClientError> {
        self.close().await;

        self.generation += 1;
        let generation = self.generation;
        log::info!("Session generation {generation}: opening board {project_id}");

        let mut client = SyncClient::new(self.actor.clone(), project_id, self.config.clone());
        let mut event_rx = match client.take_event_rx() {
            Some(rx) => rx,
            None => return Err(ClientError::ConnectionClosed),
        };

        let replica = Arc::new(Mutex::new(BoardReplica::new()));
        let locks = Arc::new(Mutex::new(LockMap::new()));
        let presence = Arc::new(Mutex::new(PresenceMap::new()));

        // Fold feed/lock/presence events into the mirrors and re-emit
        // them tagged with this session's generation. Spawned before
        // connect so the join snapshot is folded too.
        let fold_task = {
            let replica = replica.clone();
            let locks = locks.clone();
            let presence = presence.clone();
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    match &event {
                        ClientEvent::Feed(events) => replica.lock().await.apply_feed(events),
                        ClientEvent::Locks(map) => *locks.lock().await = map.clone(),
                        ClientEvent::Presence(map) => *presence.lock().await = map.clone(),
                        _ => {}
                    }
                    if events_tx.send(SessionEvent { generation, event }).await.is_err() {
                        break;
                    }
                }
            })
        };

        if let Err(e) = client.connect().await {
            fold_task.abort();
            let _ = fold_task.await;
            return Err(e);
        }

        self.current = Some(BoardSession {
            project_id,
            generation,
            client,
            replica,
            locks,
            presence,
            fold_task: Some(fold_task),
        });
        Ok(())
    }

    /// Dispose the active session, if any. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.current.take() {
            log::info!(
                "Session generation {}: closing board {}",
                session.generation,
                session.project_id
            );
            session.client.shutdown().await;
            if let Some(task) = session.fold_task.take() {
                task.abort();
                let _ = task.await;
            }
        }
    }

    pub fn session(&self) -> Option<&BoardSession> {
        self.current.as_ref()
    }

    /// The client of the active session, for issuing mutations.
    pub fn client(&self) -> Option<&SyncClient> {
        self.current.as_ref().map(|s| &s.client)
    }

    pub fn active_project(&self) -> Option<Uuid> {
        self.current.as_ref().map(|s| s.project_id)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn actor(&self) -> &ActorProfile {
        &self.actor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ClientConfig {
        ClientConfig {
            // Nothing listens here.
            server_url: "ws://127.0.0.1:1".to_string(),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_context_has_no_session() {
        let ctx = SessionContext::new(ActorProfile::new("Alice"), ClientConfig::default());
        assert!(ctx.session().is_none());
        assert!(ctx.client().is_none());
        assert!(ctx.active_project().is_none());
        assert_eq!(ctx.generation(), 0);
    }

    #[tokio::test]
    async fn test_close_without_session_is_noop() {
        let mut ctx = SessionContext::new(ActorProfile::new("Alice"), ClientConfig::default());
        ctx.close().await;
        ctx.close().await;
        assert!(ctx.session().is_none());
    }

    #[tokio::test]
    async fn test_failed_switch_leaves_no_session() {
        let mut ctx = SessionContext::new(ActorProfile::new("Alice"), unreachable_config());
        let result = ctx.switch_board(Uuid::new_v4()).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert!(ctx.session().is_none());
    }

    #[tokio::test]
    async fn test_generation_advances_per_attempt() {
        let mut ctx = SessionContext::new(ActorProfile::new("Alice"), unreachable_config());
        let _ = ctx.switch_board(Uuid::new_v4()).await;
        assert_eq!(ctx.generation(), 1);
        let _ = ctx.switch_board(Uuid::new_v4()).await;
        assert_eq!(ctx.generation(), 2);
    }

    #[tokio::test]
    async fn test_event_rx_taken_once() {
        let mut ctx = SessionContext::new(ActorProfile::new("Alice"), ClientConfig::default());
        assert!(ctx.take_event_rx().is_some());
        assert!(ctx.take_event_rx().is_none());
    }
}
