//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients, verifying
//! the full pipeline: join, snapshot, feed fan-out, offline replay,
//! and disconnect cleanup.

use obra_collab::client::{ClientConfig, ClientError, ClientEvent, LinkState, SyncClient};
use obra_collab::protocol::{ActorProfile, ClientFrame, ErrorCode, FeedEvent, ServerFrame};
use obra_collab::server::{ServerConfig, SyncServer};
use obra_collab::session::SessionContext;
use obra_core::{Entity, EntityDraft, Point, Rgba, ShapeDraft, ShapeKind};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port; returns the handle and the port.
async fn start_test_server() -> (Arc<SyncServer>, u16) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        lease_ttl: Duration::from_secs(10),
        sweep_interval: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, port)
}

fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        ..ClientConfig::default()
    }
}

fn rect_at(x: f32, y: f32) -> EntityDraft {
    EntityDraft::Shape(ShapeDraft {
        kind: ShapeKind::Rect { width: 4.0, height: 2.0 },
        origin: Point::new(x, y),
        color: Rgba::default(),
        layer_id: None,
    })
}

/// Wait for the next feed batch, skipping other events.
async fn next_feed(rx: &mut tokio::sync::mpsc::Receiver<ClientEvent>) -> Vec<FeedEvent> {
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        if let ClientEvent::Feed(events) = event {
            return events;
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, port) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_and_goes_online() {
    let (_server, port) = start_test_server().await;
    let project = Uuid::new_v4();

    let mut client = SyncClient::new(ActorProfile::new("Alice"), project, client_config(port));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.link_state().await, LinkState::Online);

    // Joined, then the drain report, then LinkUp, in that order.
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ClientEvent::Joined { project_id, lease_ttl_ms }) => {
            assert_eq!(project_id, project);
            assert_eq!(lease_ttl_ms, 10_000);
        }
        other => panic!("Expected Joined, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ClientEvent::QueueDrained(report)) => {
            assert_eq!(report.replayed, 0);
            assert!(report.is_clean());
        }
        other => panic!("Expected QueueDrained, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ClientEvent::LinkUp) => {}
        other => panic!("Expected LinkUp, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_fans_out_to_peer() {
    let (_server, port) = start_test_server().await;
    let project = Uuid::new_v4();

    let mut alice = SyncClient::new(ActorProfile::new("Alice"), project, client_config(port));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();

    let mut bob = SyncClient::new(ActorProfile::new("Bob"), project, client_config(port));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    // Skip the join snapshots (empty project, but frames still arrive).
    let _ = next_feed(&mut alice_events).await;
    let _ = next_feed(&mut bob_events).await;

    let id = alice.create_entity(rect_at(10.0, 10.0)).await.unwrap();

    let batch = next_feed(&mut bob_events).await;
    match &batch[0] {
        FeedEvent::Added(entity) => assert_eq!(entity.id(), id),
        other => panic!("Expected Added, got {other:?}"),
    }
}

#[tokio::test]
async fn test_feed_echoes_to_originator() {
    let (_server, port) = start_test_server().await;
    let project = Uuid::new_v4();

    let mut alice = SyncClient::new(ActorProfile::new("Alice"), project, client_config(port));
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let _ = next_feed(&mut events).await; // join snapshot

    let id = alice.create_entity(rect_at(1.0, 2.0)).await.unwrap();

    // The originator's reconciliation depends on the echo.
    let batch = next_feed(&mut events).await;
    assert!(matches!(&batch[0], FeedEvent::Added(e) if e.id() == id));
}

#[tokio::test]
async fn test_offline_ops_drain_in_order_and_leave_empty_queue() {
    let (_server, port) = start_test_server().await;
    let project = Uuid::new_v4();

    let mut client = SyncClient::new(ActorProfile::new("Alice"), project, client_config(port));
    let mut events = client.take_event_rx().unwrap();

    // Two creates and a lock acquire captured while offline.
    let id = client.create_entity(rect_at(0.0, 0.0)).await.unwrap();
    client.create_entity(rect_at(5.0, 5.0)).await.unwrap();
    client.acquire_lock(id).await.unwrap();
    assert_eq!(client.queued_len().await, 3);

    client.connect().await.unwrap();

    let report = loop {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(ClientEvent::QueueDrained(report)) => break report,
            Some(_) => continue,
            None => panic!("Event channel closed before drain report"),
        }
    };
    assert_eq!(report.replayed, 3);
    assert!(report.failures.is_empty());
    assert!(!report.aborted);
    assert_eq!(client.queued_len().await, 0);
}

#[tokio::test]
async fn test_offline_create_and_move_dedup_then_stored() {
    let (server, port) = start_test_server().await;
    let project = Uuid::new_v4();

    let mut client = SyncClient::new(ActorProfile::new("Alice"), project, client_config(port));
    let mut events = client.take_event_rx().unwrap();

    // Offline: create at (10, 10), then drag to (50, 50) twice. The
    // moves coalesce to one queued entry behind the create.
    let id = client.create_entity(rect_at(10.0, 10.0)).await.unwrap();
    client.update_position(id, 30.0, 30.0).await.unwrap();
    client.update_position(id, 50.0, 50.0).await.unwrap();
    assert_eq!(client.queued_len().await, 2);

    client.connect().await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(ClientEvent::QueueDrained(report)) => {
                assert_eq!(report.replayed, 2);
                break;
            }
            Some(_) => continue,
            None => panic!("Event channel closed before drain report"),
        }
    }

    // The authoritative store holds the final position.
    let room = server.rooms().get(project).await.expect("room exists");
    match room.store.get(id).await.expect("entity stored") {
        Entity::Shape(s) => assert_eq!(s.origin, Point::new(50.0, 50.0)),
        other => panic!("Expected shape, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_first_violation_refused() {
    let (_server, port) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut writer, mut reader) = ws.split();

    // Anything but Join as the opening frame gets refused.
    let frame = ClientFrame::Resubscribe;
    writer
        .send(Message::Binary(frame.encode().unwrap().into()))
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(2), reader.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let bytes: Vec<u8> = match msg {
        Message::Binary(data) => data.into(),
        other => panic!("Expected binary frame, got {other:?}"),
    };
    match ServerFrame::decode(&bytes).unwrap() {
        ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::PermissionDenied),
        other => panic!("Expected Error, got {other:?}"),
    }

    // The server closes the connection after the refusal.
    let next = timeout(Duration::from_secs(2), reader.next()).await.unwrap();
    assert!(matches!(next, None | Some(Ok(Message::Close(_)))));
}

#[tokio::test]
async fn test_join_snapshot_reflects_all_history() {
    let (_server, port) = start_test_server().await;
    let project = Uuid::new_v4();

    let mut alice = SyncClient::new(ActorProfile::new("Alice"), project, client_config(port));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let _ = next_feed(&mut alice_events).await;

    // Four creates, one move, one delete.
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(alice.create_entity(rect_at(i as f32, 0.0)).await.unwrap());
    }
    alice.update_position(ids[1], 99.0, 99.0).await.unwrap();
    alice.delete_entity(ids[0]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A late joiner's snapshot is the folded state, three entities.
    let mut bob = SyncClient::new(ActorProfile::new("Bob"), project, client_config(port));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    let snapshot = next_feed(&mut bob_events).await;
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.iter().all(|e| matches!(e, FeedEvent::Added(_))));
    let moved = snapshot
        .iter()
        .find(|e| e.entity_id() == ids[1])
        .expect("moved entity in snapshot");
    match moved.entity() {
        Entity::Shape(s) => assert_eq!(s.origin, Point::new(99.0, 99.0)),
        other => panic!("Expected shape, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cursor_timeout_against_silent_server() {
    // A stub server that answers Join and then goes silent: cursor
    // updates must reject with Timeout instead of hanging.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut writer, mut reader) = ws.split();
        while let Some(Ok(msg)) = reader.next().await {
            if let Message::Binary(data) = msg {
                let bytes: Vec<u8> = data.into();
                if let Ok(ClientFrame::Join { project_id, .. }) = ClientFrame::decode(&bytes) {
                    let joined = ServerFrame::Joined { project_id, lease_ttl_ms: 10_000 };
                    writer
                        .send(Message::Binary(joined.encode().unwrap().into()))
                        .await
                        .unwrap();
                }
                // Everything else is swallowed, no acks ever.
            }
        }
    });

    let config = ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        cursor_timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    };
    let mut client = SyncClient::new(ActorProfile::new("Alice"), Uuid::new_v4(), config);
    client.connect().await.unwrap();
    assert_eq!(client.link_state().await, LinkState::Online);

    let start = tokio::time::Instant::now();
    let result = client.update_cursor(5.0, 5.0).await;
    assert!(matches!(result, Err(ClientError::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_disconnect_releases_locks_and_presence() {
    let (server, port) = start_test_server().await;
    let project = Uuid::new_v4();

    // Bob keeps the room alive after Alice leaves.
    let mut bob = SyncClient::new(ActorProfile::new("Bob"), project, client_config(port));
    bob.connect().await.unwrap();

    let mut alice = SyncClient::new(ActorProfile::new("Alice"), project, client_config(port));
    alice.connect().await.unwrap();
    let entity = alice.create_entity(rect_at(0.0, 0.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.acquire_lock(entity).await.unwrap();
    alice.set_presence().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let room = server.rooms().get(project).await.unwrap();
    assert!(room.locks.get(entity).await.is_some());
    assert_eq!(room.presence.len().await, 1);

    alice.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(room.locks.get(entity).await.is_none());
    assert_eq!(room.presence.len().await, 0);
}

#[tokio::test]
async fn test_lease_expiry_runs_disconnect_cleanup() {
    // A stub client that joins, locks, and then stops sending frames
    // without closing the socket: the lease sweeper must clean up.
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        lease_ttl: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let project = Uuid::new_v4();
    let actor = ActorProfile::new("Ghost");
    let user_id = actor.user_id;
    let url = format!("ws://127.0.0.1:{port}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut writer, _reader) = ws.split();

    let join = ClientFrame::Join { project_id: project, actor };
    writer
        .send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();
    let entity = Uuid::new_v4();
    let lock = ClientFrame::Lock {
        seq: 0,
        op: obra_collab::protocol::LockOp::Acquire {
            entity_id: entity,
            user_id,
            user_name: "Ghost".into(),
        },
    };
    writer
        .send(Message::Binary(lock.encode().unwrap().into()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let room = server.rooms().get(project).await.unwrap();
    assert!(room.locks.get(entity).await.is_some());

    // No frames for longer than the TTL: the sweeper expires the lease
    // and releases the lock even though the socket never closed.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(room.locks.get(entity).await.is_none());
    assert!(server.stats().await.leases_expired >= 1);
}

#[tokio::test]
async fn test_project_rooms_are_isolated() {
    let (_server, port) = start_test_server().await;
    let project_a = Uuid::new_v4();
    let project_b = Uuid::new_v4();

    let mut alice = SyncClient::new(ActorProfile::new("Alice"), project_a, client_config(port));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    let _ = next_feed(&mut alice_events).await;

    let mut bob = SyncClient::new(ActorProfile::new("Bob"), project_b, client_config(port));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    let _ = next_feed(&mut bob_events).await;

    alice.create_entity(rect_at(1.0, 1.0)).await.unwrap();

    // Alice's echo arrives; Bob's feed stays quiet.
    let _ = next_feed(&mut alice_events).await;
    let quiet = timeout(Duration::from_millis(300), async {
        loop {
            match bob_events.recv().await {
                Some(ClientEvent::Feed(events)) if !events.is_empty() => break,
                Some(_) => continue,
                None => break,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "Bob must not see project A's feed");
}

#[tokio::test]
async fn test_full_room_refuses_extra_client() {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        max_clients_per_project: 1,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let project = Uuid::new_v4();
    let mut alice = SyncClient::new(ActorProfile::new("Alice"), project, client_config(port));
    alice.connect().await.unwrap();

    let mut bob = SyncClient::new(ActorProfile::new("Bob"), project, client_config(port));
    match bob.connect().await {
        Err(ClientError::PermissionDenied(_)) => {}
        other => panic!("Expected refusal from full room, got {other:?}"),
    }
    assert_eq!(bob.link_state().await, LinkState::Offline);

    // The seat frees up once the first client leaves.
    alice.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.connect().await.unwrap();
    assert_eq!(bob.link_state().await, LinkState::Online);
}

#[tokio::test]
async fn test_session_switch_disposes_before_opening() {
    let (_server, port) = start_test_server().await;
    let project_a = Uuid::new_v4();
    let project_b = Uuid::new_v4();

    let mut ctx = SessionContext::new(ActorProfile::new("Alice"), client_config(port));
    let mut events = ctx.take_event_rx().unwrap();

    ctx.switch_board(project_a).await.unwrap();
    assert_eq!(ctx.active_project(), Some(project_a));
    assert_eq!(ctx.generation(), 1);
    ctx.client().unwrap().create_entity(rect_at(1.0, 1.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    ctx.switch_board(project_b).await.unwrap();
    assert_eq!(ctx.active_project(), Some(project_b));
    assert_eq!(ctx.generation(), 2);

    // Generation 2 events exist; the replica of the new session starts
    // empty because board B has no entities.
    let mut saw_gen2 = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), events.recv()).await {
        if event.generation == 2 {
            saw_gen2 = true;
        }
    }
    assert!(saw_gen2);
    let replica = ctx.session().unwrap().replica();
    assert!(replica.lock().await.is_empty());

    ctx.close().await;
    assert!(ctx.session().is_none());
}

#[tokio::test]
async fn test_session_replica_folds_feed() {
    let (_server, port) = start_test_server().await;
    let project = Uuid::new_v4();

    let mut ctx = SessionContext::new(ActorProfile::new("Alice"), client_config(port));
    ctx.switch_board(project).await.unwrap();

    let id = ctx.client().unwrap().create_entity(rect_at(7.0, 8.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let replica = ctx.session().unwrap().replica();
    let replica = replica.lock().await;
    match replica.get(id) {
        Some(Entity::Shape(s)) => assert_eq!(s.origin, Point::new(7.0, 8.0)),
        other => panic!("Expected shape in replica, got {other:?}"),
    }
}
