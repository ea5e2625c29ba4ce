//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use quill_collab::protocol::{self, ClientMessage, Encoding, Frame, ServerMessage};
use quill_collab::{ConnectionState, ErrorCode, PresenceEvent, ServerConfig, SyncClient, SyncEvent, SyncServer};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a server on an ephemeral port and return it with its URL.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let server = Arc::new(SyncServer::new(ServerConfig::for_testing()).unwrap());
    let listener = server.bind().await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(rx: &mut mpsc::Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connected_client(url: &str, doc: Uuid) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(Uuid::new_v4(), doc, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await;
    (client, events)
}

/// Poll until `client` has nothing pending.
async fn settle(client: &SyncClient) {
    timeout(Duration::from_secs(2), async {
        while !client.is_synchronized().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never settled");
}

#[tokio::test]
async fn test_client_joins_and_syncs() {
    let (server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let mut client = SyncClient::new(Uuid::new_v4(), doc, &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await {
        SyncEvent::Synced { revision, participants } => {
            assert_eq!(revision, 0);
            assert_eq!(participants, vec![client.participant_id()]);
        }
        other => panic!("Expected Synced, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert!(server.registry().is_active(doc).await);
}

#[tokio::test]
async fn test_two_clients_edit_same_document() {
    let (_server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let (alice, mut alice_events) = connected_client(&url, doc).await;
    let (bob, mut bob_events) = connected_client(&url, doc).await;

    alice.insert(0, "Hello").await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await;
    assert_eq!(bob.content().await, "Hello");

    bob.insert(5, " world").await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await;

    settle(&alice).await;
    settle(&bob).await;
    assert_eq!(alice.content().await, "Hello world");
    assert_eq!(bob.content().await, "Hello world");
    assert_eq!(alice.revision().await, 2);
    assert_eq!(bob.revision().await, 2);
}

#[tokio::test]
async fn test_concurrent_edits_converge_over_websocket() {
    let (server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let (alice, _alice_events) = connected_client(&url, doc).await;
    let (bob, _bob_events) = connected_client(&url, doc).await;

    // Neither has seen the other's edits
    for i in 0..5 {
        alice.insert(0, &format!("a{i}")).await.unwrap();
        bob.insert(0, &format!("b{i}")).await.unwrap();
    }

    let expected = timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = server.registry().snapshot(doc).await.unwrap();
            if snapshot.revision == 10 {
                return snapshot.content;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never reached revision 10");

    settle(&alice).await;
    settle(&bob).await;
    assert_eq!(expected.chars().count(), 20);
    assert_eq!(alice.content().await, expected);
    assert_eq!(bob.content().await, expected);
}

#[tokio::test]
async fn test_presence_and_cursor_events() {
    let (_server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let (alice, mut alice_events) = connected_client(&url, doc).await;
    let (mut bob, _bob_events) = connected_client(&url, doc).await;
    let bob_id = bob.participant_id();

    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Presence { .. })).await {
        SyncEvent::Presence { participant_id, event } => {
            assert_eq!(participant_id, bob_id);
            assert_eq!(event, PresenceEvent::Joined);
        }
        other => panic!("Expected presence, got {other:?}"),
    }

    alice.insert(0, "abc").await.unwrap();
    settle(&alice).await;
    sleep(Duration::from_millis(50)).await;
    bob.move_cursor(2).await.unwrap();
    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Cursor { .. })).await {
        SyncEvent::Cursor { participant_id, position } => {
            assert_eq!(participant_id, bob_id);
            assert_eq!(position, 2);
        }
        other => panic!("Expected cursor, got {other:?}"),
    }

    bob.leave().await.unwrap();
    let left = wait_for(&mut alice_events, |e| {
        matches!(e, SyncEvent::Presence { event: PresenceEvent::Left, .. })
    })
    .await;
    assert_eq!(
        left,
        SyncEvent::Presence {
            participant_id: bob_id,
            event: PresenceEvent::Left
        }
    );
}

#[tokio::test]
async fn test_dropped_socket_leaves_session() {
    let (server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let (_alice, mut alice_events) = connected_client(&url, doc).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let ghost = Uuid::new_v4();
    let join = protocol::encode(&ClientMessage::Join { document_id: doc, participant_id: ghost }, Encoding::Binary)
        .unwrap();
    let Frame::Binary(bytes) = join else { panic!("binary frame expected") };
    ws.send(Message::Binary(bytes.into())).await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Presence { event: PresenceEvent::Joined, .. })).await;

    drop(ws);
    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Presence { event: PresenceEvent::Left, .. })).await {
        SyncEvent::Presence { participant_id, .. } => assert_eq!(participant_id, ghost),
        other => panic!("Expected departure, got {other:?}"),
    }

    let snapshot = server.registry().snapshot(doc).await.unwrap();
    assert_eq!(snapshot.participants.len(), 1);
}

#[tokio::test]
async fn test_json_client() {
    let (_server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let (alice, _alice_events) = connected_client(&url, doc).await;
    alice.insert(0, "shared").await.unwrap();
    settle(&alice).await;

    let mut bob = SyncClient::new(Uuid::new_v4(), doc, &url).with_encoding(Encoding::Json);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Synced { .. })).await {
        SyncEvent::Synced { revision, .. } => assert_eq!(revision, 1),
        other => panic!("Expected Synced, got {other:?}"),
    }
    assert_eq!(bob.content().await, "shared");

    bob.insert(6, " notes").await.unwrap();
    settle(&bob).await;
    assert_eq!(bob.content().await, "shared notes");
}

#[tokio::test]
async fn test_raw_json_frames() {
    let (_server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    // Sync before join is a protocol error, answered in the client's encoding
    let Frame::Text(text) = protocol::encode(&ClientMessage::Ping, Encoding::Json).unwrap() else {
        panic!("text frame expected")
    };
    ws.send(Message::Text(text.into())).await.unwrap();
    let Frame::Text(text) = protocol::encode(&ClientMessage::Sync, Encoding::Json).unwrap() else {
        panic!("text frame expected")
    };
    ws.send(Message::Text(text.into())).await.unwrap();

    let mut replies = Vec::new();
    while replies.len() < 2 {
        let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = msg {
            replies.push(protocol::decode::<ServerMessage>(&Frame::Text(text.as_str().to_owned())).unwrap());
        }
    }
    assert_eq!(replies[0], ServerMessage::Pong);
    assert!(matches!(replies[1], ServerMessage::Error { code: ErrorCode::Protocol, .. }));

    // Undecodable frames are reported, not fatal
    ws.send(Message::Text("not a message".into())).await.unwrap();
    let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = msg else { panic!("text reply expected") };
    let reply = protocol::decode::<ServerMessage>(&Frame::Text(text.as_str().to_owned())).unwrap();
    assert!(matches!(reply, ServerMessage::Error { code: ErrorCode::Protocol, .. }));
}

#[tokio::test]
async fn test_rejected_edit_triggers_resync() {
    let (server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let (alice, mut alice_events) = connected_client(&url, doc).await;
    alice.insert(0, "abc").await.unwrap();
    settle(&alice).await;

    // Submit an operation for a revision that does not exist yet
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let mallory = Uuid::new_v4();
    for msg in [
        ClientMessage::Join { document_id: doc, participant_id: mallory },
        ClientMessage::Operation {
            base_revision: 7,
            operation: quill_core::Operation::insert_at(3, 0, "x"),
        },
    ] {
        let Frame::Binary(bytes) = protocol::encode(&msg, Encoding::Binary).unwrap() else {
            panic!("binary frame expected")
        };
        ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    let mut saw_error = false;
    while !saw_error {
        let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Binary(data) = msg {
            let reply = protocol::decode::<ServerMessage>(&Frame::Binary(data.into())).unwrap();
            saw_error = matches!(reply, ServerMessage::Error { code: ErrorCode::InvalidRevision, .. });
        }
    }

    // Nobody else is affected
    let snapshot = server.registry().snapshot(doc).await.unwrap();
    assert_eq!(snapshot.content, "abc");
    assert_eq!(snapshot.revision, 1);
    assert!(alice_events
        .try_recv()
        .map(|e| !matches!(e, SyncEvent::RemoteOperation { .. }))
        .unwrap_or(true));
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let (server, url) = start_test_server().await;
    let doc = Uuid::new_v4();

    let (mut client, _events) = connected_client(&url, doc).await;
    client.ping().await.unwrap();
    client.insert(0, "x").await.unwrap();
    settle(&client).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert!(stats.messages_received >= 3);
    assert_eq!(stats.registry.operations_applied, 1);

    client.leave().await.unwrap();
    timeout(Duration::from_secs(2), async {
        while server.stats().await.active_connections > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection never closed");
}
