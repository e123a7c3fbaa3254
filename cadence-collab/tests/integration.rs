//! End-to-end tests: a real sequencer server and real WebSocket sessions.

use cadence_collab::broadcast::USER_COLORS;
use cadence_collab::server::{SequencerServer, ServerConfig};
use cadence_collab::session::{SessionConfig, SessionEvent, SyncSession};
use cadence_collab::transport::WebSocketTransport;
use cadence_core::{PropertyKey, SharedList, SharedObject, StructureId, Summary, UpdateCoordinator};
use tokio::time::{timeout, Duration};

type Session = SyncSession<WebSocketTransport>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Root list `[a, b]` of objects with `x = 0`.
fn document() -> Summary {
    let mut root = SharedList::with_id(StructureId::from("root"));
    for id in ["a", "b"] {
        let mut shape = SharedObject::with_id(StructureId::from(id));
        shape.property("x", 0i64);
        root.add(Box::new(shape));
    }
    UpdateCoordinator::new(Box::new(root)).summary()
}

/// Start a server on a free port, return its URL.
async fn start_test_server(summary_threshold: usize) -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        summary_threshold,
        initial_document: document(),
    };
    let server = SequencerServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn join(url: &str, name: &str) -> Session {
    let config = SessionConfig {
        document_id: "board".into(),
        user_name: name.into(),
        ..SessionConfig::default()
    };
    timeout(Duration::from_secs(2), Session::connect_url(url, config))
        .await
        .expect("join within timeout")
        .expect("join succeeds")
}

async fn wait_for(session: &mut Session, mut pred: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = session.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

/// Drive the session until it has applied `sequence` and has nothing in
/// flight.
async fn settle(session: &mut Session, sequence: u64) {
    timeout(Duration::from_secs(2), async {
        while session.last_sequence() < sequence || session.coordinator().has_unacknowledged() {
            session.next_event().await;
        }
    })
    .await
    .expect("session settles within timeout");
}

fn x() -> PropertyKey<i64> {
    PropertyKey::new("x")
}

fn id(s: &str) -> StructureId {
    StructureId::from(s)
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server(1000).await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_presence_on_join_and_leave() {
    let url = start_test_server(1000).await;
    let mut alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;

    let names: Vec<_> = bob.users().map(|u| u.name.clone()).collect();
    assert_eq!(names, vec!["Alice".to_string()]);

    match wait_for(&mut alice, |e| matches!(e, SessionEvent::UserJoined(_))).await {
        SessionEvent::UserJoined(user) => {
            assert_eq!(user.name, "Bob");
            assert_eq!(user.client_id, bob.client_id());
            assert_eq!(user.color, USER_COLORS[1]);
        }
        other => panic!("Expected UserJoined, got {other:?}"),
    }

    let bob_id = bob.client_id();
    drop(bob);
    match wait_for(&mut alice, |e| matches!(e, SessionEvent::UserLeft(_))).await {
        SessionEvent::UserLeft(user) => assert_eq!(user.client_id, bob_id),
        other => panic!("Expected UserLeft, got {other:?}"),
    }
    assert_eq!(alice.users().count(), 0);
}

#[tokio::test]
async fn test_edit_propagates_and_is_acked() {
    let url = start_test_server(1000).await;
    let mut alice = join(&url, "Alice").await;
    let mut bob = join(&url, "Bob").await;

    alice.coordinator_mut().set(&id("a"), &x(), 5).unwrap();
    alice.flush().await.unwrap();

    let ack = wait_for(&mut alice, |e| matches!(e, SessionEvent::Acknowledged { .. })).await;
    assert_eq!(ack, SessionEvent::Acknowledged { version: 1, sequence_number: 1 });
    assert!(!alice.coordinator().has_unacknowledged());

    let remote = wait_for(&mut bob, |e| matches!(e, SessionEvent::RemoteOps { .. })).await;
    assert_eq!(
        remote,
        SessionEvent::RemoteOps { client_id: alice.client_id(), sequence_number: 1 }
    );
    assert_eq!(bob.coordinator().value(&id("a"), &x()).unwrap(), 5);
}

#[tokio::test]
async fn test_concurrent_writes_converge() {
    let url = start_test_server(1000).await;
    let mut alice = join(&url, "Alice").await;
    let mut bob = join(&url, "Bob").await;

    alice.coordinator_mut().set(&id("a"), &x(), 1).unwrap();
    bob.coordinator_mut().set(&id("a"), &x(), 2).unwrap();
    alice.flush().await.unwrap();
    bob.flush().await.unwrap();

    settle(&mut alice, 2).await;
    settle(&mut bob, 2).await;

    let a = alice.coordinator().value(&id("a"), &x()).unwrap();
    let b = bob.coordinator().value(&id("a"), &x()).unwrap();
    assert_eq!(a, b);
    assert_eq!(alice.coordinator().summary(), bob.coordinator().summary());
}

#[tokio::test]
async fn test_undo_reaches_peer() {
    let url = start_test_server(1000).await;
    let mut alice = join(&url, "Alice").await;
    let mut bob = join(&url, "Bob").await;
    let root = id("root");

    alice.coordinator_mut().remove_item(&root, &id("a")).unwrap();
    alice.coordinator_mut().commit();
    alice.flush().await.unwrap();
    settle(&mut alice, 1).await;
    settle(&mut bob, 1).await;
    assert_eq!(bob.coordinator().list(&root).unwrap().ids(), &[id("b")]);

    assert!(alice.coordinator_mut().undo());
    alice.flush().await.unwrap();
    settle(&mut alice, 2).await;
    settle(&mut bob, 2).await;
    assert_eq!(bob.coordinator().list(&root).unwrap().ids(), &[id("a"), id("b")]);
    assert_eq!(alice.coordinator().summary(), bob.coordinator().summary());
}

#[tokio::test]
async fn test_late_joiner_bootstraps() {
    let url = start_test_server(1000).await;
    let mut alice = join(&url, "Alice").await;

    let mut extra = SharedObject::with_id(id("c"));
    extra.property("x", 3i64);
    alice.coordinator_mut().add_item(&id("root"), Box::new(extra)).unwrap();
    alice.coordinator_mut().set(&id("b"), &x(), 8).unwrap();
    alice.flush().await.unwrap();
    settle(&mut alice, 1).await;

    let carol = join(&url, "Carol").await;
    assert_eq!(carol.last_sequence(), 1);
    assert_eq!(carol.coordinator().summary(), alice.coordinator().summary());
    assert_eq!(carol.coordinator().value(&id("c"), &x()).unwrap(), 3);
}

#[tokio::test]
async fn test_summary_request_truncates_log() {
    let url = start_test_server(2).await;
    let mut alice = join(&url, "Alice").await;

    for (value, sequence) in [(1, 1), (2, 2), (3, 3)] {
        alice.coordinator_mut().set(&id("a"), &x(), value).unwrap();
        alice.flush().await.unwrap();
        settle(&mut alice, sequence).await;
    }

    let event = wait_for(&mut alice, |e| matches!(e, SessionEvent::SummaryRequested { .. })).await;
    assert_eq!(event, SessionEvent::SummaryRequested { provided: true });

    // Let the server store the summary.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let carol = join(&url, "Carol").await;
    assert_eq!(carol.last_sequence(), 3);
    assert_eq!(carol.coordinator().value(&id("a"), &x()).unwrap(), 3);
    assert_eq!(carol.coordinator().summary(), alice.coordinator().summary());
}

#[tokio::test]
async fn test_connect_fails_without_server() {
    let port = free_port().await;
    let result = Session::connect_url(&format!("ws://127.0.0.1:{port}"), SessionConfig::default()).await;
    assert!(result.is_err());
}
