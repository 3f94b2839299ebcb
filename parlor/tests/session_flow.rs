// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! End-to-end session flow over the loopback transport, with the history
//! API stubbed by a minimal HTTP responder: roster seeding at connect,
//! conversation selection (mark-as-read + history seed + unread pinning),
//! and the optimistic send/confirm cycle.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

use parlor::config::SessionConfig;
use parlor::history::HistoryClient;
use parlor::liveness::LivenessConfig;
use parlor::reconnect::ReconnectPolicy;
use parlor::session::{ChatSession, SessionEvent, SessionPhase};
use parlor::state::{DeliveryStatus, Direction, Presence};
use parlor::transport::loopback::{LoopbackServer, LoopbackTransport};
use parlor::transport::AuthToken;
use parlor_proto::frame::Frame;
use parlor_proto::ids::{ServerMessageId, Timestamp, UserId};

const ROSTER_JSON: &str = r#"[
    {"user":{"id":"bob","username":"bob","nickname":"Bobby","isOnline":true},"unreadCount":2},
    {"user":{"id":"carol","username":"carol","isOnline":false},"unreadCount":0}
]"#;

const HISTORY_JSON: &str = r#"[
    {"id":1,"senderId":"me","receiverId":"bob","content":"hello","sentTime":1000},
    {"id":2,"senderId":"bob","receiverId":"me","content":"hi there","sentTime":2000}
]"#;

/// Minimal HTTP responder for the history API: routes by substring of the
/// request line and answers every connection with a canned JSON body.
async fn spawn_api_stub() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let body = if request.contains("/users/with-unread-count/") {
                    ROSTER_JSON
                } else if request.contains("/messages/between/") {
                    HISTORY_JSON
                } else if request.contains("/messages/unread/count/") {
                    "0"
                } else {
                    "[]"
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    format!("http://{addr}/api").parse().unwrap()
}

fn test_config() -> SessionConfig {
    SessionConfig {
        liveness: LivenessConfig {
            emit_interval: Duration::from_millis(50),
            max_silence: Duration::from_secs(30),
        },
        connect_timeout: Duration::from_millis(500),
        backoff: ReconnectPolicy {
            base: Duration::from_millis(50),
            growth: 1.5,
            cap: Duration::from_millis(200),
        },
        channel_capacity: 64,
        pending_retention: Duration::from_secs(60),
    }
}

async fn spawn_seeded_session() -> (ChatSession, mpsc::Receiver<SessionEvent>, LoopbackServer) {
    let api = spawn_api_stub().await;
    let (transport, server) = LoopbackTransport::pair();
    let history = HistoryClient::new(api, AuthToken::new("token"));
    let (session, events) = ChatSession::spawn(
        UserId::new("me"),
        AuthToken::new("token"),
        transport,
        Some(history),
        test_config(),
    );
    (session, events, server)
}

async fn wait_connected(events: &mut mpsc::Receiver<SessionEvent>) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::PhaseChanged(SessionPhase::Connected)) {
                return;
            }
        }
        panic!("event channel closed before connect");
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("session did not connect in time");
}

#[tokio::test]
async fn connect_seeds_roster_with_unread_counts() {
    let (session, mut events, _server) = spawn_seeded_session().await;
    session.connect();
    wait_connected(&mut events).await;

    let roster = session.state().roster();
    assert_eq!(roster.len(), 2);

    let bob = session.state().user(&UserId::new("bob")).unwrap();
    assert_eq!(bob.display_name, "Bobby");
    assert_eq!(bob.presence, Presence::Online);
    assert_eq!(bob.unread, 2);

    let carol = session.state().user(&UserId::new("carol")).unwrap();
    assert_eq!(carol.presence, Presence::Offline);
    assert_eq!(carol.unread, 0);
}

#[tokio::test]
async fn select_sends_mark_as_read_and_seeds_history() {
    let (session, mut events, mut server) = spawn_seeded_session().await;
    session.connect();
    wait_connected(&mut events).await;
    let join = server.next_non_heartbeat().await;
    assert!(matches!(join, Some(Frame::Join { .. })));

    session.select_conversation(Some(UserId::new("bob")));

    // The server is told bob's messages were read.
    let frame = tokio::time::timeout(Duration::from_secs(5), server.next_non_heartbeat())
        .await
        .expect("mark-as-read timed out");
    assert_eq!(
        frame,
        Some(Frame::MarkAsRead {
            sender_id: UserId::new("bob"),
        })
    );

    // The unread counter is pinned at zero and history is seeded.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let conversation = session.state().conversation(&UserId::new("bob"));
        if conversation.len() == 2 {
            assert_eq!(conversation[0].direction, Direction::Outgoing);
            assert_eq!(conversation[0].status, DeliveryStatus::Confirmed);
            assert_eq!(conversation[1].direction, Direction::Incoming);
            assert_eq!(conversation[1].status, DeliveryStatus::Delivered);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "history was never seeded"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.state().user(&UserId::new("bob")).unwrap().unread, 0);
    assert_eq!(session.state().selected(), Some(UserId::new("bob")));
}

#[tokio::test]
async fn unread_counter_follows_selection() {
    let (session, mut events, server) = spawn_seeded_session().await;
    session.connect();
    wait_connected(&mut events).await;

    session.select_conversation(Some(UserId::new("bob")));

    let inbound = |body: &str| Frame::Message {
        id: Some(ServerMessageId::new(50)),
        client_message_id: None,
        sender_id: UserId::new("bob"),
        receiver_id: UserId::new("me"),
        content: body.into(),
        sent_time: Some(Timestamp::from_millis(3000)),
    };

    // While bob is selected, his messages arrive already-read.
    server.push(&inbound("while selected")).await;
    wait_message_from(&mut events, "bob").await;
    assert_eq!(session.state().user(&UserId::new("bob")).unwrap().unread, 0);

    // Deselect: the next message counts.
    session.select_conversation(None);
    server.push(&inbound("after deselect")).await;
    wait_message_from(&mut events, "bob").await;
    assert_eq!(session.state().user(&UserId::new("bob")).unwrap().unread, 1);
}

#[tokio::test]
async fn server_unread_count_is_authoritative_unless_selected() {
    let (session, mut events, server) = spawn_seeded_session().await;
    session.connect();
    wait_connected(&mut events).await;

    server
        .push(&Frame::UnreadCount {
            sender_id: UserId::new("carol"),
            unread_count: 7,
        })
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if session.state().user(&UserId::new("carol")).unwrap().unread == 7 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "unread never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The selected conversation ignores stale server counts.
    session.select_conversation(Some(UserId::new("carol")));
    server
        .push(&Frame::UnreadCount {
            sender_id: UserId::new("carol"),
            unread_count: 9,
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state().user(&UserId::new("carol")).unwrap().unread, 0);
}

#[tokio::test]
async fn read_receipt_notifies_without_touching_state() {
    let (session, mut events, server) = spawn_seeded_session().await;
    session.connect();
    wait_connected(&mut events).await;
    let roster_before = session.state().roster();

    server
        .push(&Frame::ReadReceipt {
            reader_id: UserId::new("bob"),
            timestamp: Timestamp::from_millis(123_456),
        })
        .await;

    let wait = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::ReadReceipt { reader, up_to } = event {
                assert_eq!(reader, UserId::new("bob"));
                assert_eq!(up_to, Timestamp::from_millis(123_456));
                return;
            }
        }
        panic!("event channel closed");
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("read receipt never surfaced");

    assert_eq!(session.state().roster(), roster_before);
}

async fn wait_message_from(events: &mut mpsc::Receiver<SessionEvent>, from: &str) {
    let expected = UserId::new(from);
    let wait = async {
        while let Some(event) = events.recv().await {
            if matches!(&event, SessionEvent::MessageReceived { from, .. } if *from == expected) {
                return;
            }
        }
        panic!("event channel closed");
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("message event never arrived");
}
