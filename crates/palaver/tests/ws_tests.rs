//! End-to-end WebSocket scenarios against a bound server: upgrade gating,
//! the action table, presence fan-out, and deadline-driven teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use palaver::api::{AppState, create_router};
use palaver::auth::AuthState;
use palaver::config::{AuthConfig, WsConfig};
use palaver::social::MemoryDirectory;
use palaver::ws::{Broker, EventKind, InProcessBroker, OutboundMessage};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    directory: Arc<MemoryDirectory>,
    auth: AuthState,
}

async fn start_server(ws: WsConfig) -> TestServer {
    let auth = AuthState::new(&AuthConfig::default());
    let broker: Arc<dyn Broker> = Arc::new(InProcessBroker::new());
    let directory = Arc::new(MemoryDirectory::new());

    let state = AppState::new(
        broker,
        directory.clone(),
        directory.clone(),
        directory.clone(),
        auth.clone(),
        ws,
    );

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        directory,
        auth,
    }
}

impl TestServer {
    fn ws_url(&self, principal: &str) -> String {
        let token = self.auth.issue_token(principal, 60).unwrap();
        format!("ws://{}/ws?token={token}", self.addr)
    }

    async fn connect(&self, principal: &str) -> WsClient {
        let (client, _response) = connect_async(self.ws_url(principal))
            .await
            .expect("upgrade failed");
        client
    }
}

async fn send_action(client: &mut WsClient, action: &str, room: &str, message: Option<&str>) {
    let frame = json!({"action": action, "room": room, "message": message}).to_string();
    client.send(Message::Text(frame.into())).await.unwrap();
}

/// Next text frame, split into envelopes (the writer coalesces with
/// newlines).
async fn recv_envelopes(client: &mut WsClient) -> Vec<Value> {
    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read failed");
        match frame {
            Message::Text(text) => {
                return text
                    .as_str()
                    .lines()
                    .map(|line| serde_json::from_str(line).unwrap())
                    .collect();
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that nothing but liveness traffic arrives for `window`.
async fn expect_silence(client: &mut WsClient, window: Duration) {
    let outcome = timeout(window, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => break other,
            }
        }
    })
    .await;
    assert!(outcome.is_err(), "expected silence, got {outcome:?}");
}

/// Give inbound actions time to travel read loop -> hub -> room task.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_upgrade_requires_a_valid_token() {
    let server = start_server(WsConfig::default()).await;

    let err = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect_err("upgrade should be rejected");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_upgrade_rejects_foreign_origin() {
    let server = start_server(WsConfig::default()).await;

    let mut request = server.ws_url("alice").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://evil.example".parse().unwrap());

    let err = connect_async(request)
        .await
        .expect_err("upgrade should be rejected");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_upgrade_accepts_the_configured_origin() {
    let server = start_server(WsConfig::default()).await;

    let mut request = server.ws_url("alice").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://localhost:3000".parse().unwrap());

    connect_async(request).await.expect("upgrade should succeed");
}

#[tokio::test]
async fn test_join_then_message_reaches_both_members() {
    let server = start_server(WsConfig::default()).await;
    server.directory.add_channel("general", &["alice", "bob"]);

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    send_action(&mut alice, "joinChannel", "general", None).await;
    send_action(&mut bob, "joinChannel", "general", None).await;
    settle().await;

    let message = OutboundMessage::new(EventKind::NewMessage, json!({"id": "m1"}));
    server.state.hub.publish_to_room("general", &message).await;

    for client in [&mut alice, &mut bob] {
        let envelopes = recv_envelopes(client).await;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0]["action"], "new_message");
        assert_eq!(envelopes[0]["data"]["id"], "m1");
    }

    // exactly once
    expect_silence(&mut alice, Duration::from_millis(200)).await;
    expect_silence(&mut bob, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_leave_room_stops_delivery() {
    let server = start_server(WsConfig::default()).await;
    server.directory.add_channel("general", &["alice", "bob"]);

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    send_action(&mut alice, "joinChannel", "general", None).await;
    send_action(&mut bob, "joinChannel", "general", None).await;
    settle().await;

    send_action(&mut alice, "leaveRoom", "general", None).await;
    settle().await;

    let message = OutboundMessage::new(EventKind::NewMessage, json!({"id": "m2"}));
    server.state.hub.publish_to_room("general", &message).await;

    let envelopes = recv_envelopes(&mut bob).await;
    assert_eq!(envelopes[0]["action"], "new_message");
    expect_silence(&mut alice, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_unauthorized_join_is_silent() {
    let server = start_server(WsConfig::default()).await;
    server.directory.add_channel("secret", &["bob"]);

    let mut bob = server.connect("bob").await;
    send_action(&mut bob, "joinChannel", "secret", None).await;

    let mut alice = server.connect("alice").await;
    send_action(&mut alice, "joinChannel", "secret", None).await;
    settle().await;

    let message = OutboundMessage::new(EventKind::NewMessage, json!({"id": "m3"}));
    server.state.hub.publish_to_room("secret", &message).await;

    let envelopes = recv_envelopes(&mut bob).await;
    assert_eq!(envelopes[0]["action"], "new_message");

    // no join happened and no frame of any kind was sent to alice
    expect_silence(&mut alice, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_typing_indicator_round_trip() {
    let server = start_server(WsConfig::default()).await;
    server.directory.add_channel("general", &["alice", "bob"]);

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    send_action(&mut alice, "joinChannel", "general", None).await;
    send_action(&mut bob, "joinChannel", "general", None).await;
    settle().await;

    send_action(&mut alice, "startTyping", "general", Some("alice")).await;
    let envelopes = recv_envelopes(&mut bob).await;
    assert_eq!(envelopes[0]["action"], "addToTyping");
    assert_eq!(envelopes[0]["data"], "alice");

    send_action(&mut alice, "stopTyping", "general", Some("alice")).await;
    let envelopes = recv_envelopes(&mut bob).await;
    assert_eq!(envelopes[0]["action"], "removeFromTyping");
}

#[tokio::test]
async fn test_presence_fans_out_to_friends_only() {
    let server = start_server(WsConfig::default()).await;
    server.directory.add_friends("alice", &["bob"]);

    // personal rooms: bob should hear about alice, carol should not
    let mut bob = server.connect("bob").await;
    send_action(&mut bob, "joinUser", "", None).await;
    let mut carol = server.connect("carol").await;
    send_action(&mut carol, "joinUser", "", None).await;
    settle().await;

    let mut alice = server.connect("alice").await;
    send_action(&mut alice, "toggleOnline", "", None).await;

    let envelopes = recv_envelopes(&mut bob).await;
    assert_eq!(envelopes[0]["action"], "toggle_online");
    assert_eq!(envelopes[0]["data"], "alice");
    assert_eq!(server.directory.is_online("alice"), Some(true));

    expect_silence(&mut carol, Duration::from_millis(300)).await;

    send_action(&mut alice, "toggleOffline", "", None).await;
    let envelopes = recv_envelopes(&mut bob).await;
    assert_eq!(envelopes[0]["action"], "toggle_offline");
    assert_eq!(server.directory.is_online("alice"), Some(false));
}

#[tokio::test]
async fn test_request_count_lands_in_the_personal_room() {
    let server = start_server(WsConfig::default()).await;
    server.directory.set_request_count("alice", 3);

    let mut alice = server.connect("alice").await;
    send_action(&mut alice, "joinUser", "", None).await;
    settle().await;

    send_action(&mut alice, "getRequestCount", "", None).await;
    let envelopes = recv_envelopes(&mut alice).await;
    assert_eq!(envelopes[0]["action"], "requestCount");
    assert_eq!(envelopes[0]["data"], 3);
}

#[tokio::test]
async fn test_leave_guild_records_last_seen() {
    let server = start_server(WsConfig::default()).await;
    server.directory.add_guild("guild-1", &["alice"]);

    let mut alice = server.connect("alice").await;
    send_action(&mut alice, "joinGuild", "guild-1", None).await;
    settle().await;
    assert!(server.directory.last_seen("alice", "guild-1").is_none());

    send_action(&mut alice, "leaveGuild", "guild-1", None).await;
    settle().await;
    assert!(server.directory.last_seen("alice", "guild-1").is_some());
}

#[tokio::test]
async fn test_malformed_frames_leave_the_connection_open() {
    let server = start_server(WsConfig::default()).await;
    server.directory.add_channel("general", &["alice"]);

    let mut alice = server.connect("alice").await;
    alice
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    alice
        .send(Message::Text(r#"{"action":"selfDestruct","room":"x"}"#.into()))
        .await
        .unwrap();

    // the connection still works
    send_action(&mut alice, "joinChannel", "general", None).await;
    settle().await;

    let message = OutboundMessage::new(EventKind::NewMessage, json!({"id": "m4"}));
    server.state.hub.publish_to_room("general", &message).await;
    let envelopes = recv_envelopes(&mut alice).await;
    assert_eq!(envelopes[0]["action"], "new_message");
}

#[tokio::test]
async fn test_silent_connection_is_reaped_after_the_read_deadline() {
    let ws = WsConfig {
        read_deadline_secs: 2,
        heartbeat_secs: 1,
        ..WsConfig::default()
    };
    let server = start_server(ws).await;

    // connect and then go completely quiet: no frames, no pong replies
    let _client = server.connect("alice").await;
    settle().await;
    assert_eq!(server.state.hub.connection_count().await, 1);

    // reaped within heartbeat interval + read deadline
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        if server.state.hub.connection_count().await == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection was not torn down in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_responsive_connection_survives_the_read_deadline() {
    let ws = WsConfig {
        read_deadline_secs: 2,
        heartbeat_secs: 1,
        ..WsConfig::default()
    };
    let server = start_server(ws).await;

    let mut client = server.connect("alice").await;
    settle().await;

    // keep reading: the client answers the server's pings while polling,
    // and those pongs keep resetting the read deadline
    let outcome = timeout(Duration::from_secs(3), async {
        loop {
            match client.next().await {
                Some(Ok(_)) => continue,
                other => break other,
            }
        }
    })
    .await;
    assert!(outcome.is_err(), "connection ended early: {outcome:?}");
    assert_eq!(server.state.hub.connection_count().await, 1);
}
