//! Integration tests for the chatgate server, handler, and full connection
//! flow over real WebSockets.

use std::sync::Arc;
use std::time::Duration;

use chatgate::prelude::*;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Helpers
// =========================================================================

const ISSUER: &str = "chatapp";
const SECRET: &[u8] = b"integration-test-secret";
const ENDPOINT: &str = "/hubs/chat";

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    addr: String,
    gateway: ConnectionGateway,
    router: EventRouter<Arc<InMemoryHistory>>,
    history: Arc<InMemoryHistory>,
    shutdown: ShutdownHandle,
    task: tokio::task::JoinHandle<Result<(), GatewayError>>,
}

fn auth_config() -> AuthConfig {
    AuthConfig::new(ISSUER, SECRET)
}

/// Starts a server on a random port.
async fn start_server() -> TestServer {
    start_with(|builder| builder).await
}

async fn start_with(
    configure: impl FnOnce(GatewayServerBuilder) -> GatewayServerBuilder,
) -> TestServer {
    let history = Arc::new(InMemoryHistory::new());
    let directory = StaticDirectory::new().with_user("alice", "Alice Liddell");
    let server = configure(GatewayServer::builder().bind("127.0.0.1:0"))
        .build(auth_config(), directory, Arc::clone(&history))
        .await
        .expect("server should build");

    let addr = server
        .local_addr()
        .expect("should have local addr")
        .to_string();
    let gateway = server.gateway();
    let router = server.router();
    let shutdown = server.shutdown_handle();

    let task = tokio::spawn(server.run());

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    TestServer {
        addr,
        gateway,
        router,
        history,
        shutdown,
        task,
    }
}

fn token(user: &str, audience: Audience) -> String {
    TokenIssuer::new(auth_config())
        .unwrap()
        .issue(&UserId::new(user), audience, Duration::from_secs(3600))
        .unwrap()
}

async fn connect_with_header(addr: &str, token: &str) -> ClientWs {
    let mut request = format!("ws://{addr}{ENDPOINT}")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("should connect");
    ws
}

async fn connect_bare(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{ENDPOINT}"))
        .await
        .expect("should connect");
    ws
}

async fn send(ws: &mut ClientWs, msg: ClientMessage) {
    let bytes = serde_json::to_vec(&Envelope::new(0, 0, msg)).expect("encode");
    ws.send(Message::Binary(bytes.into())).await.expect("send");
}

/// Next server frame, skipping pings.
async fn recv_envelope(ws: &mut ClientWs) -> Envelope<ServerMessage> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("server should answer in time")
            .expect("stream should be open")
            .expect("frame should be readable");
        match msg {
            Message::Binary(_) | Message::Text(_) => {
                return serde_json::from_slice(&msg.into_data()).expect("decode");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a data frame, got {other:?}"),
        }
    }
}

async fn recv(ws: &mut ClientWs) -> ServerMessage {
    recv_envelope(ws).await.payload
}

async fn recv_event(ws: &mut ClientWs) -> ChatEvent {
    match recv(ws).await {
        ServerMessage::Event { event } => event,
        other => panic!("expected Event, got {other:?}"),
    }
}

/// Asserts the server closes the socket next.
async fn expect_close(ws: &mut ClientWs) -> Option<String> {
    let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("server should close in time");
    match next {
        Some(Ok(Message::Close(frame))) => frame.map(|f| f.reason.to_string()),
        None | Some(Err(_)) => None,
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
}

/// Connects and authenticates through the upgrade header.
async fn login(addr: &str, user: &str, audience: Audience) -> ClientWs {
    let mut ws = connect_with_header(addr, &token(user, audience)).await;
    match recv(&mut ws).await {
        ServerMessage::Authenticated { .. } => ws,
        other => panic!("expected Authenticated, got {other:?}"),
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Reads until the server closes the TCP stream. Never writes, so a close
/// frame from the server goes unanswered.
async fn expect_eof(tcp: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match tcp.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await
    .expect("server should drop the socket in time");
}

/// Performs the WebSocket upgrade by hand, leaving the socket raw.
async fn raw_upgrade(addr: &str, token: &str) -> TcpStream {
    let mut tcp = TcpStream::connect(addr).await.expect("tcp connect");
    let request = format!(
        "GET {ENDPOINT} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Authorization: Bearer {token}\r\n\
         \r\n"
    );
    tcp.write_all(request.as_bytes()).await.expect("write upgrade");
    tcp
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should hold in time");
}

// =========================================================================
// Authentication
// =========================================================================

#[tokio::test]
async fn test_alice_web_connects_receives_event_and_is_removed() {
    let server = start_server().await;
    let mut ws = connect_with_header(&server.addr, &token("alice", Audience::Web)).await;

    let ack = recv_envelope(&mut ws).await;
    assert_eq!(ack.seq, 0);
    match ack.payload {
        ServerMessage::Authenticated {
            user_id,
            audience,
            display_name,
            ..
        } => {
            assert_eq!(user_id, UserId::new("alice"));
            assert_eq!(audience, Audience::Web);
            assert_eq!(display_name.as_deref(), Some("Alice Liddell"));
        }
        other => panic!("expected Authenticated, got {other:?}"),
    }

    let registry = Arc::clone(server.gateway.registry());
    let listed = registry.connections_for(&UserId::new("alice"));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].audience(), Audience::Web);
    drop(listed);

    let event = ChatEvent::DirectMessage {
        from: UserId::new("system"),
        to: UserId::new("alice"),
        body: "welcome".into(),
        sent_at: 0,
    };
    assert_eq!(server.router.deliver(event.clone(), &UserId::new("alice")), 1);
    assert_eq!(recv_event(&mut ws).await, event);

    ws.send(Message::Close(None)).await.unwrap();
    wait_until(|| registry.is_empty()).await;
}

#[tokio::test]
async fn test_unknown_user_gets_bare_profile() {
    let server = start_server().await;
    let mut ws = connect_with_header(&server.addr, &token("bob", Audience::Mobile)).await;

    match recv(&mut ws).await {
        ServerMessage::Authenticated { display_name, .. } => {
            assert_eq!(display_name, None);
        }
        other => panic!("expected Authenticated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_access_token_query_parameter_authenticates() {
    let server = start_server().await;
    let url = format!(
        "ws://{}{ENDPOINT}?access_token={}",
        server.addr,
        token("alice", Audience::Mobile)
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    match recv(&mut ws).await {
        ServerMessage::Authenticated { audience, .. } => {
            assert_eq!(audience, Audience::Mobile);
        }
        other => panic!("expected Authenticated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_authenticate_as_first_frame() {
    let server = start_server().await;
    let mut ws = connect_bare(&server.addr).await;

    send(
        &mut ws,
        ClientMessage::Authenticate {
            token: token("alice", Audience::Web),
        },
    )
    .await;

    match recv(&mut ws).await {
        ServerMessage::Authenticated { user_id, .. } => {
            assert_eq!(user_id, UserId::new("alice"));
        }
        other => panic!("expected Authenticated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejections_carry_specific_reason() {
    let server = start_server().await;
    let now = unix_now();

    let wrong_secret = TokenIssuer::new(AuthConfig::new(ISSUER, b"not-the-secret"))
        .unwrap()
        .issue(&UserId::new("alice"), Audience::Web, Duration::from_secs(60))
        .unwrap();
    let wrong_issuer = TokenIssuer::new(AuthConfig::new("someone-else", SECRET))
        .unwrap()
        .issue(&UserId::new("alice"), Audience::Web, Duration::from_secs(60))
        .unwrap();
    let issuer = TokenIssuer::new(auth_config()).unwrap();
    let wrong_audience = {
        let mut claims =
            issuer.claims_for(&UserId::new("alice"), Audience::Web, now, now + 60);
        claims.aud = "desktop".into();
        issuer.sign(&claims).unwrap()
    };
    let expired = {
        let claims = issuer.claims_for(
            &UserId::new("alice"),
            Audience::Web,
            now - 120,
            now - 60,
        );
        issuer.sign(&claims).unwrap()
    };

    let cases = [
        (wrong_secret, RejectReason::InvalidSignature),
        (wrong_issuer, RejectReason::InvalidIssuer),
        (wrong_audience, RejectReason::InvalidAudience),
        (expired, RejectReason::Expired),
        ("definitely.not.ajwt".to_string(), RejectReason::Malformed),
    ];

    for (token, expected) in cases {
        let mut ws = connect_with_header(&server.addr, &token).await;
        match recv(&mut ws).await {
            ServerMessage::Rejected { reason } => assert_eq!(reason, expected),
            other => panic!("expected Rejected({expected:?}), got {other:?}"),
        }
        let close_reason = expect_close(&mut ws).await;
        assert_eq!(close_reason, Some(expected.to_string()));
    }

    assert!(server.gateway.registry().is_empty());
}

#[tokio::test]
async fn test_non_authenticate_first_frame_is_missing_token() {
    let server = start_server().await;
    let mut ws = connect_bare(&server.addr).await;

    send(&mut ws, ClientMessage::Heartbeat { client_time: 1 }).await;

    match recv(&mut ws).await {
        ServerMessage::Rejected { reason } => {
            assert_eq!(reason, RejectReason::MissingToken);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_silent_client_is_rejected_after_handshake_timeout() {
    let server = start_with(|b| b.handshake_timeout(Duration::from_millis(100))).await;
    let mut ws = connect_bare(&server.addr).await;

    match recv(&mut ws).await {
        ServerMessage::Rejected { reason } => {
            assert_eq!(reason, RejectReason::MissingToken);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stalled_upgrade_is_dropped_after_handshake_timeout() {
    let server = start_with(|b| b.handshake_timeout(Duration::from_millis(100))).await;
    let mut tcp = TcpStream::connect(&server.addr).await.expect("tcp connect");

    expect_eof(&mut tcp).await;
}

#[tokio::test]
async fn test_unknown_path_is_refused() {
    let server = start_server().await;

    let result =
        tokio_tungstenite::connect_async(format!("ws://{}/elsewhere", server.addr))
            .await;

    assert!(result.is_err(), "upgrade on another path should fail");
}

// =========================================================================
// Messaging
// =========================================================================

#[tokio::test]
async fn test_heartbeat_response() {
    let server = start_server().await;
    let mut ws = login(&server.addr, "alice", Audience::Web).await;

    send(&mut ws, ClientMessage::Heartbeat { client_time: 12345 }).await;

    let env = recv_envelope(&mut ws).await;
    assert_eq!(env.seq, 1);
    match env.payload {
        ServerMessage::HeartbeatAck { client_time, .. } => {
            assert_eq!(client_time, 12345);
        }
        other => panic!("expected HeartbeatAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_direct_message_reaches_web_and_mobile() {
    let server = start_server().await;
    let mut alice_web = login(&server.addr, "alice", Audience::Web).await;
    let mut alice_mobile = login(&server.addr, "alice", Audience::Mobile).await;
    let mut bob = login(&server.addr, "bob", Audience::Web).await;

    send(
        &mut bob,
        ClientMessage::SendDirect {
            to: UserId::new("alice"),
            body: "hi alice".into(),
        },
    )
    .await;

    for ws in [&mut alice_web, &mut alice_mobile] {
        match recv_event(ws).await {
            ChatEvent::DirectMessage { from, to, body, .. } => {
                assert_eq!(from, UserId::new("bob"));
                assert_eq!(to, UserId::new("alice"));
                assert_eq!(body, "hi alice");
            }
            other => panic!("expected DirectMessage, got {other:?}"),
        }
    }

    // Closing one device leaves the other registered.
    alice_web.send(Message::Close(None)).await.unwrap();
    let registry = Arc::clone(server.gateway.registry());
    wait_until(|| registry.connections_for(&UserId::new("alice")).len() == 1).await;
    assert_eq!(
        registry.connections_for(&UserId::new("alice"))[0].audience(),
        Audience::Mobile
    );
}

#[tokio::test]
async fn test_direct_message_echoes_to_senders_other_devices() {
    let server = start_server().await;
    let mut alice_web = login(&server.addr, "alice", Audience::Web).await;
    let mut alice_mobile = login(&server.addr, "alice", Audience::Mobile).await;
    let mut bob = login(&server.addr, "bob", Audience::Web).await;

    send(
        &mut alice_web,
        ClientMessage::SendDirect {
            to: UserId::new("bob"),
            body: "sent from the browser".into(),
        },
    )
    .await;

    let to_bob = recv_event(&mut bob).await;
    let echoed = recv_event(&mut alice_mobile).await;
    assert_eq!(to_bob, echoed);

    // The sending connection gets no copy; its next frame is the heartbeat ack.
    send(&mut alice_web, ClientMessage::Heartbeat { client_time: 9 }).await;
    assert!(matches!(
        recv(&mut alice_web).await,
        ServerMessage::HeartbeatAck { client_time: 9, .. }
    ));
}

#[tokio::test]
async fn test_conversation_join_send_and_leave() {
    let server = start_server().await;
    let mut alice = login(&server.addr, "alice", Audience::Web).await;
    let mut bob = login(&server.addr, "bob", Audience::Mobile).await;
    let conversation_id = ConversationId(1);

    send(&mut alice, ClientMessage::JoinConversation { conversation_id }).await;
    assert_eq!(
        recv_event(&mut alice).await,
        ChatEvent::UserJoined {
            conversation_id,
            user_id: UserId::new("alice"),
        }
    );

    send(&mut bob, ClientMessage::JoinConversation { conversation_id }).await;
    let bob_joined = ChatEvent::UserJoined {
        conversation_id,
        user_id: UserId::new("bob"),
    };
    assert_eq!(recv_event(&mut alice).await, bob_joined);
    assert_eq!(recv_event(&mut bob).await, bob_joined);

    send(
        &mut bob,
        ClientMessage::SendMessage {
            conversation_id,
            body: "hello all".into(),
        },
    )
    .await;
    for ws in [&mut alice, &mut bob] {
        match recv_event(ws).await {
            ChatEvent::MessageSent { from, body, .. } => {
                assert_eq!(from, UserId::new("bob"));
                assert_eq!(body, "hello all");
            }
            other => panic!("expected MessageSent, got {other:?}"),
        }
    }

    send(&mut bob, ClientMessage::LeaveConversation { conversation_id }).await;
    assert_eq!(
        recv_event(&mut alice).await,
        ChatEvent::UserLeft {
            conversation_id,
            user_id: UserId::new("bob"),
        }
    );

    // join, join, message, leave
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.history.len().await < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("history should catch up");
    let records = server.history.records().await;
    assert!(records.iter().any(|r| matches!(
        &r.event,
        ChatEvent::MessageSent { body, .. } if body == "hello all"
    ) && r.delivered_to == 2));
}

#[tokio::test]
async fn test_send_to_conversation_without_joining_is_forbidden() {
    let server = start_server().await;
    let mut alice = login(&server.addr, "alice", Audience::Web).await;

    send(
        &mut alice,
        ClientMessage::SendMessage {
            conversation_id: ConversationId(42),
            body: "let me in".into(),
        },
    )
    .await;

    match recv(&mut alice).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, 403),
        other => panic!("expected Error 403, got {other:?}"),
    }
}

#[tokio::test]
async fn test_garbage_frame_gets_error_and_connection_survives() {
    let server = start_server().await;
    let mut alice = login(&server.addr, "alice", Audience::Web).await;

    alice
        .send(Message::Binary(b"not json".to_vec().into()))
        .await
        .unwrap();
    match recv(&mut alice).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, 400),
        other => panic!("expected Error 400, got {other:?}"),
    }

    send(&mut alice, ClientMessage::Heartbeat { client_time: 3 }).await;
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::HeartbeatAck { client_time: 3, .. }
    ));
}

// =========================================================================
// Disconnects
// =========================================================================

#[tokio::test]
async fn test_disconnect_message_deregisters() {
    let server = start_server().await;
    let mut alice = login(&server.addr, "alice", Audience::Web).await;

    send(
        &mut alice,
        ClientMessage::Disconnect {
            reason: "logging out".into(),
        },
    )
    .await;

    expect_close(&mut alice).await;
    let registry = Arc::clone(server.gateway.registry());
    wait_until(|| registry.is_empty()).await;
}

#[tokio::test]
async fn test_disconnect_tells_conversation_members() {
    let server = start_server().await;
    let mut alice = login(&server.addr, "alice", Audience::Web).await;
    let mut bob = login(&server.addr, "bob", Audience::Web).await;
    let conversation_id = ConversationId(5);

    send(&mut alice, ClientMessage::JoinConversation { conversation_id }).await;
    recv_event(&mut alice).await;
    send(&mut bob, ClientMessage::JoinConversation { conversation_id }).await;
    recv_event(&mut bob).await;
    recv_event(&mut alice).await;

    bob.send(Message::Close(None)).await.unwrap();

    assert_eq!(
        recv_event(&mut alice).await,
        ChatEvent::UserLeft {
            conversation_id,
            user_id: UserId::new("bob"),
        }
    );
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let server = start_with(|b| b.idle_timeout(Duration::from_millis(100))).await;
    let mut alice = login(&server.addr, "alice", Audience::Web).await;

    expect_close(&mut alice).await;
    let registry = Arc::clone(server.gateway.registry());
    wait_until(|| registry.is_empty()).await;
}

#[tokio::test]
async fn test_evict_user_sends_disconnect_and_closes() {
    let server = start_server().await;
    let mut web = login(&server.addr, "alice", Audience::Web).await;
    let mut mobile = login(&server.addr, "alice", Audience::Mobile).await;
    let _bob = login(&server.addr, "bob", Audience::Web).await;

    let evicted = server
        .gateway
        .evict_user(&UserId::new("alice"), "token revoked")
        .unwrap();
    assert_eq!(evicted, 2);

    for ws in [&mut web, &mut mobile] {
        match recv(ws).await {
            ServerMessage::Disconnect { reason } => {
                assert_eq!(reason, "token revoked");
            }
            other => panic!("expected Disconnect, got {other:?}"),
        }
        assert_eq!(expect_close(ws).await.as_deref(), Some("token revoked"));
    }

    let registry = server.gateway.registry();
    assert!(!registry.is_online(&UserId::new("alice")));
    assert!(registry.is_online(&UserId::new("bob")));
}

#[tokio::test]
async fn test_evicted_client_that_ignores_close_is_dropped() {
    let server = start_server().await;
    let mut tcp = raw_upgrade(&server.addr, &token("alice", Audience::Web)).await;
    let registry = Arc::clone(server.gateway.registry());
    wait_until(|| registry.len() == 1).await;

    server
        .gateway
        .evict_user(&UserId::new("alice"), "token revoked")
        .unwrap();

    // Idle timeout is 60s; the socket must go well before that.
    expect_eof(&mut tcp).await;
}

#[tokio::test]
async fn test_shutdown_closes_connections_and_stops_run() {
    let server = start_server().await;
    let mut alice = login(&server.addr, "alice", Audience::Web).await;

    server.shutdown.shutdown();

    match recv(&mut alice).await {
        ServerMessage::Disconnect { reason } => {
            assert_eq!(reason, "server shutting down");
        }
        other => panic!("expected Disconnect, got {other:?}"),
    }
    let result = tokio::time::timeout(Duration::from_secs(2), server.task)
        .await
        .expect("run should return")
        .expect("task should not panic");
    assert!(result.is_ok());
    assert!(server.gateway.registry().is_empty());
}

#[tokio::test]
async fn test_authenticate_after_shutdown_is_unavailable() {
    let server =
        start_with(|b| b.handshake_timeout(Duration::from_secs(2))).await;
    let mut late = connect_bare(&server.addr).await;
    // Let the handler reach the Authenticate wait.
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(2), server.task)
        .await
        .expect("run should return")
        .expect("task should not panic")
        .expect("run should succeed");

    send(
        &mut late,
        ClientMessage::Authenticate {
            token: token("alice", Audience::Web),
        },
    )
    .await;
    match recv(&mut late).await {
        ServerMessage::Rejected { reason } => {
            assert_eq!(reason, RejectReason::Unavailable);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(server.gateway.registry().is_empty());
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_logins_all_registered() {
    const USERS: usize = 32;
    let server = start_server().await;

    let mut tasks = Vec::new();
    for i in 0..USERS {
        let addr = server.addr.clone();
        tasks.push(tokio::spawn(async move {
            login(&addr, &format!("user-{i}"), Audience::Web).await
        }));
    }
    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    let registry = server.gateway.registry();
    assert_eq!(registry.len(), USERS);
    assert_eq!(registry.user_count(), USERS);
    for i in 0..USERS {
        assert!(registry.is_online(&UserId::new(format!("user-{i}"))));
    }
}
