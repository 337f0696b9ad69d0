use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hades_relay::chat::token::BroadcastClaims;
use hades_relay::chat::{
    ApiError, ChatClient, ChatError, ChatEvent, ChatPhase, ChatSender, ChatSession, TokenError,
    TwitchApi, TwitchIrcClient,
};
use hades_relay::status::StatusIndicator;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use relay_bus::ChatSendRequest;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

#[derive(Default)]
struct FakeChat {
    joined: Mutex<Vec<String>>,
    left: Mutex<usize>,
    events: Mutex<Option<mpsc::UnboundedSender<ChatEvent>>>,
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn connect(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<ChatEvent>, ChatError> {
        self.joined.lock().push(channel.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {
        *self.left.lock() += 1;
        self.events.lock().take();
    }
}

async fn mock_lookup(server: &MockServer, login: &str, id: Value) {
    Mock::given(method("GET"))
        .and(path("/kraken/users"))
        .and(query_param("login", login))
        .and(header("Accept", "application/vnd.twitchtv.v5+json"))
        .and(header("Client-ID", "lookup-client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_total": 1,
            "users": [{"_id": id, "name": login}]
        })))
        .mount(server)
        .await;
}

fn session(server: &MockServer, client: Arc<FakeChat>) -> ChatSession {
    ChatSession::new(TwitchApi::new(server.uri(), "lookup-client"), client)
}

#[tokio::test]
async fn connect_resolves_channel_and_joins_chat() {
    let server = MockServer::start().await;
    mock_lookup(&server, "supergiantgames", json!("12826")).await;
    let client = Arc::new(FakeChat::default());
    let session = session(&server, client.clone());

    let _events = session.connect("#supergiantgames").await.expect("connect");

    assert_eq!(session.channel_id().as_deref(), Some("12826"));
    assert_eq!(*client.joined.lock(), vec!["supergiantgames".to_string()]);
    let status = session.status();
    assert_eq!(status.phase, ChatPhase::Connected);
    assert_eq!(StatusIndicator::from(status).text, "Connected");

    let toggled = session.toggle("supergiantgames").await.expect("toggle");
    assert!(toggled.is_none());
    assert!(!session.is_connected());
    assert_eq!(*client.left.lock(), 1);
    assert_eq!(session.status().phase, ChatPhase::Disconnected);
}

#[tokio::test]
async fn numeric_channel_ids_are_accepted() {
    let server = MockServer::start().await;
    mock_lookup(&server, "hades", json!(4242)).await;
    let session = session(&server, Arc::new(FakeChat::default()));

    session.connect("hades").await.expect("connect");
    assert_eq!(session.channel_id().as_deref(), Some("4242"));
}

#[tokio::test]
async fn empty_channel_is_a_user_error() {
    let server = MockServer::start().await;
    let client = Arc::new(FakeChat::default());
    let session = session(&server, client.clone());

    let err = session.connect("  # ").await.expect_err("empty channel");

    assert!(matches!(err, ChatError::EmptyChannel));
    assert!(err.is_user_input());
    assert!(client.joined.lock().is_empty());
    assert_eq!(session.status().error.as_deref(), Some("channel name is empty"));
}

#[tokio::test]
async fn unknown_channel_reports_and_stays_disconnected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kraken/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_total": 0, "users": []})))
        .mount(&server)
        .await;
    let client = Arc::new(FakeChat::default());
    let session = session(&server, client.clone());

    let err = session.connect("nobody").await.expect_err("unknown channel");

    assert!(matches!(err, ChatError::Api(ApiError::UnknownChannel(_))));
    let status = session.status();
    assert_eq!(status.phase, ChatPhase::Disconnected);
    assert!(status.error.is_some());
    assert!(client.joined.lock().is_empty());
}

#[tokio::test]
async fn lookup_errors_surface_the_api_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kraken/users"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": "Bad Request", "message": "invalid login"})),
        )
        .mount(&server)
        .await;
    let session = session(&server, Arc::new(FakeChat::default()));

    let err = session.connect("??").await.expect_err("bad request");

    match err {
        ChatError::Api(ApiError::Status { status, message }) => {
            assert_eq!(status.as_u16(), 400);
            assert_eq!(message, "invalid login");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn send_requires_both_credentials() {
    let server = MockServer::start().await;
    mock_lookup(&server, "hades", json!("1")).await;
    let session = session(&server, Arc::new(FakeChat::default()));
    session.connect("hades").await.expect("connect");

    let err = session
        .send(ChatSendRequest {
            client_id: Some("ext-client".into()),
            secret: None,
            message: json!({}),
        })
        .await
        .expect_err("missing secret");
    assert!(matches!(err, ChatError::Token(TokenError::MissingCredential("secret"))));
    assert!(err.is_user_input());

    session.report(&err);
    let status = session.status();
    assert_eq!(status.phase, ChatPhase::Connected);
    assert!(status.error.expect("error text").contains("client_id and secret"));

    let err = session
        .send(ChatSendRequest {
            client_id: Some("   ".into()),
            secret: Some("c2VjcmV0".into()),
            message: json!({}),
        })
        .await
        .expect_err("blank client id");
    assert!(matches!(err, ChatError::Token(TokenError::MissingCredential("client_id"))));
}

#[tokio::test]
async fn send_before_connect_is_rejected() {
    let server = MockServer::start().await;
    let session = session(&server, Arc::new(FakeChat::default()));

    let err = session
        .send(ChatSendRequest {
            client_id: Some("ext-client".into()),
            secret: Some("c2VjcmV0".into()),
            message: json!({}),
        })
        .await
        .expect_err("not connected");
    assert!(matches!(err, ChatError::NotConnected));
}

#[tokio::test]
async fn send_posts_a_signed_broadcast() {
    let server = MockServer::start().await;
    mock_lookup(&server, "hades", json!("12826")).await;
    Mock::given(method("POST"))
        .and(path("/extensions/message/12826"))
        .and(header("Client-Id", "ext-client"))
        .and(body_json(json!({
            "content_type": "application/json",
            "targets": ["broadcast"],
            "message": "{\"vote\":\"Ares\"}"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let raw_secret = b"extension-secret-bytes";
    let secret = STANDARD.encode(raw_secret);
    let session = session(&server, Arc::new(FakeChat::default()));
    session.connect("hades").await.expect("connect");

    session
        .send(ChatSendRequest {
            client_id: Some("ext-client".into()),
            secret: Some(secret),
            message: json!({"vote": "Ares"}),
        })
        .await
        .expect("send");

    let requests: Vec<Request> = server.received_requests().await.expect("recording enabled");
    let post = requests
        .iter()
        .find(|request| request.method.as_str() == "POST")
        .expect("broadcast request");
    let bearer = post
        .headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .expect("bearer token");

    let claims = decode::<BroadcastClaims>(
        bearer,
        &DecodingKey::from_secret(raw_secret),
        &Validation::new(Algorithm::HS256),
    )
    .expect("token verifies")
    .claims;
    assert_eq!(claims.channel_id, "12826");
    assert_eq!(claims.role, "external");
    assert_eq!(claims.pubsub_perms.send, vec!["broadcast".to_string()]);
}

#[tokio::test]
async fn rejected_broadcast_is_an_api_error() {
    let server = MockServer::start().await;
    mock_lookup(&server, "hades", json!("7")).await;
    Mock::given(method("POST"))
        .and(path("/extensions/message/7"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "invalid jwt"})))
        .mount(&server)
        .await;
    let session = session(&server, Arc::new(FakeChat::default()));
    session.connect("hades").await.expect("connect");

    let err = session
        .send(ChatSendRequest {
            client_id: Some("ext-client".into()),
            secret: Some(STANDARD.encode(b"secret")),
            message: json!("hi"),
        })
        .await
        .expect_err("rejected");

    assert!(matches!(err, ChatError::Api(ApiError::Status { .. })));
    assert!(!err.is_user_input());
}

/// Chat server that accepts one client, waits, then closes the socket.
async fn spawn_closing_chat_server(after: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(mut socket) = accept_async(stream).await {
                sleep(after).await;
                let _ = socket.close(None).await;
            }
        }
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn dropped_chat_socket_marks_session_disconnected() {
    let server = MockServer::start().await;
    mock_lookup(&server, "hades", json!("12826")).await;
    let irc_url = spawn_closing_chat_server(Duration::from_millis(100)).await;
    let session = ChatSession::new(
        TwitchApi::new(server.uri(), "lookup-client"),
        Arc::new(TwitchIrcClient::new(irc_url)),
    );

    let mut events = session.connect("hades").await.expect("connect");
    assert_eq!(session.status().phase, ChatPhase::Connected);

    timeout(Duration::from_secs(5), async { while events.recv().await.is_some() {} })
        .await
        .expect("chat stream never ended");
    let mut status = session.watch_status();
    timeout(
        Duration::from_secs(5),
        status.wait_for(|status| status.phase == ChatPhase::Disconnected),
    )
    .await
    .expect("status never changed")
    .expect("status sender dropped");

    assert!(!session.is_connected());
    assert_eq!(session.status().error.as_deref(), Some("chat connection lost"));
}

#[tokio::test]
async fn user_disconnect_is_not_reported_as_lost() {
    let server = MockServer::start().await;
    mock_lookup(&server, "hades", json!("1")).await;
    let client = Arc::new(FakeChat::default());
    let session = session(&server, client.clone());

    let mut events = session.connect("hades").await.expect("connect");
    session.disconnect().await;
    timeout(Duration::from_secs(5), async { while events.recv().await.is_some() {} })
        .await
        .expect("chat stream never ended");
    sleep(Duration::from_millis(50)).await;

    let status = session.status();
    assert_eq!(status.phase, ChatPhase::Disconnected);
    assert_eq!(status.error, None);
}
