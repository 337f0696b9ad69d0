use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hades_relay::config::EndpointConfig;
use hades_relay::controller::{ConnectionPhase, ReconnectController, ReconnectPolicy};
use relay_bus::{Frame, SendOutcome, TopicRouter, DEFAULT_MAX_FRAME_BYTES};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

/// Accepts relay connections, echoing the requested sub-protocol, and hands
/// each socket to the test.
async fn spawn_relay() -> (String, mpsc::UnboundedReceiver<ServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let echo_protocol = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                    response
                        .headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
                }
                Ok(response)
            };
            if let Ok(socket) = accept_hdr_async(stream, echo_protocol).await {
                if tx.send(socket).is_err() {
                    break;
                }
            }
        }
    });
    (format!("ws://{addr}"), rx)
}

fn endpoint(url: &str) -> EndpointConfig {
    EndpointConfig {
        url: url.to_string(),
        ..EndpointConfig::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_socket(sockets: &mut mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
    timeout(Duration::from_secs(5), sockets.recv())
        .await
        .expect("relay connection timed out")
        .expect("server stopped")
}

#[tokio::test]
async fn refused_endpoint_gives_up_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let policy = ReconnectPolicy {
        max_attempts: Some(3),
        ..ReconnectPolicy::default()
    };
    let controller = ReconnectController::new(endpoint(&format!("ws://{addr}")), policy, TopicRouter::new());
    controller.start();

    wait_until(|| !controller.is_searching()).await;
    assert_eq!(controller.attempts(), 3);
    assert_eq!(controller.phase(), ConnectionPhase::Closed);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.attempts(), 3);
}

#[tokio::test]
async fn inbound_frames_reach_subscribers_and_malformed_ones_are_dropped() {
    let (url, mut sockets) = spawn_relay().await;
    let controller = ReconnectController::new(endpoint(&url), ReconnectPolicy::default(), TopicRouter::new());
    let mut boons = controller.router().watch("boon");
    controller.start();

    let mut server = next_socket(&mut sockets).await;
    wait_until(|| controller.phase() == ConnectionPhase::Open).await;

    server.send(Message::Text("not json".into())).await.expect("send");
    server
        .send(Message::Text(r#"{"target":"boon","message":{"god":"Zeus"}}"#.into()))
        .await
        .expect("send");

    let frame = timeout(Duration::from_secs(5), boons.recv())
        .await
        .expect("frame timed out")
        .expect("watch closed");
    assert_eq!(frame, Frame::new("boon", json!({"god": "Zeus"})));
    assert_eq!(controller.phase(), ConnectionPhase::Open);
}

#[tokio::test]
async fn publish_goes_out_only_while_open() {
    let (url, mut sockets) = spawn_relay().await;
    let controller = ReconnectController::new(endpoint(&url), ReconnectPolicy::default(), TopicRouter::new());
    let bus = controller.bus();

    assert_eq!(bus.publish("x", &json!(1)).expect("publish"), SendOutcome::Dropped);

    controller.start();
    let mut server = next_socket(&mut sockets).await;
    wait_until(|| controller.phase() == ConnectionPhase::Open).await;

    assert_eq!(bus.publish("x", &json!({"a": 1})).expect("publish"), SendOutcome::Sent);
    let received = timeout(Duration::from_secs(5), server.next())
        .await
        .expect("read timed out")
        .expect("stream ended")
        .expect("read");
    let text = received.into_text().expect("text frame");
    let frame = Frame::decode(text.as_str(), DEFAULT_MAX_FRAME_BYTES).expect("decode");
    assert_eq!(frame, Frame::new("x", json!({"a": 1})));
}

#[tokio::test]
async fn reconnects_after_relay_closes() {
    let (url, mut sockets) = spawn_relay().await;
    let controller = ReconnectController::new(endpoint(&url), ReconnectPolicy::default(), TopicRouter::new());
    controller.start();

    let mut first = next_socket(&mut sockets).await;
    wait_until(|| controller.phase() == ConnectionPhase::Open).await;
    first.close(None).await.expect("close");

    let _second = next_socket(&mut sockets).await;
    wait_until(|| controller.attempts() == 2 && controller.phase() == ConnectionPhase::Open).await;
    assert!(controller.is_searching());

    sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.attempts(), 2);
    assert!(timeout(Duration::from_millis(50), sockets.recv()).await.is_err());
}

#[tokio::test]
async fn stop_closes_the_socket_and_cancels_reconnects() {
    let (url, mut sockets) = spawn_relay().await;
    let controller = ReconnectController::new(endpoint(&url), ReconnectPolicy::default(), TopicRouter::new());
    controller.start();

    let mut server = next_socket(&mut sockets).await;
    wait_until(|| controller.phase() == ConnectionPhase::Open).await;

    controller.stop();
    assert_eq!(controller.phase(), ConnectionPhase::Idle);

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match server.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "relay never saw the close");

    assert!(timeout(Duration::from_millis(200), sockets.recv()).await.is_err());
    assert_eq!(controller.attempts(), 1);
    assert_eq!(controller.phase(), ConnectionPhase::Idle);
    assert!(!controller.is_searching());
}

#[tokio::test]
async fn toggle_flips_searching() {
    let (url, mut sockets) = spawn_relay().await;
    let controller = ReconnectController::new(endpoint(&url), ReconnectPolicy::default(), TopicRouter::new());

    assert!(controller.toggle());
    let _server = next_socket(&mut sockets).await;
    wait_until(|| controller.phase() == ConnectionPhase::Open).await;

    assert!(!controller.toggle());
    assert_eq!(controller.phase(), ConnectionPhase::Idle);
}

/// Accepts TCP connections and never answers the websocket handshake.
async fn spawn_silent_listener() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn restart_while_old_handshake_is_stuck_scans_again() {
    let url = spawn_silent_listener().await;
    let controller = ReconnectController::new(endpoint(&url), ReconnectPolicy::default(), TopicRouter::new());

    controller.start();
    assert_eq!(controller.phase(), ConnectionPhase::Scanning);
    sleep(Duration::from_millis(50)).await;

    controller.stop();
    assert_eq!(controller.phase(), ConnectionPhase::Idle);

    controller.start();
    assert_eq!(controller.phase(), ConnectionPhase::Scanning);
    assert!(controller.is_searching());
    assert_eq!(controller.attempts(), 2);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(controller.phase(), ConnectionPhase::Scanning);
    assert_eq!(controller.attempts(), 2);
}

#[tokio::test]
async fn released_connection_does_not_disturb_the_new_one() {
    let (url, mut sockets) = spawn_relay().await;
    let controller = ReconnectController::new(endpoint(&url), ReconnectPolicy::default(), TopicRouter::new());
    controller.start();
    let mut first = next_socket(&mut sockets).await;
    wait_until(|| controller.phase() == ConnectionPhase::Open).await;

    controller.stop();
    controller.start();
    let _second = next_socket(&mut sockets).await;
    wait_until(|| controller.phase() == ConnectionPhase::Open).await;

    let _ = timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = first.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.phase(), ConnectionPhase::Open);
    assert_eq!(controller.attempts(), 2);
}

#[tokio::test]
async fn shutdown_closes_the_socket_and_ends_the_controller() {
    let (url, mut sockets) = spawn_relay().await;
    let controller = ReconnectController::new(endpoint(&url), ReconnectPolicy::default(), TopicRouter::new());
    controller.start();
    let mut server = next_socket(&mut sockets).await;
    wait_until(|| controller.phase() == ConnectionPhase::Open).await;

    timeout(Duration::from_secs(5), controller.shutdown())
        .await
        .expect("shutdown timed out");
    assert_eq!(controller.phase(), ConnectionPhase::Idle);
    assert!(!controller.is_searching());

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match server.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "relay never saw the close");

    controller.start();
    assert!(!controller.is_searching());
    assert!(timeout(Duration::from_millis(200), sockets.recv()).await.is_err());
    assert_eq!(controller.attempts(), 1);
}
