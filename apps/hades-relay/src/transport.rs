use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, trace};

use crate::config::EndpointConfig;

pub type ConnectionId = u64;

/// Lifecycle notifications from a single relay socket.
///
/// Every connection ends with exactly one `Closed`; a failure is reported as
/// `Errored` immediately before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Errored(String),
    Closed,
}

pub type EventSender = mpsc::UnboundedSender<(ConnectionId, TransportEvent)>;

enum Outbound {
    Text(String),
    Close,
}

/// Handle to one relay socket. The socket itself lives on a spawned task.
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Starts connecting in the background and returns immediately.
    pub fn spawn(id: ConnectionId, endpoint: &EndpointConfig, events: EventSender) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_socket(
            id,
            endpoint.clone(),
            Arc::clone(&open),
            outbound_rx,
            events,
        ));
        Self {
            id,
            outbound,
            open,
            task,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queues text for the socket. Returns `false` and drops the text when the
    /// socket is not open.
    pub fn send(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Requests a graceful close. A connection that is still handshaking
    /// closes as soon as it opens.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn build_request(endpoint: &EndpointConfig) -> Result<Request, tungstenite::Error> {
    let mut request = endpoint.url.as_str().into_client_request()?;
    let protocol = HeaderValue::from_str(&endpoint.subprotocol)
        .map_err(|err| tungstenite::Error::HttpFormat(err.into()))?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    Ok(request)
}

async fn run_socket(
    id: ConnectionId,
    endpoint: EndpointConfig,
    open: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventSender,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send((id, event));
    };

    let connected = match build_request(&endpoint) {
        Ok(request) => connect_async(request).await,
        Err(err) => Err(err),
    };
    let stream = match connected {
        Ok((stream, _response)) => stream,
        Err(err) => {
            debug!(target = "relay.transport", id, url = %endpoint.url, error = %err, "connect failed");
            emit(TransportEvent::Errored(err.to_string()));
            emit(TransportEvent::Closed);
            return;
        }
    };

    open.store(true, Ordering::Release);
    emit(TransportEvent::Opened);

    let (mut sink, mut source) = stream.split();
    let mut closing = false;
    let failure = loop {
        tokio::select! {
            request = outbound.recv(), if !closing => match request {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        break Some(err.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    closing = true;
                    open.store(false, Ordering::Release);
                    if sink.send(Message::Close(None)).await.is_err() {
                        break None;
                    }
                }
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    emit(TransportEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => emit(TransportEvent::Message(text)),
                    Err(_) => {
                        debug!(target = "relay.transport", id, len = data.len(), "ignoring non-utf8 binary frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(other)) => {
                    trace!(target = "relay.transport", id, kind = ?other, "control frame");
                }
                Some(Err(err)) => {
                    if closing {
                        break None;
                    }
                    break Some(err.to_string());
                }
            },
        }
    };

    open.store(false, Ordering::Release);
    if let Some(reason) = failure {
        debug!(target = "relay.transport", id, error = %reason, "socket failed");
        emit(TransportEvent::Errored(reason));
    }
    emit(TransportEvent::Closed);
}
