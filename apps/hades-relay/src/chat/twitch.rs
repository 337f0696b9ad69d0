use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::irc::{chat_message, parse_line};
use super::{ChatClient, ChatError, ChatEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct IrcSession {
    channel: String,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Anonymous read-only Twitch chat client over IRC-on-WebSocket.
pub struct TwitchIrcClient {
    url: String,
    session: Mutex<Option<IrcSession>>,
}

impl TwitchIrcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> Option<String> {
        self.session.lock().as_ref().map(|session| session.channel.clone())
    }
}

/// Lowercases and strips a leading `#`.
pub fn normalize_channel(channel: &str) -> String {
    channel.trim().trim_start_matches('#').to_ascii_lowercase()
}

fn handshake_lines(channel: &str) -> Vec<String> {
    let nick = format!("justinfan{}", rand::thread_rng().gen_range(1_000..80_000));
    vec![
        "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
        "PASS SCHMOOPIIE".to_string(),
        format!("NICK {nick}"),
        format!("JOIN #{channel}"),
    ]
}

#[async_trait]
impl ChatClient for TwitchIrcClient {
    async fn connect(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<ChatEvent>, ChatError> {
        let channel = normalize_channel(channel);
        if channel.is_empty() {
            return Err(ChatError::EmptyChannel);
        }
        self.disconnect().await;

        let (stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return Err(ChatError::Connection(err.to_string())),
            Err(_) => return Err(ChatError::Connection("timed out connecting to chat".into())),
        };
        let (mut sink, mut source) = stream.split();
        for line in handshake_lines(&channel) {
            sink.send(Message::Text(line.into()))
                .await
                .map_err(|err| ChatError::Connection(err.to_string()))?;
        }
        info!(target = "relay.chat", %channel, "joined chat");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            'socket: loop {
                tokio::select! {
                    line = outbound_rx.recv() => match line {
                        Some(line) => {
                            if sink.send(Message::Text(line.into())).await.is_err() {
                                break 'socket;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break 'socket;
                        }
                    },
                    inbound = source.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            for line in text.as_str().split("\r\n") {
                                let Some(event) = parse_line(line) else {
                                    continue;
                                };
                                if event.command == "PING" {
                                    let reply = match event.params.last() {
                                        Some(server) => format!("PONG :{server}"),
                                        None => "PONG".to_string(),
                                    };
                                    if sink.send(Message::Text(reply.into())).await.is_err() {
                                        break 'socket;
                                    }
                                }
                                if let Some(message) = chat_message(&event) {
                                    let _ = events_tx.send(ChatEvent::Message(message));
                                }
                                let _ = events_tx.send(ChatEvent::Raw(event));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break 'socket,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(target = "relay.chat", channel = %task_channel, error = %err, "chat socket error");
                            break 'socket;
                        }
                    },
                }
            }
            debug!(target = "relay.chat", channel = %task_channel, "chat socket closed");
        });

        *self.session.lock() = Some(IrcSession {
            channel,
            outbound,
            task,
        });
        Ok(events_rx)
    }

    async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(IrcSession {
            channel,
            outbound,
            task,
        }) = session
        {
            drop(outbound);
            if timeout(Duration::from_secs(2), task).await.is_err() {
                debug!(target = "relay.chat", %channel, "chat socket did not close in time");
            }
            info!(target = "relay.chat", %channel, "left chat");
        }
    }
}
