use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_bus::ChatSendRequest;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::token::{sign_broadcast_token, TokenError};
use super::{ChatClient, ChatError, ChatEvent, ChatSender, TwitchApi};
use crate::status::StatusIndicator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Phase plus the last user-visible error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStatus {
    pub phase: ChatPhase,
    pub error: Option<String>,
}

impl From<ChatStatus> for StatusIndicator {
    fn from(status: ChatStatus) -> Self {
        status.phase.into()
    }
}

#[derive(Default)]
struct SessionState {
    channel_name: Option<String>,
    channel_id: Option<String>,
    /// Bumped on every connect and disconnect so a stream watcher can tell
    /// whether its connection is still the live one.
    generation: u64,
}

/// Connection to one chat channel plus the outbound broadcast path.
pub struct ChatSession {
    api: TwitchApi,
    client: Arc<dyn ChatClient>,
    state: Arc<Mutex<SessionState>>,
    status: Arc<watch::Sender<ChatStatus>>,
}

impl ChatSession {
    pub fn new(api: TwitchApi, client: Arc<dyn ChatClient>) -> Self {
        let (status, _) = watch::channel(ChatStatus {
            phase: ChatPhase::Disconnected,
            error: None,
        });
        Self {
            api,
            client,
            state: Arc::new(Mutex::new(SessionState::default())),
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> ChatStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChatStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().channel_id.is_some()
    }

    pub fn channel_id(&self) -> Option<String> {
        self.state.lock().channel_id.clone()
    }

    /// Looks up the channel id and joins chat. Failures are reported on the
    /// status and returned.
    ///
    /// The returned stream ends when chat goes away; if that happens without a
    /// call to [`ChatSession::disconnect`] the session drops to `Disconnected`
    /// with an error.
    pub async fn connect(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<ChatEvent>, ChatError> {
        let channel = channel.trim().trim_start_matches('#').to_string();
        if channel.is_empty() {
            let err = ChatError::EmptyChannel;
            self.fail(&err);
            return Err(err);
        }

        self.state.lock().generation += 1;
        self.status.send_replace(ChatStatus {
            phase: ChatPhase::Connecting,
            error: None,
        });

        let channel_id = match self.api.lookup_channel_id(&channel).await {
            Ok(id) => id,
            Err(err) => {
                let err = ChatError::from(err);
                self.fail(&err);
                return Err(err);
            }
        };
        let events = match self.client.connect(&channel).await {
            Ok(events) => events,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        let generation = {
            let mut state = self.state.lock();
            state.channel_name = Some(channel.clone());
            state.channel_id = Some(channel_id.clone());
            state.generation += 1;
            state.generation
        };
        info!(target = "relay.chat", %channel, %channel_id, "chat connected");
        self.status.send_replace(ChatStatus {
            phase: ChatPhase::Connected,
            error: None,
        });

        let (forward, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_stream(
            events,
            forward,
            Arc::clone(&self.state),
            Arc::clone(&self.status),
            generation,
        ));
        Ok(events_rx)
    }

    pub async fn disconnect(&self) {
        let channel = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.channel_id = None;
            state.channel_name.take()
        };
        self.client.disconnect().await;
        if let Some(channel) = channel {
            info!(target = "relay.chat", %channel, "chat disconnected");
        }
        self.status.send_modify(|status| status.phase = ChatPhase::Disconnected);
    }

    /// Connects when disconnected, disconnects otherwise. Returns the event
    /// stream when a new connection was made.
    pub async fn toggle(&self, channel: &str) -> Result<Option<mpsc::UnboundedReceiver<ChatEvent>>, ChatError> {
        if self.is_connected() {
            self.disconnect().await;
            Ok(None)
        } else {
            self.connect(channel).await.map(Some)
        }
    }

    fn fail(&self, err: &ChatError) {
        warn!(target = "relay.chat", error = %err, user_input = err.is_user_input(), "chat operation failed");
        self.status.send_replace(ChatStatus {
            phase: ChatPhase::Disconnected,
            error: Some(err.to_string()),
        });
    }
}

/// Relays client events and marks the session lost when the client stream
/// ends while `generation` is still current.
async fn watch_stream(
    mut upstream: mpsc::UnboundedReceiver<ChatEvent>,
    forward: mpsc::UnboundedSender<ChatEvent>,
    state: Arc<Mutex<SessionState>>,
    status: Arc<watch::Sender<ChatStatus>>,
    generation: u64,
) {
    while let Some(event) = upstream.recv().await {
        let _ = forward.send(event);
    }

    let lost = {
        let mut state = state.lock();
        if state.generation != generation {
            return;
        }
        state.channel_id = None;
        state.channel_name.take()
    };
    let err = ChatError::ConnectionLost;
    warn!(target = "relay.chat", channel = ?lost, error = %err, "chat socket closed unexpectedly");
    status.send_replace(ChatStatus {
        phase: ChatPhase::Disconnected,
        error: Some(err.to_string()),
    });
}

#[async_trait]
impl ChatSender for ChatSession {
    async fn send(&self, request: ChatSendRequest) -> Result<(), ChatError> {
        let client_id = request
            .client_id
            .filter(|value| !value.trim().is_empty())
            .ok_or(TokenError::MissingCredential("client_id"))?;
        let secret = request
            .secret
            .filter(|value| !value.trim().is_empty())
            .ok_or(TokenError::MissingCredential("secret"))?;
        let channel_id = self.channel_id().ok_or(ChatError::NotConnected)?;

        let token = sign_broadcast_token(&secret, &channel_id, chrono::Utc::now().timestamp())?;
        self.api
            .send_broadcast(&channel_id, &client_id, &token, &request.message)
            .await?;
        Ok(())
    }

    fn report(&self, err: &ChatError) {
        warn!(target = "relay.chat", error = %err, user_input = err.is_user_input(), "chat send failed");
        self.status
            .send_modify(|status| status.error = Some(err.to_string()));
    }
}
