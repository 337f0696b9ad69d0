use std::sync::Arc;

use async_trait::async_trait;
use relay_bus::{
    Bus, BusResult, ChatSendRequest, RelayEvent, SendOutcome, Subscription, TOPIC_CHAT_SEND,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{ChatError, ChatEvent};

/// Outbound half of the chat client as seen by the bridge.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, request: ChatSendRequest) -> Result<(), ChatError>;

    /// Surfaces a failed send to the user.
    fn report(&self, err: &ChatError);
}

/// Republishes chat events on the bus and forwards bus send requests to chat.
pub struct ChatBridge {
    subscription: Subscription,
    forward: JoinHandle<()>,
}

impl ChatBridge {
    /// Must be called from within a Tokio runtime.
    pub fn attach(
        bus: Bus,
        events: mpsc::UnboundedReceiver<ChatEvent>,
        sender: Arc<dyn ChatSender>,
    ) -> Self {
        let runtime = Handle::current();
        let subscription = bus.subscribe(TOPIC_CHAT_SEND, move |frame| {
            let request = match RelayEvent::from_frame(frame) {
                Ok(RelayEvent::ChatSend(request)) => request,
                Ok(_) => return,
                Err(err) => {
                    warn!(target = "relay.bridge", error = %err, "dropping malformed chat send request");
                    return;
                }
            };
            let sender = Arc::clone(&sender);
            runtime.spawn(async move {
                if let Err(err) = sender.send(request).await {
                    sender.report(&err);
                }
            });
        });
        let forward = tokio::spawn(pump_events(bus, events));
        Self {
            subscription,
            forward,
        }
    }

    /// Stops forwarding in both directions.
    pub fn detach(self) {
        self.subscription.unsubscribe();
        self.forward.abort();
    }

    /// Waits for the chat event stream to end, then detaches the send path.
    pub async fn wait(self) {
        let Self {
            subscription,
            forward,
        } = self;
        let _ = forward.await;
        subscription.unsubscribe();
    }
}

/// Publishes one chat event. Returns `None` when the event is filtered out.
pub fn forward_event(bus: &Bus, event: ChatEvent) -> BusResult<Option<SendOutcome>> {
    let relay_event = match event {
        ChatEvent::Message(message) => RelayEvent::ChatMessage(message),
        ChatEvent::Raw(raw) if raw.is_keepalive() => {
            trace!(target = "relay.bridge", command = %raw.command, "keep-alive filtered");
            return Ok(None);
        }
        ChatEvent::Raw(raw) => RelayEvent::ChatRaw(raw),
    };
    bus.publish_event(relay_event).map(Some)
}

async fn pump_events(bus: Bus, mut events: mpsc::UnboundedReceiver<ChatEvent>) {
    while let Some(event) = events.recv().await {
        match forward_event(&bus, event) {
            Ok(Some(SendOutcome::Dropped)) => {
                trace!(target = "relay.bridge", "relay not open; chat event dropped");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target = "relay.bridge", error = %err, "failed to publish chat event");
            }
        }
    }
    debug!(target = "relay.bridge", "chat event stream ended");
}
