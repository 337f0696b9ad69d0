//! Topic-addressed publish/subscribe multiplexed over one relay connection.
//!
//! Inbound text from the socket goes through [`TopicRouter::dispatch_text`];
//! outbound publishes are encoded into [`Frame`]s and handed to a
//! [`FrameSink`], which decides whether the connection can take them.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::trace;

mod event;
mod frame;
pub mod loopback;
mod router;

pub use event::{
    ChatMessage, ChatSendRequest, EventError, RawChatEvent, RelayEvent, KNOWN_TOPICS,
    TOPIC_CHAT_MESSAGE, TOPIC_CHAT_RAW, TOPIC_CHAT_SEND,
};
pub use frame::{Frame, FrameError, DEFAULT_MAX_FRAME_BYTES};
pub use router::{Callback, DispatchReport, Subscription, TopicRouter, TopicWatch};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("payload could not be serialized: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("frame rejected: {0}")]
    Frame(#[from] FrameError),
}

pub type BusResult<T> = Result<T, BusError>;

/// Whether a published frame made it onto the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The connection was not open; the frame was discarded.
    Dropped,
}

/// Destination for encoded frames. Returns `false` when the frame was dropped
/// because no open connection exists.
pub trait FrameSink: Send + Sync {
    fn send_text(&self, text: String) -> bool;
}

impl<F> FrameSink for F
where
    F: Fn(String) -> bool + Send + Sync,
{
    fn send_text(&self, text: String) -> bool {
        (self)(text)
    }
}

/// Publish/subscribe facade shared by local code and the chat bridge.
///
/// Publishing never loops back to local subscribers; only frames that come
/// back over the connection are dispatched.
#[derive(Clone)]
pub struct Bus {
    router: TopicRouter,
    sink: Arc<dyn FrameSink>,
}

impl Bus {
    pub fn new(router: TopicRouter, sink: Arc<dyn FrameSink>) -> Self {
        Self { router, sink }
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> BusResult<SendOutcome> {
        let message = serde_json::to_value(payload)?;
        self.publish_frame(&Frame::new(topic, message))
    }

    pub fn publish_event(&self, event: RelayEvent) -> BusResult<SendOutcome> {
        self.publish_frame(&event.into_frame()?)
    }

    pub fn publish_frame(&self, frame: &Frame) -> BusResult<SendOutcome> {
        let text = frame.encode(self.router.max_frame_bytes())?;
        if self.sink.send_text(text) {
            trace!(target = "relay.bus", topic = %frame.target, "frame sent");
            Ok(SendOutcome::Sent)
        } else {
            trace!(target = "relay.bus", topic = %frame.target, "connection not open; frame dropped");
            Ok(SendOutcome::Dropped)
        }
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.router.subscribe(topic, callback)
    }

    pub fn watch(&self, topic: &str) -> TopicWatch {
        self.router.watch(topic)
    }
}
