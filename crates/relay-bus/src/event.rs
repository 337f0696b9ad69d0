//! Typed payloads for the topics the relay knows about.
//!
//! The router itself stays payload-agnostic; consumers that care about a topic
//! call [`RelayEvent::from_frame`] to validate the message at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::frame::Frame;

/// Chat messages republished from the chat client.
pub const TOPIC_CHAT_MESSAGE: &str = "twitch";
/// Raw chat protocol events, keep-alives excluded.
pub const TOPIC_CHAT_RAW: &str = "twitch_raw";
/// Requests from the control process to broadcast into chat.
pub const TOPIC_CHAT_SEND: &str = "twitch_send";

pub const KNOWN_TOPICS: [&str; 3] = [TOPIC_CHAT_MESSAGE, TOPIC_CHAT_RAW, TOPIC_CHAT_SEND];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub channel: String,
    #[serde(default)]
    pub tags: Map<String, Value>,
    pub message: String,
    /// Whether the message was sent by the connected account.
    #[serde(rename = "self", default)]
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChatEvent {
    pub raw: String,
    #[serde(default)]
    pub tags: Map<String, Value>,
    #[serde(default)]
    pub prefix: Option<String>,
    pub command: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl RawChatEvent {
    /// PING/PONG control traffic that should never reach the bus.
    pub fn is_keepalive(&self) -> bool {
        self.command.eq_ignore_ascii_case("PING") || self.command.eq_ignore_ascii_case("PONG")
    }
}

/// Outbound broadcast request. Credentials are optional at the type level so a
/// missing one surfaces as a user-input error instead of a decode failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSendRequest {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    ChatMessage(ChatMessage),
    ChatRaw(RawChatEvent),
    ChatSend(ChatSendRequest),
    Other { target: String, message: Value },
}

#[derive(Debug, Error)]
#[error("invalid payload for topic `{topic}`: {source}")]
pub struct EventError {
    pub topic: String,
    #[source]
    pub source: serde_json::Error,
}

impl RelayEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self, EventError> {
        let message = frame.message.clone();
        let typed = |source| EventError {
            topic: frame.target.clone(),
            source,
        };
        let event = match frame.target.as_str() {
            TOPIC_CHAT_MESSAGE => {
                RelayEvent::ChatMessage(serde_json::from_value(message).map_err(typed)?)
            }
            TOPIC_CHAT_RAW => RelayEvent::ChatRaw(serde_json::from_value(message).map_err(typed)?),
            TOPIC_CHAT_SEND => {
                RelayEvent::ChatSend(serde_json::from_value(message).map_err(typed)?)
            }
            _ => RelayEvent::Other {
                target: frame.target.clone(),
                message,
            },
        };
        Ok(event)
    }

    pub fn target(&self) -> &str {
        match self {
            RelayEvent::ChatMessage(_) => TOPIC_CHAT_MESSAGE,
            RelayEvent::ChatRaw(_) => TOPIC_CHAT_RAW,
            RelayEvent::ChatSend(_) => TOPIC_CHAT_SEND,
            RelayEvent::Other { target, .. } => target,
        }
    }

    pub fn into_frame(self) -> Result<Frame, serde_json::Error> {
        let target = self.target().to_string();
        let message = match self {
            RelayEvent::ChatMessage(payload) => serde_json::to_value(payload)?,
            RelayEvent::ChatRaw(payload) => serde_json::to_value(payload)?,
            RelayEvent::ChatSend(payload) => serde_json::to_value(payload)?,
            RelayEvent::Other { message, .. } => message,
        };
        Ok(Frame { target, message })
    }
}
