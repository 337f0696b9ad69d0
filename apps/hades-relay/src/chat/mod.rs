//! Twitch chat side of the relay.

use async_trait::async_trait;
use relay_bus::{ChatMessage, RawChatEvent};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod api;
pub mod bridge;
pub mod irc;
pub mod session;
pub mod token;
pub mod twitch;

pub use api::{ApiError, TwitchApi};
pub use bridge::{ChatBridge, ChatSender};
pub use session::{ChatPhase, ChatSession, ChatStatus};
pub use token::TokenError;
pub use twitch::TwitchIrcClient;

/// Events a chat client reports for the joined channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message(ChatMessage),
    Raw(RawChatEvent),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("channel name is empty")]
    EmptyChannel,
    #[error("chat is not connected")]
    NotConnected,
    #[error("chat connection failed: {0}")]
    Connection(String),
    #[error("chat connection lost")]
    ConnectionLost,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ChatError {
    /// Errors the user caused and can fix; these are reported, not retried.
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            ChatError::EmptyChannel
                | ChatError::Token(TokenError::MissingCredential(_))
                | ChatError::Token(TokenError::InvalidSecret(_))
        )
    }
}

/// Chat protocol client consumed by [`ChatSession`].
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Joins `channel` and returns the stream of its events. The stream ends
    /// when the client disconnects.
    async fn connect(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<ChatEvent>, ChatError>;

    async fn disconnect(&self);
}
