use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Upper bound on the encoded size of a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// A single topic-tagged message exchanged over the relay socket.
///
/// On the wire this is exactly `{"target": <string>, "message": <any>}`. The
/// payload is never interpreted by the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub target: String,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is missing a string `target`")]
    MissingTarget,
}

impl Frame {
    pub fn new(target: impl Into<String>, message: Value) -> Self {
        Self {
            target: target.into(),
            message,
        }
    }

    /// Serializes the frame, rejecting it if the text exceeds `limit` bytes.
    pub fn encode(&self, limit: usize) -> Result<String, FrameError> {
        let text = serde_json::to_string(self)?;
        if text.len() > limit {
            return Err(FrameError::TooLarge {
                size: text.len(),
                limit,
            });
        }
        Ok(text)
    }

    /// Parses a frame from socket text.
    ///
    /// Only the `target` field is validated; a missing `message` decodes as
    /// `null` so subscribers still see the frame.
    pub fn decode(text: &str, limit: usize) -> Result<Self, FrameError> {
        if text.len() > limit {
            return Err(FrameError::TooLarge {
                size: text.len(),
                limit,
            });
        }
        let mut value: Value = serde_json::from_str(text)?;
        let target = match value.get_mut("target").map(Value::take) {
            Some(Value::String(target)) => target,
            _ => return Err(FrameError::MissingTarget),
        };
        let message = value
            .get_mut("message")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Self { target, message })
    }
}
