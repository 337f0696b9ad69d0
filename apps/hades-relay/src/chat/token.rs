use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifetime of a broadcast token.
pub const TOKEN_TTL_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("sending to chat requires a client_id and secret (missing {0})")]
    MissingCredential(&'static str),
    #[error("extension secret is not valid base64: {0}")]
    InvalidSecret(#[from] base64::DecodeError),
    #[error("failed to sign token: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubsubPerms {
    pub send: Vec<String>,
}

/// Claim set accepted by the extension broadcast endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastClaims {
    pub exp: i64,
    pub channel_id: String,
    pub role: String,
    pub pubsub_perms: PubsubPerms,
}

impl BroadcastClaims {
    pub fn new(channel_id: &str, now: i64) -> Self {
        Self {
            exp: now + TOKEN_TTL_SECS,
            channel_id: channel_id.to_string(),
            role: "external".to_string(),
            pubsub_perms: PubsubPerms {
                send: vec!["broadcast".to_string()],
            },
        }
    }
}

/// Decodes an extension secret, accepting standard or url-safe base64 with or
/// without padding.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, TokenError> {
    let normalized: String = secret
        .trim()
        .chars()
        .filter(|ch| *ch != '=')
        .map(|ch| match ch {
            '+' => '-',
            '/' | '.' => '_',
            other => other,
        })
        .collect();
    if normalized.is_empty() {
        return Err(TokenError::MissingCredential("secret"));
    }
    Ok(URL_SAFE_NO_PAD.decode(normalized)?)
}

/// Signs a short-lived HS256 token for broadcasting on `channel_id`.
pub fn sign_broadcast_token(secret: &str, channel_id: &str, now: i64) -> Result<String, TokenError> {
    let key = decode_secret(secret)?;
    let claims = BroadcastClaims::new(channel_id, now);
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(&key),
    )?;
    Ok(token)
}
