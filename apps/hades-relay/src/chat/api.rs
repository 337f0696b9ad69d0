use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const KRAKEN_ACCEPT: &str = "application/vnd.twitchtv.v5+json";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no client id configured for channel lookup")]
    MissingClientId,
    #[error("channel `{0}` was not found")]
    UnknownChannel(String),
    #[error("{status} {message}")]
    Status { status: StatusCode, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    #[serde(rename = "_id")]
    id: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct BroadcastBody<'a> {
    content_type: &'a str,
    targets: [&'a str; 1],
    message: String,
}

/// Thin client for the two Twitch REST calls the relay needs.
#[derive(Clone)]
pub struct TwitchApi {
    base: String,
    lookup_client_id: String,
    client: Client,
}

impl TwitchApi {
    pub fn new(base: impl Into<String>, lookup_client_id: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            lookup_client_id: lookup_client_id.into(),
            client: Client::new(),
        }
    }

    /// Resolves a channel login to its numeric id.
    pub async fn lookup_channel_id(&self, login: &str) -> Result<String, ApiError> {
        if self.lookup_client_id.trim().is_empty() {
            return Err(ApiError::MissingClientId);
        }
        let response = self
            .client
            .get(format!("{}/kraken/users", self.base))
            .query(&[("login", login)])
            .header(header::ACCEPT, KRAKEN_ACCEPT)
            .header("Client-ID", &self.lookup_client_id)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body: UsersResponse = response.json().await?;
        let id = body
            .users
            .into_iter()
            .next()
            .map(|user| match user.id {
                Value::String(id) => id,
                other => other.to_string(),
            })
            .ok_or_else(|| ApiError::UnknownChannel(login.to_string()))?;
        debug!(target = "relay.chat", login, channel_id = %id, "resolved channel id");
        Ok(id)
    }

    /// Posts `message` as a JSON string to the extension broadcast target.
    pub async fn send_broadcast(
        &self,
        channel_id: &str,
        client_id: &str,
        token: &str,
        message: &Value,
    ) -> Result<(), ApiError> {
        let body = BroadcastBody {
            content_type: "application/json",
            targets: ["broadcast"],
            message: message.to_string(),
        };
        let response = self
            .client
            .post(format!("{}/extensions/message/{}", self.base, channel_id))
            .header("Client-Id", client_id)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await?;
        debug!(target = "relay.chat", channel_id, "broadcast delivered");
        Ok(())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or(text);
    Err(ApiError::Status { status, message })
}
