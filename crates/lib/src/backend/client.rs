//! HTTP client for the remote conversation API.
//!
//! Three operations are consumed: create a conversation, post a turn to it,
//! and fetch the completed turn (long-poll with `wait=true`). No retry is
//! attempted here; a failed call surfaces to the handler as-is.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Status of a remote turn. The wire format is an integer; anything other
/// than `Completed` after a waited fetch is treated as an error by the
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum TurnStatus {
    Created,
    Pending,
    Completed,
    Unknown(i64),
}

impl From<i64> for TurnStatus {
    fn from(v: i64) -> Self {
        match v {
            0 => TurnStatus::Created,
            1 => TurnStatus::Pending,
            2 => TurnStatus::Completed,
            other => TurnStatus::Unknown(other),
        }
    }
}

impl From<TurnStatus> for i64 {
    fn from(s: TurnStatus) -> i64 {
        match s {
            TurnStatus::Created => 0,
            TurnStatus::Pending => 1,
            TurnStatus::Completed => 2,
            TurnStatus::Unknown(v) => v,
        }
    }
}

/// One request/response exchange within a conversation.
///
/// `is_plugin_custom_response` and `response_modified` are local pipeline
/// flags, never part of the wire payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: u64,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub response: String,
    pub status: TurnStatus,
    #[serde(skip)]
    pub is_plugin_custom_response: bool,
    #[serde(skip)]
    pub response_modified: bool,
}

/// A remote conversation as returned by the create call.
#[derive(Debug, Clone, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub user_identity: String,
}

/// Reference to a freshly posted turn, used to poll for completion.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnRef {
    pub id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend api error: {0}")]
    Api(String),
}

/// The remote operations the handler consumes.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn create_conversation(
        &self,
        bot_id: u64,
        user_identity: &str,
        lang: &str,
    ) -> Result<Conversation, BackendError>;

    async fn post_to_conversation(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<TurnRef, BackendError>;

    /// Fetch a turn; with `wait` the server holds the request until the turn
    /// is handled (or its own deadline passes and it returns the turn as-is).
    async fn get_turn(
        &self,
        conversation_id: &str,
        turn_id: u64,
        wait: bool,
    ) -> Result<Turn, BackendError>;
}

#[derive(Serialize)]
struct CreateConversationRequest<'a> {
    bot_id: u64,
    user_identity: &'a str,
    lang: &'a str,
}

#[derive(Serialize)]
struct PostToConversationRequest<'a> {
    content: &'a str,
    category: &'a str,
}

/// reqwest-backed client. Authenticates with the app id header; optional
/// debug mode logs response bodies.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    app_id: String,
    debug: bool,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(host: impl Into<String>, app_id: impl Into<String>, debug: bool) -> Self {
        let base_url = host.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            app_id: app_id.into(),
            debug,
            client: reqwest::Client::new(),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        res: reqwest::Response,
    ) -> Result<T, BackendError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BackendError::Api(format!("{} {}", status, body)));
        }
        if self.debug {
            let body = res.text().await?;
            log::debug!("backend response: {}", body);
            return serde_json::from_str(&body)
                .map_err(|e| BackendError::Api(format!("decode error: {}", e)));
        }
        Ok(res.json().await?)
    }
}

#[async_trait]
impl ConversationBackend for HttpBackend {
    async fn create_conversation(
        &self,
        bot_id: u64,
        user_identity: &str,
        lang: &str,
    ) -> Result<Conversation, BackendError> {
        let url = format!("{}/conversations", self.base_url);
        let res = self
            .client
            .post(&url)
            .header("X-BOTASTIC-APPID", &self.app_id)
            .json(&CreateConversationRequest {
                bot_id,
                user_identity,
                lang,
            })
            .send()
            .await?;
        self.decode(res).await
    }

    async fn post_to_conversation(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<TurnRef, BackendError> {
        let url = format!("{}/conversations/{}", self.base_url, conversation_id);
        let res = self
            .client
            .post(&url)
            .header("X-BOTASTIC-APPID", &self.app_id)
            .json(&PostToConversationRequest {
                content,
                category: "plain-text",
            })
            .send()
            .await?;
        self.decode(res).await
    }

    async fn get_turn(
        &self,
        conversation_id: &str,
        turn_id: u64,
        wait: bool,
    ) -> Result<Turn, BackendError> {
        let url = format!(
            "{}/conversations/{}/{}?wait={}",
            self.base_url, conversation_id, turn_id, wait
        );
        let res = self
            .client
            .get(&url)
            .header("X-BOTASTIC-APPID", &self.app_id)
            .send()
            .await?;
        self.decode(res).await
    }
}
