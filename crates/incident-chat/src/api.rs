//! REST access to the messaging backend.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::auth::TokenProvider;
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::model::{
    Conversation, ConversationType, Message, MessageType, WireConversation, WireMessage,
};

/// Body of `POST /conversations`.
#[derive(Debug, Clone, Serialize)]
pub struct NewConversation {
    pub conversation_type: ConversationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    /// Participant user ids.
    pub participants: Vec<String>,
}

/// Body of `POST /conversations/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub content: String,
    pub message_type: MessageType,
    /// File ids of already uploaded attachments.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

/// Acknowledgement of a persisted message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
    /// Human readable status line.
    #[serde(default)]
    pub message: Option<String>,
}

/// The messaging endpoints the core consumes.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET /conversations`
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// `POST /conversations`
    async fn create_conversation(&self, request: &NewConversation) -> Result<Conversation>;

    /// `GET /conversations/{id}`
    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation>;

    /// `GET /conversations/{id}/messages`
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// `POST /conversations/{id}/messages`
    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutgoingMessage,
    ) -> Result<SentMessage>;

    /// `GET /conversations/incident/{incident_id}`. The backend creates the
    /// conversation when the incident has none yet.
    async fn conversation_for_incident(&self, incident_id: &str) -> Result<Conversation>;
}

#[derive(Deserialize)]
struct ConversationList {
    #[serde(default)]
    conversations: Vec<WireConversation>,
}

#[derive(Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<Value>,
}

/// [`ChatApi`] over HTTP with bearer authentication.
#[derive(Clone)]
pub struct HttpChatApi {
    base_url: Url,
    http: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpChatApi {
    pub fn new(config: &ChatConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            base_url: config.api_base_url.clone(),
            http,
            tokens,
        })
    }

    /// Append `segments` to the base URL, each one percent-encoded on its own.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ChatError::Config(format!("API base URL cannot have a path: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let url = self.url(segments)?;
        let token = self
            .tokens
            .token()
            .await
            .map_err(|err| ChatError::Auth(err.to_string()))?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token.expose_secret()))
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await?;
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|parsed| parsed.detail)
            .map(|detail| match detail {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .unwrap_or(body);
        Err(ChatError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let request = self.request(Method::GET, &["conversations"]).await?;
        let body: ConversationList = self.execute(request).await?.json().await?;
        Ok(body
            .conversations
            .into_iter()
            .map(WireConversation::into_conversation)
            .collect())
    }

    async fn create_conversation(&self, request: &NewConversation) -> Result<Conversation> {
        let builder = self.request(Method::POST, &["conversations"]).await?.json(request);
        let body: WireConversation = self.execute(builder).await?.json().await?;
        Ok(body.into_conversation())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let request = self
            .request(Method::GET, &["conversations", conversation_id])
            .await?;
        let body: WireConversation = self.execute(request).await?.json().await?;
        Ok(body.into_conversation())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let request = self
            .request(Method::GET, &["conversations", conversation_id, "messages"])
            .await?;
        let body: MessageList = self.execute(request).await?.json().await?;
        Ok(normalize_messages(body.messages))
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutgoingMessage,
    ) -> Result<SentMessage> {
        let builder = self
            .request(Method::POST, &["conversations", conversation_id, "messages"])
            .await?
            .json(message);
        let body: SentMessage = self.execute(builder).await?.json().await?;
        Ok(body)
    }

    async fn conversation_for_incident(&self, incident_id: &str) -> Result<Conversation> {
        let request = self
            .request(Method::GET, &["conversations", "incident", incident_id])
            .await?;
        let body: WireConversation = self.execute(request).await?.json().await?;
        Ok(body.into_conversation())
    }
}

/// Normalize a pulled message list, skipping entries that cannot be read.
pub(crate) fn normalize_messages(raw: Vec<Value>) -> Vec<Message> {
    raw.into_iter()
        .filter_map(|value| serde_json::from_value::<WireMessage>(value).ok())
        .filter_map(|wire| wire.into_message(None))
        .collect()
}
