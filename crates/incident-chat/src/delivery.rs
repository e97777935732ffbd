//! The single write path for chat messages.
//!
//! Sending renders the message locally right away, persists it over REST and
//! then re-broadcasts the persisted copy on the live channel so other room
//! members see it without waiting for a poll. The broadcast is best-effort;
//! persistence is what makes a message real.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ChatApi, OutgoingMessage};
use crate::connection::ConnectionManager;
use crate::error::{ChatError, Result};
use crate::model::{Attachment, CurrentUser, Message, MessageType};
use crate::protocol::OutboundFrame;
use crate::store::StoreHandle;

/// Longest message body the backend accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Clone)]
pub struct DeliveryCoordinator {
    api: Arc<dyn ChatApi>,
    connection: ConnectionManager,
    store: StoreHandle,
    user: CurrentUser,
    conversation_id: String,
}

impl DeliveryCoordinator {
    pub fn new(
        api: Arc<dyn ChatApi>,
        connection: ConnectionManager,
        store: StoreHandle,
        user: CurrentUser,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            connection,
            store,
            user,
            conversation_id: conversation_id.into(),
        }
    }

    /// Send a message and return the persisted copy.
    ///
    /// On a persistence failure the optimistic entry stays in the timeline.
    pub async fn send(&self, content: &str, attachments: Vec<Attachment>) -> Result<Message> {
        let content = validate_content(content)?;
        let message_type = if attachments.is_empty() {
            MessageType::Text
        } else {
            MessageType::File
        };

        let optimistic = Message {
            id: format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()),
            sender_id: self.user.id.clone(),
            sender_name: self.user.name.clone(),
            sender_role: self.user.role,
            content: content.clone(),
            created_at: Utc::now(),
            attachments,
            is_read: false,
            message_type,
        };
        let client_id = optimistic.id.clone();
        self.store.append_optimistic(optimistic.clone()).await?;

        let request = OutgoingMessage {
            content,
            message_type,
            attachments: optimistic
                .attachments
                .iter()
                .map(|a| a.file_id.clone())
                .collect(),
        };
        let sent = match self.api.send_message(&self.conversation_id, &request).await {
            Ok(sent) => sent,
            Err(err) => {
                warn!(conversation_id = %self.conversation_id, "persist failed: {}", err);
                // The bubble stays, but no server copy will ever belong to it.
                self.store.abandon(&client_id).await?;
                return Err(ChatError::Send(err.to_string()));
            }
        };

        self.store.acknowledge(&client_id, &sent.message_id).await?;
        info!(conversation_id = %self.conversation_id, message_id = %sent.message_id, "message sent");

        let persisted = Message {
            id: sent.message_id,
            ..optimistic
        };
        self.broadcast(&persisted);
        Ok(persisted)
    }

    fn broadcast(&self, message: &Message) {
        if !self.connection.is_open() {
            debug!(conversation_id = %self.conversation_id, "channel not open, skipping broadcast");
            return;
        }
        let frame = OutboundFrame::NewMessage {
            message: message.clone(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.connection.send(&frame) {
            debug!(conversation_id = %self.conversation_id, "broadcast skipped: {}", err);
        }
    }
}

/// Trim and check a message body.
pub fn validate_content(content: &str) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidMessage("message is empty".to_string()));
    }
    let chars = trimmed.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(ChatError::InvalidMessage(format!(
            "message is {chars} characters, the limit is {MAX_MESSAGE_CHARS}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Whether `id` was assigned locally rather than by the server.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}
