//! Data model: messages, conversations and the acting user.
//!
//! The public types are strict. Payloads from the backend are read through
//! lenient `Wire*` mirrors first, because the same logical message shows up in
//! several shapes (REST list, room broadcast, global broadcast) with fields
//! missing or renamed.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message sender or conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    #[default]
    Employee,
    SecurityTeam,
    Admin,
}

impl SenderRole {
    /// Parse a wire value; unknown roles are treated as `Employee`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "security_team" => SenderRole::SecurityTeam,
            "admin" => SenderRole::Admin,
            _ => SenderRole::Employee,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Employee => "employee",
            SenderRole::SecurityTeam => "security_team",
            SenderRole::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    File,
    System,
}

impl MessageType {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "file" => MessageType::File,
            "system" => MessageType::System,
            _ => MessageType::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::File => "file",
            MessageType::System => "system",
        }
    }
}

/// Reference to an uploaded file. The upload pipeline owns the file itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl Attachment {
    pub fn from_id(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            filename: None,
            file_size: None,
            file_type: None,
            file_url: None,
        }
    }
}

/// One chat message.
///
/// Immutable once stored, except for `is_read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: SenderRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub message_type: MessageType,
}

impl Message {
    /// Timeline sort key: `created_at`, then `id`.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    IncidentChat,
    TeamInternal,
    DirectMessage,
    General,
}

impl ConversationType {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "incident_chat" => Some(ConversationType::IncidentChat),
            "team_internal" => Some(ConversationType::TeamInternal),
            "direct_message" => Some(ConversationType::DirectMessage),
            "general" => Some(ConversationType::General),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub name: String,
    pub role: SenderRole,
}

/// Summary of the most recent message, as reported by the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub sender: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub incident_id: Option<String>,
    /// Unique by `user_id`.
    pub participants: Vec<Participant>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u64,
    pub created_at: Option<DateTime<Utc>>,
}

/// The user this core acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: String,
    pub name: String,
    pub role: SenderRole,
}

impl CurrentUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: SenderRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }
}

/// Parse the timestamp formats the backend emits: RFC 3339, or ISO-8601
/// without an offset (taken as UTC), with `T` or a space as separator.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Read a timestamp that may be a string or a unix epoch number (seconds or
/// milliseconds).
pub(crate) fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_timestamp(raw),
        Value::Number(n) => {
            let n = n.as_f64()?;
            let millis = if n.abs() >= 1e11 { n } else { n * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

/// Read an identifier that may be sent as a string or a number.
pub(crate) fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireAttachment {
    Id(String),
    Full(Attachment),
}

impl From<WireAttachment> for Attachment {
    fn from(value: WireAttachment) -> Self {
        match value {
            WireAttachment::Id(id) => Attachment::from_id(id),
            WireAttachment::Full(attachment) => attachment,
        }
    }
}

/// Lenient mirror of a message payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub message_id: Option<Value>,
    #[serde(default)]
    pub sender_id: Option<Value>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub sender_role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub attachments: Option<Vec<WireAttachment>>,
    #[serde(default)]
    pub is_read: Option<bool>,
    #[serde(default)]
    pub message_type: Option<String>,
}

impl WireMessage {
    /// Normalize into a [`Message`]. Returns `None` when no id is present,
    /// since such a payload cannot be de-duplicated.
    ///
    /// `fallback_timestamp` is the enclosing frame's timestamp, if any.
    pub(crate) fn into_message(self, fallback_timestamp: Option<&Value>) -> Option<Message> {
        let id = self
            .id
            .as_ref()
            .and_then(id_from_value)
            .or_else(|| self.message_id.as_ref().and_then(id_from_value))?;

        let created_at = self
            .created_at
            .as_ref()
            .and_then(timestamp_from_value)
            .or_else(|| self.timestamp.as_ref().and_then(timestamp_from_value))
            .or_else(|| fallback_timestamp.and_then(timestamp_from_value))
            .unwrap_or_else(Utc::now);

        Some(Message {
            id,
            sender_id: self
                .sender_id
                .as_ref()
                .and_then(id_from_value)
                .unwrap_or_default(),
            sender_name: self.sender_name.or(self.sender).unwrap_or_default(),
            sender_role: self
                .sender_role
                .as_deref()
                .map(SenderRole::from_wire)
                .unwrap_or_default(),
            content: self.content.unwrap_or_default(),
            created_at,
            attachments: self
                .attachments
                .unwrap_or_default()
                .into_iter()
                .map(Attachment::from)
                .collect(),
            is_read: self.is_read.unwrap_or(false),
            message_type: self
                .message_type
                .as_deref()
                .map(MessageType::from_wire)
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireParticipant {
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_role: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Lenient mirror of a conversation payload.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireConversation {
    pub id: String,
    #[serde(default)]
    pub conversation_type: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub incident_id: Option<String>,
    #[serde(default)]
    pub participants: Option<Vec<WireParticipant>>,
    #[serde(default)]
    pub last_message_content: Option<String>,
    #[serde(default)]
    pub last_message_sender: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<String>,
    #[serde(default)]
    pub unread_count: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl WireConversation {
    pub(crate) fn into_conversation(self) -> Conversation {
        let conversation_type = self
            .conversation_type
            .as_deref()
            .or(self.kind.as_deref())
            .and_then(ConversationType::from_wire)
            .unwrap_or(if self.incident_id.is_some() {
                ConversationType::IncidentChat
            } else {
                ConversationType::DirectMessage
            });

        let mut seen = HashSet::new();
        let participants = self
            .participants
            .unwrap_or_default()
            .into_iter()
            .filter(|p| seen.insert(p.user_id.clone()))
            .map(|p| Participant {
                name: p.user_name.or(p.name).unwrap_or_default(),
                role: p
                    .user_role
                    .as_deref()
                    .or(p.role.as_deref())
                    .map(SenderRole::from_wire)
                    .unwrap_or_default(),
                user_id: p.user_id,
            })
            .collect();

        let last_message = self.last_message_content.map(|content| LastMessage {
            content,
            sender: self.last_message_sender,
            sent_at: self.last_message_time.as_deref().and_then(parse_timestamp),
        });

        Conversation {
            id: self.id,
            conversation_type,
            title: self.title,
            incident_id: self.incident_id,
            participants,
            last_message,
            unread_count: self.unread_count.unwrap_or(0),
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
        }
    }
}
