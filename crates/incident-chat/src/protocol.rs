//! Live channel wire protocol.
//!
//! Every frame is a JSON object discriminated by its `type` field:
//! - Client to server: `join_room`, `leave_room`, `new_message`, `message`, `ping`
//! - Server to client: chat messages (`new_message`, `incident_message`,
//!   `message`), `typing`, `unread_count`, incident/notification notices, and
//!   connection housekeeping (`connection_established`, `room_joined`, `pong`,
//!   `token_refresh_required`, `error`)
//!
//! Parsing never fails loudly: anything that is not JSON, has no `type`, or
//! has an unknown `type` is ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::auth::SecretString;
use crate::error::{ChatError, Result};
use crate::model::{Message, WireMessage, id_from_value};

const GENERAL_ROOM: &str = "general";

/// A server-side broadcast group a live connection joins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// The per-conversation room backing a thread view.
    Conversation(String),
    /// The process-wide notification room.
    General,
}

impl Room {
    /// Room id as the server names it.
    pub fn room_id(&self) -> String {
        match self {
            Room::Conversation(id) => format!("conversation_{id}"),
            Room::General => GENERAL_ROOM.to_string(),
        }
    }

    /// Socket URL for this room. Contains the token, so never log it.
    pub fn socket_url(&self, base: &Url, token: &SecretString, user_id: &str) -> Result<Url> {
        let mut url = base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ChatError::Config(format!("socket base URL cannot have a path: {base}"))
            })?;
            segments.pop_if_empty().push("ws");
            match self {
                Room::Conversation(id) => segments.push(id),
                Room::General => segments.push(GENERAL_ROOM),
            };
        }
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("token", token.expose_secret());
            if *self == Room::General {
                query.append_pair("user_id", user_id);
            }
        }
        Ok(url)
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.room_id())
    }
}

/// Frames sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    JoinRoom {
        room_id: String,
        user_id: String,
    },
    LeaveRoom {
        room_id: String,
        user_id: String,
    },
    /// Re-broadcast of a persisted message so room members see it right away.
    NewMessage {
        message: Message,
        timestamp: DateTime<Utc>,
    },
    /// Free-form message on the general channel.
    Message {
        content: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
}

impl OutboundFrame {
    pub fn join(room: &Room, user_id: &str) -> Self {
        OutboundFrame::JoinRoom {
            room_id: room.room_id(),
            user_id: user_id.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Frame `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::JoinRoom { .. } => "join_room",
            OutboundFrame::LeaveRoom { .. } => "leave_room",
            OutboundFrame::NewMessage { .. } => "new_message",
            OutboundFrame::Message { .. } => "message",
            OutboundFrame::Ping { .. } => "ping",
        }
    }
}

/// Named notice kinds routed by the notification dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    Notification,
    IncidentUpdate,
    SecurityAlert,
    SystemMessage,
    NewIncident,
    IncidentAssigned,
    IncidentResolved,
}

impl NoticeKind {
    fn from_type(kind: &str) -> Option<Self> {
        Some(match kind {
            "notification" => NoticeKind::Notification,
            "incident_update" | "incident_updated" => NoticeKind::IncidentUpdate,
            "security_alert" => NoticeKind::SecurityAlert,
            "system_message" => NoticeKind::SystemMessage,
            "new_incident" => NoticeKind::NewIncident,
            "incident_assigned" => NoticeKind::IncidentAssigned,
            "incident_resolved" => NoticeKind::IncidentResolved,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Notification => "notification",
            NoticeKind::IncidentUpdate => "incident_update",
            NoticeKind::SecurityAlert => "security_alert",
            NoticeKind::SystemMessage => "system_message",
            NoticeKind::NewIncident => "new_incident",
            NoticeKind::IncidentAssigned => "incident_assigned",
            NoticeKind::IncidentResolved => "incident_resolved",
        }
    }
}

/// A named event with the few fields views care about pulled out.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub incident_id: Option<String>,
    pub title: Option<String>,
    pub message: Option<String>,
    /// The full frame, for consumers that need more.
    pub payload: Value,
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Message {
        message: Message,
        conversation_id: Option<String>,
    },
    Typing {
        user_id: String,
        user_name: Option<String>,
        is_typing: bool,
    },
    UnreadCount(u64),
    Notice(Notice),
    ConnectionEstablished,
    RoomJoined {
        room_id: Option<String>,
    },
    Pong,
    TokenRefreshRequired,
    Error(String),
}

impl ServerEvent {
    /// Parse one text frame. Returns `None` for anything unusable.
    pub fn parse(text: &str) -> Option<Self> {
        let frame: Value = serde_json::from_str(text).ok()?;
        let kind = frame.get("type")?.as_str()?;

        match kind {
            "new_message" | "incident_message" | "message" => parse_chat_message(&frame),
            "typing" => {
                let user_id = frame.get("user_id").and_then(id_from_value)?;
                let is_typing = frame
                    .get("is_typing")
                    .or_else(|| frame.get("typing"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Some(ServerEvent::Typing {
                    user_id,
                    user_name: str_field(&frame, "user_name"),
                    is_typing,
                })
            }
            "unread_count" => frame
                .get("count")
                .and_then(Value::as_u64)
                .map(ServerEvent::UnreadCount),
            "connection_established" => Some(ServerEvent::ConnectionEstablished),
            "room_joined" => Some(ServerEvent::RoomJoined {
                room_id: str_field(&frame, "room_id"),
            }),
            "pong" => Some(ServerEvent::Pong),
            "token_refresh_required" => Some(ServerEvent::TokenRefreshRequired),
            "error" => Some(ServerEvent::Error(
                str_field(&frame, "message").unwrap_or_else(|| "unspecified server error".into()),
            )),
            other => {
                let kind = NoticeKind::from_type(other)?;
                Some(ServerEvent::Notice(Notice {
                    kind,
                    incident_id: frame.get("incident_id").and_then(id_from_value),
                    title: str_field(&frame, "title"),
                    message: str_field(&frame, "message")
                        .or_else(|| str_field(&frame, "content")),
                    payload: frame,
                }))
            }
        }
    }
}

/// Chat messages arrive either nested under `message` (room broadcasts) or
/// flattened into the frame (global broadcasts from the incident API).
fn parse_chat_message(frame: &Value) -> Option<ServerEvent> {
    let body = match frame.get("message") {
        Some(inner @ Value::Object(_)) => inner.clone(),
        _ => frame.clone(),
    };
    let wire: WireMessage = serde_json::from_value(body).ok()?;
    let message = wire.into_message(frame.get("timestamp"))?;
    let conversation_id = frame
        .get("conversation_id")
        .or_else(|| frame.get("incident_id"))
        .and_then(id_from_value);
    Some(ServerEvent::Message {
        message,
        conversation_id,
    })
}

fn str_field(frame: &Value, key: &str) -> Option<String> {
    frame.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SenderRole;
    use serde_json::json;

    #[test]
    fn conversation_socket_url_carries_token_only() {
        let base = Url::parse("wss://sec.example.com/api/messaging").unwrap();
        let token = SecretString::new("tok en");
        let url = Room::Conversation("c-1".into())
            .socket_url(&base, &token, "u1")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://sec.example.com/api/messaging/ws/c-1?token=tok+en"
        );
    }

    #[test]
    fn general_socket_url_carries_user_id() {
        let base = Url::parse("ws://localhost:8000/api/messaging/").unwrap();
        let token = SecretString::new("t");
        let url = Room::General.socket_url(&base, &token, "u1").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8000/api/messaging/ws/general?token=t&user_id=u1"
        );
    }

    #[test]
    fn room_ids_match_server_naming() {
        assert_eq!(Room::Conversation("abc".into()).room_id(), "conversation_abc");
        assert_eq!(Room::General.room_id(), "general");
    }

    #[test]
    fn join_frame_encoding() {
        let frame = OutboundFrame::join(&Room::Conversation("c1".into()), "u1");
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "join_room", "room_id": "conversation_c1", "user_id": "u1" })
        );
    }

    #[test]
    fn parses_nested_incident_message() {
        let text = json!({
            "type": "incident_message",
            "conversation_id": "c1",
            "user_id": "u2",
            "message": {
                "id": "m1",
                "sender_id": "u2",
                "sender_name": "Dana",
                "sender_role": "admin",
                "content": "on it",
                "created_at": "2024-03-09T14:05:07",
                "message_type": "text",
                "attachments": [],
                "is_read": false
            },
            "timestamp": "2024-03-09T14:05:07"
        })
        .to_string();

        match ServerEvent::parse(&text) {
            Some(ServerEvent::Message {
                message,
                conversation_id,
            }) => {
                assert_eq!(message.id, "m1");
                assert_eq!(message.sender_role, SenderRole::Admin);
                assert_eq!(conversation_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn parses_flat_new_message() {
        let text = json!({
            "type": "new_message",
            "incident_id": "inc-1",
            "message_id": "m9",
            "sender": "Reporter",
            "content": "more details"
        })
        .to_string();

        let Some(ServerEvent::Message {
            message,
            conversation_id,
        }) = ServerEvent::parse(&text)
        else {
            panic!("expected a message event");
        };
        assert_eq!(message.id, "m9");
        assert_eq!(message.sender_name, "Reporter");
        assert_eq!(conversation_id.as_deref(), Some("inc-1"));
    }

    #[test]
    fn parses_typing_and_unread() {
        assert_eq!(
            ServerEvent::parse(r#"{"type":"typing","user_id":"u2","is_typing":false}"#),
            Some(ServerEvent::Typing {
                user_id: "u2".into(),
                user_name: None,
                is_typing: false
            })
        );
        assert_eq!(
            ServerEvent::parse(r#"{"type":"unread_count","count":7}"#),
            Some(ServerEvent::UnreadCount(7))
        );
    }

    #[test]
    fn parses_notices_with_aliases() {
        let Some(ServerEvent::Notice(notice)) = ServerEvent::parse(
            r#"{"type":"incident_updated","incident_id":"inc-3","status":"resolved"}"#,
        ) else {
            panic!("expected a notice");
        };
        assert_eq!(notice.kind, NoticeKind::IncidentUpdate);
        assert_eq!(notice.incident_id.as_deref(), Some("inc-3"));
        assert_eq!(notice.payload["status"], "resolved");
    }

    #[test]
    fn drops_garbage_and_unknown_frames() {
        assert_eq!(ServerEvent::parse("not json"), None);
        assert_eq!(ServerEvent::parse("[1,2,3]"), None);
        assert_eq!(ServerEvent::parse(r#"{"kind":"typing"}"#), None);
        assert_eq!(ServerEvent::parse(r#"{"type":"mystery"}"#), None);
        assert_eq!(ServerEvent::parse(r#"{"type":"message","content":"no id"}"#), None);
    }
}
