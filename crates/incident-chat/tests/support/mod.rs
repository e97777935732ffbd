//! In-process messaging backend for integration tests.
//!
//! [`FakeBackend`] plays both the REST API and the socket server. Rooms are
//! keyed by the last socket path segment (a conversation id or `general`),
//! the token in the socket URL is taken as the user id, and the broadcast
//! rules mirror the real server: persisted messages and relayed
//! `new_message` frames go to every socket in the room, sender included.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use incident_chat::{
    ChatApi, ChatClient, ChatConfig, ChatError, ConnectionStatus, Connector, Conversation,
    ConversationType, CurrentUser, Message, MessageType, NewConversation, OutgoingMessage,
    Participant, Result, SenderRole, SentMessage, Socket, SocketFrame, SocketSink, StaticToken,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use url::Url;

pub fn alice() -> CurrentUser {
    CurrentUser::new("alice", "Alice", SenderRole::Employee)
}

pub fn bob() -> CurrentUser {
    CurrentUser::new("bob", "Bob", SenderRole::SecurityTeam)
}

pub fn test_config() -> ChatConfig {
    ChatConfig {
        reconnect_delay: Duration::from_secs(3),
        poll_interval: Duration::from_secs(5),
        ping_interval: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(10),
        ..ChatConfig::default()
    }
}

/// Let every spawned task run until it blocks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub async fn wait_for_status(
    status: &mut watch::Receiver<ConnectionStatus>,
    predicate: impl FnMut(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    tokio::time::timeout(Duration::from_secs(60), status.wait_for(predicate))
        .await
        .expect("status never matched")
        .expect("connection manager dropped")
        .clone()
}

pub fn message_from(user: &CurrentUser, id: &str, content: &str) -> Message {
    Message {
        id: id.to_string(),
        sender_id: user.id.clone(),
        sender_name: user.name.clone(),
        sender_role: user.role,
        content: content.to_string(),
        created_at: Utc::now(),
        attachments: Vec::new(),
        is_read: false,
        message_type: MessageType::Text,
    }
}

/// A room broadcast of `message`, shaped like the server's.
pub fn incident_message_frame(conversation_id: &str, message: &Message) -> Value {
    json!({
        "type": "incident_message",
        "conversation_id": conversation_id,
        "incident_id": conversation_id,
        "user_id": message.sender_id,
        "sender": message.sender_name,
        "message": message,
        "timestamp": message.created_at,
    })
}

struct SocketEntry {
    id: u64,
    room: String,
    user_id: String,
    tx: mpsc::UnboundedSender<Result<SocketFrame>>,
}

#[derive(Default)]
struct State {
    conversations: HashMap<String, Conversation>,
    incidents: HashMap<String, String>,
    messages: HashMap<String, Vec<Message>>,
    sockets: Vec<SocketEntry>,
    next_id: u64,
    connects: usize,
    tokens_seen: Vec<String>,
    list_calls: HashMap<String, usize>,
    incident_calls: usize,
    /// (user id, frame) for every frame a client sent.
    received: Vec<(String, Value)>,
    refuse_connections: bool,
    hang_connections: bool,
    fail_sends: bool,
    resolve_delay: Option<Duration>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn broadcast(&mut self, room: &str, frame: &Value) {
        let text = frame.to_string();
        self.sockets.retain(|socket| {
            socket.room != room || socket.tx.send(Ok(SocketFrame::Text(text.clone()))).is_ok()
        });
    }

    fn reply(&self, socket_id: u64, frame: Value) {
        if let Some(socket) = self.sockets.iter().find(|s| s.id == socket_id) {
            let _ = socket.tx.send(Ok(SocketFrame::Text(frame.to_string())));
        }
    }
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conversation(&self, id: &str, incident_id: Option<&str>) {
        let mut state = self.state.lock();
        state
            .conversations
            .insert(id.to_string(), conversation(id, incident_id));
        if let Some(incident_id) = incident_id {
            state.incidents.insert(incident_id.to_string(), id.to_string());
        }
        state.messages.entry(id.to_string()).or_default();
    }

    /// Persist a message without broadcasting it.
    pub fn insert_message(&self, conversation_id: &str, message: Message) {
        self.state
            .lock()
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn api_for(self: &Arc<Self>, user: &CurrentUser) -> Arc<FakeApi> {
        Arc::new(FakeApi {
            backend: Arc::clone(self),
            user: user.clone(),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            backend: Arc::clone(self),
        })
    }

    pub fn client_for(self: &Arc<Self>, user: CurrentUser) -> ChatClient {
        ChatClient::with_parts(
            test_config(),
            self.api_for(&user),
            self.connector(),
            Arc::new(StaticToken::new(user.id.clone())),
            user,
        )
    }

    /// Send a server frame to every socket in `room`.
    pub fn push(&self, room: &str, frame: Value) {
        self.state.lock().broadcast(room, &frame);
    }

    /// Send raw text to every socket in `room`.
    pub fn push_text(&self, room: &str, text: &str) {
        let mut state = self.state.lock();
        state.sockets.retain(|socket| {
            socket.room != room || socket.tx.send(Ok(SocketFrame::Text(text.to_string()))).is_ok()
        });
    }

    /// Close every socket in `room` from the server side.
    pub fn drop_sockets(&self, room: &str, code: Option<u16>) {
        let mut state = self.state.lock();
        state.sockets.retain(|socket| {
            if socket.room == room {
                let _ = socket.tx.send(Ok(SocketFrame::Close(code)));
                false
            } else {
                true
            }
        });
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    pub fn set_hang_connections(&self, hang: bool) {
        self.state.lock().hang_connections = hang;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    pub fn set_resolve_delay(&self, delay: Duration) {
        self.state.lock().resolve_delay = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.state.lock().tokens_seen.clone()
    }

    pub fn open_sockets(&self, room: &str) -> usize {
        self.state
            .lock()
            .sockets
            .iter()
            .filter(|s| s.room == room && !s.tx.is_closed())
            .count()
    }

    pub fn list_calls(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .list_calls
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn incident_calls(&self) -> usize {
        self.state.lock().incident_calls
    }

    pub fn stored_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Frames of `kind` that `user_id` sent.
    pub fn frames_from(&self, user_id: &str, kind: &str) -> Vec<Value> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(sender, frame)| sender == user_id && frame["type"] == kind)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    fn on_client_frame(&self, socket_id: u64, text: &str) {
        let mut state = self.state.lock();
        let Some((room, user_id)) = state
            .sockets
            .iter()
            .find(|s| s.id == socket_id)
            .map(|s| (s.room.clone(), s.user_id.clone()))
        else {
            return;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            state.reply(socket_id, json!({ "type": "error", "message": "Invalid message format" }));
            return;
        };
        state.received.push((user_id.clone(), frame.clone()));

        match frame["type"].as_str() {
            Some("join_room") => state.reply(
                socket_id,
                json!({ "type": "room_joined", "room_id": frame["room_id"] }),
            ),
            Some("ping") => state.reply(
                socket_id,
                json!({ "type": "pong", "timestamp": frame["timestamp"] }),
            ),
            Some("new_message") if frame["message"].is_object() => {
                let relayed = json!({
                    "type": "incident_message",
                    "conversation_id": room,
                    "user_id": user_id,
                    "message": frame["message"],
                    "timestamp": frame["timestamp"],
                });
                state.broadcast(&room, &relayed);
            }
            _ => {}
        }
    }

    fn remove_socket(&self, socket_id: u64) {
        self.state.lock().sockets.retain(|s| s.id != socket_id);
    }
}

fn conversation(id: &str, incident_id: Option<&str>) -> Conversation {
    Conversation {
        id: id.to_string(),
        conversation_type: if incident_id.is_some() {
            ConversationType::IncidentChat
        } else {
            ConversationType::TeamInternal
        },
        title: incident_id.map(|incident| format!("Incident {incident}")),
        incident_id: incident_id.map(str::to_string),
        participants: vec![
            Participant {
                user_id: "alice".into(),
                name: "Alice".into(),
                role: SenderRole::Employee,
            },
            Participant {
                user_id: "bob".into(),
                name: "Bob".into(),
                role: SenderRole::SecurityTeam,
            },
        ],
        last_message: None,
        unread_count: 0,
        created_at: Some(Utc::now()),
    }
}

/// REST view of the backend as one user.
pub struct FakeApi {
    backend: Arc<FakeBackend>,
    user: CurrentUser,
}

fn not_found(what: &str) -> ChatError {
    ChatError::Api {
        status: 404,
        message: format!("{what} not found"),
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self
            .backend
            .state
            .lock()
            .conversations
            .values()
            .cloned()
            .collect())
    }

    async fn create_conversation(&self, request: &NewConversation) -> Result<Conversation> {
        let mut state = self.backend.state.lock();
        let id = format!("conv-{}", state.next_id());
        let mut created = conversation(&id, request.incident_id.as_deref());
        created.conversation_type = request.conversation_type;
        created.title = request.title.clone();
        state.conversations.insert(id.clone(), created.clone());
        state.messages.entry(id).or_default();
        Ok(created)
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.backend
            .state
            .lock()
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| not_found("Conversation"))
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut state = self.backend.state.lock();
        *state
            .list_calls
            .entry(conversation_id.to_string())
            .or_default() += 1;
        state
            .messages
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| not_found("Conversation"))
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutgoingMessage,
    ) -> Result<SentMessage> {
        let mut state = self.backend.state.lock();
        if state.fail_sends {
            return Err(ChatError::Api {
                status: 500,
                message: "Failed to send message".into(),
            });
        }
        if !state.conversations.contains_key(conversation_id) {
            return Err(not_found("Conversation"));
        }

        let id = format!("srv-{}", state.next_id());
        let mut persisted = message_from(&self.user, &id, &message.content);
        persisted.message_type = message.message_type;
        state
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(persisted.clone());
        let frame = incident_message_frame(conversation_id, &persisted);
        state.broadcast(conversation_id, &frame);

        Ok(SentMessage {
            message_id: id,
            message: Some("Message sent successfully".into()),
        })
    }

    async fn conversation_for_incident(&self, incident_id: &str) -> Result<Conversation> {
        let delay = {
            let mut state = self.backend.state.lock();
            state.incident_calls += 1;
            state.resolve_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.backend.state.lock();
        if let Some(id) = state.incidents.get(incident_id).cloned() {
            return state
                .conversations
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("Conversation"));
        }
        let id = format!("conv-{incident_id}");
        let created = conversation(&id, Some(incident_id));
        state.conversations.insert(id.clone(), created.clone());
        state.incidents.insert(incident_id.to_string(), id.clone());
        state.messages.entry(id).or_default();
        Ok(created)
    }
}

/// Socket side of the backend.
pub struct FakeConnector {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<Socket> {
        let (hang, refuse) = {
            let state = self.backend.state.lock();
            (state.hang_connections, state.refuse_connections)
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        if refuse {
            return Err(ChatError::Connection("connection refused".into()));
        }

        let room = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string();
        let token = url
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        let socket_id = {
            let mut state = self.backend.state.lock();
            state.connects += 1;
            state.tokens_seen.push(token.clone());
            let id = state.next_id();
            let _ = tx.send(Ok(SocketFrame::Text(
                json!({ "type": "connection_established", "user_id": token }).to_string(),
            )));
            state.sockets.push(SocketEntry {
                id,
                room,
                user_id: token,
                tx,
            });
            id
        };

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();

        Ok(Socket {
            sink: Box::new(FakeSink {
                backend: Arc::clone(&self.backend),
                socket_id,
            }),
            stream,
        })
    }
}

struct FakeSink {
    backend: Arc<FakeBackend>,
    socket_id: u64,
}

#[async_trait]
impl SocketSink for FakeSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.backend.on_client_frame(self.socket_id, &text);
        Ok(())
    }

    async fn close(&mut self) {
        self.backend.remove_socket(self.socket_id);
    }
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.backend.remove_socket(self.socket_id);
    }
}
