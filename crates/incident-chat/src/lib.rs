//! Realtime messaging core for the incident dashboard.
//!
//! This crate provides:
//! - Live channel lifecycle with fixed-delay reconnects ([`ConnectionManager`])
//! - Incident to conversation resolution with per-session caching
//! - An ordered, de-duplicated message timeline fed by REST pulls, live
//!   pushes and optimistic local echoes
//! - Fallback polling while the live channel is down
//! - Process-wide notifications over the general channel
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use incident_chat::{ChatClient, ChatConfig, ConversationRef, CurrentUser, SenderRole, StaticToken};
//!
//! #[tokio::main]
//! async fn main() -> incident_chat::Result<()> {
//!     let user = CurrentUser::new("u1", "Ana", SenderRole::Employee);
//!     let client = ChatClient::connect(ChatConfig::load()?, Arc::new(StaticToken::new("token")), user)?;
//!
//!     let thread = client.thread_session();
//!     thread.open(ConversationRef::Incident("inc-42".into())).await?;
//!     thread.send("Is anyone looking at this?", Vec::new()).await?;
//!
//!     let mut timeline = thread.watch_messages();
//!     while timeline.changed().await.is_ok() {
//!         for message in timeline.borrow().iter() {
//!             println!("{}: {}", message.sender_name, message.content);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod model;
pub mod notifications;
pub mod polling;
pub mod protocol;
pub mod resolver;
pub mod store;
pub mod thread;
pub mod transport;

pub use api::{ChatApi, HttpChatApi, NewConversation, OutgoingMessage, SentMessage};
pub use auth::{SecretString, StaticToken, TokenProvider};
pub use client::ChatClient;
pub use config::ChatConfig;
pub use connection::{ChannelEvent, ConnectionManager, ConnectionState, ConnectionStatus};
pub use delivery::{DeliveryCoordinator, MAX_MESSAGE_CHARS};
pub use error::{ChatError, Result};
pub use model::{
    Attachment, Conversation, ConversationType, CurrentUser, LastMessage, Message, MessageType,
    Participant, SenderRole,
};
pub use notifications::{
    DispatchEvent, NotificationDispatcher, RefreshSubscription, RefreshTopic, Toast, ToastLevel,
};
pub use polling::PollingFallback;
pub use protocol::{Notice, NoticeKind, OutboundFrame, Room, ServerEvent};
pub use resolver::{ConversationRef, ConversationResolver, ResolvedConversation};
pub use store::{MessageStore, StoreHandle};
pub use thread::{ThreadSession, TypingUsers};
pub use transport::{Connector, Socket, SocketFrame, SocketSink, WsConnector};
