//! The message timeline for one conversation.
//!
//! [`MessageStore`] is a plain data structure. In a running session it is
//! owned by exactly one task and mutated through a [`StoreHandle`], so the
//! three message sources (REST pulls, live pushes and optimistic local
//! echoes) are applied one at a time in arrival order.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::error::{ChatError, Result};
use crate::model::Message;

/// Ordered, de-duplicated messages.
///
/// Entries are sorted by `created_at`, then `id`, and every id (including
/// server ids recorded as aliases of optimistic entries) appears once.
#[derive(Debug, Clone)]
pub struct MessageStore {
    current_user_id: String,
    messages: Vec<Message>,
    /// Known id or alias -> id of the stored entry.
    ids: HashMap<String, String>,
    /// Optimistic entries whose persisted copy has not been seen yet, oldest first.
    pending: Vec<String>,
}

impl MessageStore {
    pub fn new(current_user_id: impl Into<String>) -> Self {
        Self {
            current_user_id: current_user_id.into(),
            messages: Vec::new(),
            ids: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Insert a message pulled from or pushed by the server. Returns `false`
    /// if the id was already known.
    ///
    /// A server copy of one of our own optimistic messages is folded into the
    /// optimistic entry instead of being shown twice.
    pub fn append_from_server(&mut self, message: Message) -> bool {
        if self.ids.contains_key(&message.id) {
            return false;
        }

        if message.sender_id == self.current_user_id
            && let Some(client_id) = self.take_pending_match(&message)
        {
            debug!(client_id = %client_id, server_id = %message.id, "adopted persisted copy");
            self.ids.insert(message.id, client_id);
            return false;
        }

        self.insert(message);
        true
    }

    /// Insert a locally created message before the server has seen it.
    pub fn append_optimistic(&mut self, message: Message) -> bool {
        if self.ids.contains_key(&message.id) {
            return false;
        }
        self.pending.push(message.id.clone());
        self.insert(message);
        true
    }

    /// Insert a message from the live channel. Our own messages are already
    /// shown optimistically, so they are skipped.
    pub fn append_from_live(&mut self, message: Message) -> bool {
        if message.sender_id == self.current_user_id {
            return false;
        }
        self.append_from_server(message)
    }

    /// Record `server_id` as another name for the optimistic entry
    /// `client_id`. The entry itself is left untouched.
    pub fn acknowledge(&mut self, client_id: &str, server_id: &str) -> bool {
        let Some(target) = self.ids.get(client_id).cloned() else {
            return false;
        };
        self.pending.retain(|id| id != client_id);

        match self.ids.get(server_id) {
            Some(existing) => *existing == target,
            None => {
                self.ids.insert(server_id.to_string(), target);
                true
            }
        }
    }

    /// Stop treating `client_id` as awaiting its persisted copy, after the
    /// persist call failed. The entry stays in the timeline.
    pub fn abandon(&mut self, client_id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|id| id != client_id);
        self.pending.len() != before
    }

    /// Additively merge a pulled list. Returns how many entries were new.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if self.append_from_server(message) {
                inserted += 1;
            }
        }
        inserted
    }

    /// Flag a message as read. Returns `true` if it changed.
    pub fn mark_read(&mut self, id: &str) -> bool {
        let Some(target) = self.ids.get(id) else {
            return false;
        };
        match self.messages.iter_mut().find(|m| &m.id == target) {
            Some(message) if !message.is_read => {
                message.is_read = true;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        let target = self.ids.get(id)?;
        self.messages.iter().find(|m| &m.id == target)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn insert(&mut self, message: Message) {
        let position = self
            .messages
            .partition_point(|existing| existing.order_key() < message.order_key());
        self.ids.insert(message.id.clone(), message.id.clone());
        self.messages.insert(position, message);
    }

    fn take_pending_match(&mut self, message: &Message) -> Option<String> {
        let index = self.pending.iter().position(|client_id| {
            self.messages.iter().any(|m| {
                &m.id == client_id
                    && m.content == message.content
                    && m.attachments == message.attachments
            })
        })?;
        Some(self.pending.remove(index))
    }
}

/// Mutations routed to the task that owns a [`MessageStore`].
#[derive(Debug)]
pub(crate) enum StoreCommand {
    AppendOptimistic(Message, oneshot::Sender<bool>),
    Acknowledge {
        client_id: String,
        server_id: String,
        reply: oneshot::Sender<bool>,
    },
    Abandon(String, oneshot::Sender<bool>),
    Merge(Vec<Message>, oneshot::Sender<usize>),
    MarkRead(String, oneshot::Sender<bool>),
}

impl StoreCommand {
    /// Apply to `store` and answer the caller. Returns whether the visible
    /// timeline changed.
    pub(crate) fn apply(self, store: &mut MessageStore) -> bool {
        match self {
            StoreCommand::AppendOptimistic(message, reply) => {
                let inserted = store.append_optimistic(message);
                let _ = reply.send(inserted);
                inserted
            }
            StoreCommand::Acknowledge {
                client_id,
                server_id,
                reply,
            } => {
                let _ = reply.send(store.acknowledge(&client_id, &server_id));
                false
            }
            StoreCommand::Abandon(client_id, reply) => {
                let _ = reply.send(store.abandon(&client_id));
                false
            }
            StoreCommand::Merge(messages, reply) => {
                let inserted = store.merge(messages);
                let _ = reply.send(inserted);
                inserted > 0
            }
            StoreCommand::MarkRead(id, reply) => {
                let changed = store.mark_read(&id);
                let _ = reply.send(changed);
                changed
            }
        }
    }
}

/// Client side of a store owned by a session task.
#[derive(Clone)]
pub struct StoreHandle {
    commands: mpsc::UnboundedSender<StoreCommand>,
    timeline: watch::Receiver<Vec<Message>>,
}

impl StoreHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<StoreCommand>,
        timeline: watch::Receiver<Vec<Message>>,
    ) -> Self {
        Self { commands, timeline }
    }

    pub async fn append_optimistic(&self, message: Message) -> Result<bool> {
        self.call(|reply| StoreCommand::AppendOptimistic(message, reply))
            .await
    }

    pub async fn acknowledge(&self, client_id: &str, server_id: &str) -> Result<bool> {
        self.call(|reply| StoreCommand::Acknowledge {
            client_id: client_id.to_string(),
            server_id: server_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn abandon(&self, client_id: &str) -> Result<bool> {
        self.call(|reply| StoreCommand::Abandon(client_id.to_string(), reply))
            .await
    }

    pub async fn merge(&self, messages: Vec<Message>) -> Result<usize> {
        self.call(|reply| StoreCommand::Merge(messages, reply)).await
    }

    pub async fn mark_read(&self, id: &str) -> Result<bool> {
        self.call(|reply| StoreCommand::MarkRead(id.to_string(), reply))
            .await
    }

    /// Current timeline, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.timeline.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Message>> {
        self.timeline.clone()
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ChatError::SessionClosed)?;
        response.await.map_err(|_| ChatError::SessionClosed)
    }
}
