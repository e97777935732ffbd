//! What one thread view mounts.
//!
//! A [`ThreadSession`] ties the pieces together for a single conversation:
//! resolve the reference, open the conversation channel, seed the timeline
//! over REST, and keep it current from live pushes or, while the channel is
//! down, from polling. All timeline mutations go through one task that owns
//! the [`MessageStore`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::auth::TokenProvider;
use crate::config::ChatConfig;
use crate::connection::{ChannelEvent, ConnectionManager, ConnectionStatus};
use crate::delivery::DeliveryCoordinator;
use crate::error::{ChatError, Result};
use crate::model::{Attachment, CurrentUser, Message};
use crate::polling::PollingFallback;
use crate::protocol::Room;
use crate::resolver::{ConversationRef, ConversationResolver, ResolvedConversation};
use crate::store::{MessageStore, StoreCommand, StoreHandle};

/// User id -> display name of everyone currently typing.
pub type TypingUsers = BTreeMap<String, String>;

struct Outputs {
    timeline: watch::Sender<Vec<Message>>,
    typing: watch::Sender<TypingUsers>,
    unread: watch::Sender<u64>,
}

struct ActiveThread {
    conversation: ResolvedConversation,
    store: StoreHandle,
    delivery: DeliveryCoordinator,
    polling: PollingFallback,
    store_task: JoinHandle<()>,
}

impl ActiveThread {
    fn shutdown(self) {
        self.polling.stop();
        self.store_task.abort();
    }
}

/// One conversation thread, from open to teardown.
pub struct ThreadSession {
    config: ChatConfig,
    api: Arc<dyn ChatApi>,
    tokens: Arc<dyn TokenProvider>,
    user: CurrentUser,
    resolver: ConversationResolver,
    connection: ConnectionManager,
    outputs: Arc<Outputs>,
    alive: AtomicBool,
    active: Mutex<Option<ActiveThread>>,
}

impl ThreadSession {
    pub fn new(
        config: ChatConfig,
        api: Arc<dyn ChatApi>,
        connection: ConnectionManager,
        tokens: Arc<dyn TokenProvider>,
        user: CurrentUser,
    ) -> Self {
        let (timeline, _) = watch::channel(Vec::new());
        let (typing, _) = watch::channel(TypingUsers::new());
        let (unread, _) = watch::channel(0);
        Self {
            resolver: ConversationResolver::new(Arc::clone(&api)),
            config,
            api,
            tokens,
            user,
            connection,
            outputs: Arc::new(Outputs {
                timeline,
                typing,
                unread,
            }),
            alive: AtomicBool::new(true),
            active: Mutex::new(None),
        }
    }

    /// Open the thread for `reference`.
    ///
    /// Opening the conversation that is already open returns it unchanged;
    /// opening a different one replaces it.
    pub async fn open(&self, reference: ConversationRef) -> Result<ResolvedConversation> {
        self.ensure_alive()?;

        let conversation = self.resolver.resolve(&reference).await?;
        // Torn down while resolving: drop the result.
        self.ensure_alive()?;

        if let Some(active) = self.active.lock().as_ref()
            && active.conversation.id == conversation.id
        {
            return Ok(active.conversation.clone());
        }
        if self.active.lock().is_some() {
            self.close_thread();
        }

        let conversation_id = conversation.id.clone();
        info!(conversation_id = %conversation_id, "opening thread");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let store = StoreHandle::new(commands, self.outputs.timeline.subscribe());
        let store_task = tokio::spawn(run_store(
            MessageStore::new(self.user.id.clone()),
            command_rx,
            self.connection.subscribe(),
            Arc::clone(&self.outputs),
        ));

        self.connection.open(
            Room::Conversation(conversation_id.clone()),
            Arc::clone(&self.tokens),
        );

        let seeded = match self.api.list_messages(&conversation_id).await {
            Ok(messages) => store.merge(messages).await,
            Err(err) => Err(err),
        };
        match seeded {
            Ok(count) => debug!(conversation_id = %conversation_id, count, "timeline seeded"),
            Err(ChatError::SessionClosed) => {}
            Err(err) => warn!(conversation_id = %conversation_id, "initial fetch failed: {}", err),
        }

        let polling = PollingFallback::spawn(
            Arc::clone(&self.api),
            conversation_id.clone(),
            self.connection.watch_status(),
            self.config.poll_interval,
            store.clone(),
        );
        let delivery = DeliveryCoordinator::new(
            Arc::clone(&self.api),
            self.connection.clone(),
            store.clone(),
            self.user.clone(),
            conversation_id,
        );
        let thread = ActiveThread {
            conversation: conversation.clone(),
            store,
            delivery,
            polling,
            store_task,
        };

        if !self.alive.load(Ordering::SeqCst) {
            thread.shutdown();
            self.connection.close();
            return Err(ChatError::SessionClosed);
        }
        if let Some(previous) = self.active.lock().replace(thread) {
            previous.shutdown();
        }
        Ok(conversation)
    }

    /// Send a message in the open thread.
    pub async fn send(&self, content: &str, attachments: Vec<Attachment>) -> Result<Message> {
        // Cloned out so the lock is not held across the send.
        let delivery = self
            .active
            .lock()
            .as_ref()
            .map(|active| active.delivery.clone())
            .ok_or_else(|| ChatError::Send("no conversation is open".to_string()))?;
        delivery.send(content, attachments).await
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<bool> {
        let store = self
            .active
            .lock()
            .as_ref()
            .map(|active| active.store.clone())
            .ok_or(ChatError::SessionClosed)?;
        store.mark_read(message_id).await
    }

    pub fn conversation(&self) -> Option<ResolvedConversation> {
        self.active
            .lock()
            .as_ref()
            .map(|active| active.conversation.clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.outputs.timeline.borrow().clone()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.outputs.timeline.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    /// Unread count as last reported on the conversation channel.
    pub fn unread_count(&self) -> u64 {
        *self.outputs.unread.borrow()
    }

    pub fn typing_users(&self) -> TypingUsers {
        self.outputs.typing.borrow().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.connection.subscribe()
    }

    /// Whether the fallback poller is currently fetching on its interval.
    pub fn is_polling(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| active.polling.is_active())
    }

    /// Stop everything. Safe to call repeatedly, and while `open` is still
    /// in flight.
    pub fn teardown(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            info!("tearing down thread session");
        }
        self.close_thread();
        self.resolver.clear();
    }

    fn close_thread(&self) {
        if let Some(active) = self.active.lock().take() {
            debug!(conversation_id = %active.conversation.id, "closing thread");
            active.shutdown();
        }
        self.connection.close();
        self.outputs.timeline.send_replace(Vec::new());
        self.outputs.typing.send_replace(TypingUsers::new());
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChatError::SessionClosed)
        }
    }
}

impl Drop for ThreadSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The task that owns a thread's [`MessageStore`]. Commands and channel
/// events are applied strictly in arrival order.
async fn run_store(
    mut store: MessageStore,
    mut commands: mpsc::UnboundedReceiver<StoreCommand>,
    mut events: broadcast::Receiver<ChannelEvent>,
    outputs: Arc<Outputs>,
) {
    let mut events_open = true;
    loop {
        let changed = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command.apply(&mut store),
                None => return,
            },
            event = events.recv(), if events_open => match event {
                Ok(event) => apply_event(&mut store, event, &outputs),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "timeline lagged behind the live channel");
                    false
                }
                Err(broadcast::error::RecvError::Closed) => {
                    events_open = false;
                    false
                }
            },
        };

        if changed {
            outputs.timeline.send_replace(store.messages().to_vec());
        }
    }
}

fn apply_event(store: &mut MessageStore, event: ChannelEvent, outputs: &Outputs) -> bool {
    match event {
        ChannelEvent::Message { message, .. } => store.append_from_live(message),
        ChannelEvent::Typing {
            user_id,
            user_name,
            is_typing,
        } => {
            outputs.typing.send_if_modified(|typing| {
                if is_typing {
                    let name = user_name.unwrap_or_else(|| user_id.clone());
                    typing.insert(user_id, name).is_none()
                } else {
                    typing.remove(&user_id).is_some()
                }
            });
            false
        }
        ChannelEvent::UnreadCount(count) => {
            outputs.unread.send_replace(count);
            false
        }
        ChannelEvent::Closed { .. } => {
            outputs.typing.send_if_modified(|typing| {
                let had_any = !typing.is_empty();
                typing.clear();
                had_any
            });
            false
        }
        ChannelEvent::Opened | ChannelEvent::Error(_) | ChannelEvent::Notice(_) => false,
    }
}
