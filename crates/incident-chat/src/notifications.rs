//! Process-wide notifications over the general channel.
//!
//! The dispatcher keeps one live channel to the `general` room and turns what
//! arrives there into three things views can subscribe to: the unread
//! counter, toasts and refresh signals for the incident and conversation
//! lists.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::connection::{ChannelEvent, ConnectionManager, ConnectionStatus};
use crate::error::{ChatError, Result};
use crate::model::{CurrentUser, Message};
use crate::protocol::{Notice, NoticeKind, OutboundFrame, Room};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTopic {
    Incidents,
    Conversations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub title: String,
    pub message: String,
}

/// Everything the dispatcher publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    UnreadCount(u64),
    Toast(Toast),
    Refresh {
        topic: RefreshTopic,
        /// The notice that caused the refresh, if any.
        notice: Option<Notice>,
    },
}

struct Channels {
    unread: watch::Sender<u64>,
    events: broadcast::Sender<DispatchEvent>,
}

pub struct NotificationDispatcher {
    connection: ConnectionManager,
    tokens: Arc<dyn TokenProvider>,
    user: CurrentUser,
    channels: Arc<Channels>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// `connection` must not be shared with a thread view. `user` decides
    /// which broadcast messages are the user's own.
    pub fn new(
        connection: ConnectionManager,
        tokens: Arc<dyn TokenProvider>,
        user: CurrentUser,
        buffer: usize,
    ) -> Self {
        let (unread, _) = watch::channel(0);
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            connection,
            tokens,
            user,
            channels: Arc::new(Channels { unread, events }),
            router: Mutex::new(None),
        }
    }

    /// Connect to the general room and start routing. Idempotent.
    pub fn start(&self) {
        let mut router = self.router.lock();
        if router.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let events = self.connection.subscribe();
        let channels = Arc::clone(&self.channels);
        *router = Some(tokio::spawn(route(events, channels, self.user.clone())));

        self.connection.open(Room::General, Arc::clone(&self.tokens));
        info!("notification dispatcher started");
    }

    /// Disconnect and stop routing. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.router.lock().take() {
            handle.abort();
            info!("notification dispatcher stopped");
        }
        self.connection.close();
    }

    pub fn unread_count(&self) -> u64 {
        *self.channels.unread.borrow()
    }

    pub fn watch_unread_count(&self) -> watch::Receiver<u64> {
        self.channels.unread.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.channels.events.subscribe()
    }

    /// Refresh signals for `topics` only.
    pub fn subscribe_refresh(&self, topics: &[RefreshTopic]) -> RefreshSubscription {
        RefreshSubscription {
            topics: topics.iter().copied().collect(),
            events: self.channels.events.subscribe(),
        }
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

    /// Post a free-form message on the general channel.
    pub fn send_message(&self, content: &str, room_id: Option<&str>) -> Result<()> {
        self.send(OutboundFrame::Message {
            content: content.to_string(),
            user_id: self.connection.user_id().to_string(),
            room_id: room_id.map(str::to_string),
            timestamp: Utc::now(),
        })
    }

    pub fn join_room(&self, room_id: &str) -> Result<()> {
        self.send(OutboundFrame::JoinRoom {
            room_id: room_id.to_string(),
            user_id: self.connection.user_id().to_string(),
        })
    }

    pub fn leave_room(&self, room_id: &str) -> Result<()> {
        self.send(OutboundFrame::LeaveRoom {
            room_id: room_id.to_string(),
            user_id: self.connection.user_id().to_string(),
        })
    }

    fn send(&self, frame: OutboundFrame) -> Result<()> {
        match self.connection.send(&frame) {
            Err(ChatError::NotConnected) => {
                warn!(kind = frame.kind(), "general channel not connected");
                let _ = self.channels.events.send(DispatchEvent::Toast(Toast {
                    level: ToastLevel::Error,
                    title: "Not connected".to_string(),
                    message: "Live updates are offline, try again shortly.".to_string(),
                }));
                Err(ChatError::NotConnected)
            }
            other => other,
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A filtered view of dispatcher refresh signals.
pub struct RefreshSubscription {
    topics: HashSet<RefreshTopic>,
    events: broadcast::Receiver<DispatchEvent>,
}

impl RefreshSubscription {
    /// Next refresh on a subscribed topic. `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<RefreshTopic> {
        loop {
            match self.events.recv().await {
                Ok(DispatchEvent::Refresh { topic, .. }) if self.topics.contains(&topic) => {
                    return Some(topic);
                }
                Ok(_) => {}
                // Missed signals collapse into the next one.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

async fn route(
    mut events: broadcast::Receiver<ChannelEvent>,
    channels: Arc<Channels>,
    user: CurrentUser,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification router lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        for out in dispatch(event, &user) {
            if let DispatchEvent::UnreadCount(count) = out {
                channels.unread.send_replace(count);
            }
            let _ = channels.events.send(out);
        }
    }
}

/// Decide what a general channel event means for the application.
fn dispatch(event: ChannelEvent, user: &CurrentUser) -> Vec<DispatchEvent> {
    match event {
        ChannelEvent::UnreadCount(count) => vec![DispatchEvent::UnreadCount(count)],
        ChannelEvent::Message { message, .. } if !is_own(&message, user) => {
            vec![DispatchEvent::Refresh {
                topic: RefreshTopic::Conversations,
                notice: None,
            }]
        }
        ChannelEvent::Notice(notice) => dispatch_notice(notice),
        other => {
            debug!(event = ?other, "general channel event not routed");
            Vec::new()
        }
    }
}

/// Flat incident broadcasts carry only the sender's display name.
fn is_own(message: &Message, user: &CurrentUser) -> bool {
    if message.sender_id.is_empty() {
        !user.name.is_empty() && message.sender_name == user.name
    } else {
        message.sender_id == user.id
    }
}

fn dispatch_notice(notice: Notice) -> Vec<DispatchEvent> {
    let refresh = |notice: &Notice| DispatchEvent::Refresh {
        topic: RefreshTopic::Incidents,
        notice: Some(notice.clone()),
    };

    match notice.kind {
        NoticeKind::Notification | NoticeKind::SystemMessage | NoticeKind::IncidentAssigned => {
            vec![DispatchEvent::Toast(toast(&notice, ToastLevel::Info))]
        }
        NoticeKind::SecurityAlert => vec![DispatchEvent::Toast(toast(&notice, ToastLevel::Warning))],
        NoticeKind::NewIncident => vec![
            refresh(&notice),
            DispatchEvent::Toast(toast(&notice, ToastLevel::Info)),
        ],
        NoticeKind::IncidentUpdate | NoticeKind::IncidentResolved => vec![refresh(&notice)],
    }
}

fn toast(notice: &Notice, level: ToastLevel) -> Toast {
    let title = notice.title.clone().unwrap_or_else(|| {
        match notice.kind {
            NoticeKind::Notification => "Notification",
            NoticeKind::SecurityAlert => "Security alert",
            NoticeKind::SystemMessage => "System message",
            NoticeKind::NewIncident => "New incident",
            NoticeKind::IncidentAssigned => "Incident assigned",
            NoticeKind::IncidentUpdate => "Incident updated",
            NoticeKind::IncidentResolved => "Incident resolved",
        }
        .to_string()
    });
    let message = notice
        .message
        .clone()
        .or_else(|| notice.incident_id.as_ref().map(|id| format!("Incident {id}")))
        .unwrap_or_default();
    Toast {
        level,
        title,
        message,
    }
}
