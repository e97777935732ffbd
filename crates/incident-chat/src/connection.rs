//! Live channel lifecycle.
//!
//! A [`ConnectionManager`] owns one socket to one room at a time and keeps it
//! alive: it joins the room once the socket is up, pings while open and
//! reconnects after a fixed delay whenever the socket drops. Only
//! [`ConnectionManager::close`] stops it for good.
//!
//! State machine:
//!
//! ```text
//! Idle -> Connecting -> Open -> Reconnecting -> Connecting -> ...
//!                 \______________/
//!                  connect failed
//! any state -> Closed            (close(), or reconnect attempts exhausted)
//! ```

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::model::Message;
use crate::protocol::{Notice, OutboundFrame, Room, ServerEvent};
use crate::transport::{Connector, Socket, SocketFrame, SocketSink};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never opened
    #[default]
    Idle,
    /// Connect attempt in progress
    Connecting,
    /// Socket up and room joined
    Open,
    /// Waiting out the reconnect delay
    Reconnecting,
    /// Stopped; only a new `open` restarts it
    Closed,
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Reconnects scheduled since the channel was last open.
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// Events published to subscribers of a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    /// The socket went away. `code` is the peer's close code, if any.
    Closed {
        code: Option<u16>,
    },
    Error(String),
    Message {
        message: Message,
        conversation_id: Option<String>,
    },
    /// Another user started or stopped typing.
    Typing {
        user_id: String,
        user_name: Option<String>,
        is_typing: bool,
    },
    UnreadCount(u64),
    Notice(Notice),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Drop the socket and go through a normal reconnect.
    Reconnect,
}

struct Shared {
    config: ChatConfig,
    connector: Arc<dyn Connector>,
    user_id: String,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ChannelEvent>,
    /// Present only while the channel is open.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    driver: Mutex<DriverSlot>,
    room: Mutex<Option<Room>>,
}

#[derive(Default)]
struct DriverSlot {
    handle: Option<JoinHandle<()>>,
    /// Bumped by every `close`. A driver only publishes while the generation
    /// it was started with is still current.
    generation: u64,
}

/// Lifecycle manager for one live channel.
///
/// Cloning is cheap and every clone drives the same channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ChatConfig, connector: Arc<dyn Connector>, user_id: impl Into<String>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (events, _) = broadcast::channel(config.event_buffer);
        Self {
            inner: Arc::new(Shared {
                config,
                connector,
                user_id: user_id.into(),
                status,
                events,
                outbound: Mutex::new(None),
                driver: Mutex::new(DriverSlot::default()),
                room: Mutex::new(None),
            }),
        }
    }

    /// Start driving a channel to `room`.
    ///
    /// A no-op while a driver is already running, whatever room it serves.
    pub fn open(&self, room: Room, tokens: Arc<dyn TokenProvider>) {
        let mut slot = self.inner.driver.lock();
        if let Some(handle) = slot.handle.as_ref()
            && !handle.is_finished()
        {
            debug!(room = %room, "open ignored, channel already running");
            return;
        }

        info!(room = %room, "opening live channel");
        *self.inner.room.lock() = Some(room.clone());
        self.inner.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.retry_count = 0;
            status.last_error = None;
        });

        let driver = Driver {
            shared: Arc::clone(&self.inner),
            generation: slot.generation,
            room,
            tokens,
        };
        slot.handle = Some(tokio::spawn(driver.run()));
    }

    /// Stop the channel: cancels a pending reconnect and drops the socket.
    /// Safe to call in any state, any number of times.
    ///
    /// A driver still mid-poll on another worker cannot publish anything
    /// once this returns.
    pub fn close(&self) {
        let handle = {
            let mut slot = self.inner.driver.lock();
            slot.generation = slot.generation.wrapping_add(1);
            slot.handle.take()
        };
        self.inner.outbound.lock().take();

        if let Some(handle) = handle {
            handle.abort();
            if let Some(room) = self.inner.room.lock().as_ref() {
                info!(room = %room, "live channel closed");
            }
            let _ = self.inner.events.send(ChannelEvent::Closed { code: None });
        }

        self.inner.status.send_if_modified(|status| {
            if status.state == ConnectionState::Closed {
                return false;
            }
            status.state = ConnectionState::Closed;
            true
        });
    }

    /// Queue a frame on the open socket.
    ///
    /// Nothing is buffered while the channel is not open.
    pub fn send(&self, frame: &OutboundFrame) -> Result<()> {
        if !self.is_open() {
            return Err(ChatError::NotConnected);
        }
        let text = frame.to_json()?;
        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(ChatError::NotConnected)?;
        tx.send(text).map_err(|_| ChatError::NotConnected)?;
        debug!(kind = frame.kind(), "frame queued");
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.inner.status.borrow().is_open()
    }

    /// The room most recently passed to [`ConnectionManager::open`].
    pub fn room(&self) -> Option<Room> {
        self.inner.room.lock().clone()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }
}

/// The task behind one `open`, until `close` supersedes it.
struct Driver {
    shared: Arc<Shared>,
    generation: u64,
    room: Room,
    tokens: Arc<dyn TokenProvider>,
}

impl Driver {
    async fn run(self) {
        let room = &self.room;
        let mut retries: u32 = 0;
        loop {
            if !self.update(|status| status.state = ConnectionState::Connecting) {
                return;
            }

            match self.connect().await {
                Ok(socket) => {
                    retries = 0;
                    let code = self.serve(socket).await;
                    info!(room = %room, code = ?code, "live channel dropped");
                    self.emit(ChannelEvent::Closed { code });
                }
                Err(err) => {
                    warn!(room = %room, retry_count = retries, "connect failed: {}", err);
                    self.record_error(err.to_string());
                    self.emit(ChannelEvent::Closed { code: None });
                }
            }

            retries = retries.saturating_add(1);
            if let Some(max) = self.shared.config.max_reconnect_attempts
                && retries > max
            {
                warn!(room = %room, retry_count = retries - 1, "giving up on live channel");
                self.update(|status| {
                    status.state = ConnectionState::Closed;
                    if status.last_error.is_none() {
                        status.last_error = Some("reconnect attempts exhausted".to_string());
                    }
                });
                return;
            }

            let scheduled = self.update(|status| {
                status.state = ConnectionState::Reconnecting;
                status.retry_count = retries;
            });
            if !scheduled {
                return;
            }
            debug!(room = %room, retry_count = retries, "reconnecting in {:?}", self.shared.config.reconnect_delay);
            tokio::time::sleep(self.shared.config.reconnect_delay).await;
        }
    }

    /// Run `publish` only if no `close` happened since this driver started.
    /// The slot lock is held throughout, so `close` cannot slip in between
    /// the check and the write.
    fn if_current(&self, publish: impl FnOnce(&Shared)) -> bool {
        let slot = self.shared.driver.lock();
        if slot.generation != self.generation {
            return false;
        }
        publish(&self.shared);
        true
    }

    fn update(&self, modify: impl FnOnce(&mut ConnectionStatus)) -> bool {
        self.if_current(|shared| shared.status.send_modify(modify))
    }

    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine.
        self.if_current(|shared| {
            let _ = shared.events.send(event);
        });
    }

    /// Mark the channel not ready and remember why. The reconnect itself is
    /// scheduled by the close that follows.
    fn record_error(&self, error: String) {
        self.if_current(|shared| {
            shared.outbound.lock().take();
            shared
                .status
                .send_modify(|status| status.last_error = Some(error.clone()));
            let _ = shared.events.send(ChannelEvent::Error(error));
        });
    }

    async fn connect(&self) -> Result<Socket> {
        let shared = &self.shared;
        let token = self
            .tokens
            .token()
            .await
            .map_err(|err| ChatError::Auth(err.to_string()))?;
        let url = self
            .room
            .socket_url(&shared.config.ws_base_url, &token, &shared.user_id)?;

        debug!(room = %self.room, "connecting");
        match timeout(shared.config.connect_timeout, shared.connector.connect(&url)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Connection(format!(
                "connect timed out after {:?}",
                shared.config.connect_timeout
            ))),
        }
    }

    /// Run one open socket until it drops. Returns the peer's close code.
    async fn serve(&self, socket: Socket) -> Option<u16> {
        let Socket {
            mut sink,
            mut stream,
        } = socket;
        let room = &self.room;

        let join = OutboundFrame::join(room, &self.shared.user_id);
        if let Err(err) = send_frame(sink.as_mut(), &join).await {
            self.record_error(err.to_string());
            return None;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let opened = self.if_current(|shared| {
            *shared.outbound.lock() = Some(tx);
            shared.status.send_modify(|status| {
                status.state = ConnectionState::Open;
                status.retry_count = 0;
                status.last_error = None;
            });
            let _ = shared.events.send(ChannelEvent::Opened);
        });
        if !opened {
            debug!(room = %room, "closed while connecting, dropping socket");
            sink.close().await;
            return None;
        }
        info!(room = %room, "live channel open");

        let period = self.shared.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let code = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(SocketFrame::Text(text))) => {
                        if self.dispatch(&text) == Flow::Reconnect {
                            sink.close().await;
                            break None;
                        }
                    }
                    Some(Ok(SocketFrame::Close(code))) => break code,
                    Some(Err(err)) => {
                        self.record_error(err.to_string());
                        break None;
                    }
                    None => break None,
                },
                Some(text) = rx.recv() => {
                    if let Err(err) = sink.send_text(text).await {
                        self.record_error(err.to_string());
                        break None;
                    }
                }
                _ = ping.tick() => {
                    let frame = OutboundFrame::Ping { timestamp: Utc::now() };
                    if let Err(err) = send_frame(sink.as_mut(), &frame).await {
                        self.record_error(err.to_string());
                        break None;
                    }
                }
            }
        };

        self.if_current(|shared| {
            shared.outbound.lock().take();
        });
        code
    }

    fn dispatch(&self, text: &str) -> Flow {
        let Some(event) = ServerEvent::parse(text) else {
            debug!("dropping unrecognized frame");
            return Flow::Continue;
        };

        match event {
            ServerEvent::Message {
                message,
                conversation_id,
            } => self.emit(ChannelEvent::Message {
                message,
                conversation_id,
            }),
            ServerEvent::Typing { user_id, .. } if user_id == self.shared.user_id => {}
            ServerEvent::Typing {
                user_id,
                user_name,
                is_typing,
            } => self.emit(ChannelEvent::Typing {
                user_id,
                user_name,
                is_typing,
            }),
            ServerEvent::UnreadCount(count) => self.emit(ChannelEvent::UnreadCount(count)),
            ServerEvent::Notice(notice) => self.emit(ChannelEvent::Notice(notice)),
            ServerEvent::ConnectionEstablished => debug!("connection established"),
            ServerEvent::RoomJoined { room_id } => debug!(room_id = ?room_id, "room joined"),
            ServerEvent::Pong => debug!("pong"),
            ServerEvent::TokenRefreshRequired => {
                info!("server asked for a fresh token, reconnecting");
                return Flow::Reconnect;
            }
            ServerEvent::Error(message) => {
                warn!("server error: {}", message);
                self.update(|status| status.last_error = Some(message.clone()));
                self.emit(ChannelEvent::Error(message));
            }
        }
        Flow::Continue
    }
}

async fn send_frame(sink: &mut dyn SocketSink, frame: &OutboundFrame) -> Result<()> {
    sink.send_text(frame.to_json()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, _url: &url::Url) -> Result<Socket> {
            Err(ChatError::Connection("connection refused".into()))
        }
    }

    fn manager(max_reconnect_attempts: Option<u32>) -> ConnectionManager {
        let config = ChatConfig {
            max_reconnect_attempts,
            ..ChatConfig::default()
        };
        ConnectionManager::new(config, Arc::new(Unreachable), "u1")
    }

    #[test]
    fn send_fails_when_idle() {
        let manager = manager(None);
        let frame = OutboundFrame::Ping { timestamp: Utc::now() };
        assert!(matches!(manager.send(&frame), Err(ChatError::NotConnected)));
    }

    #[test]
    fn close_is_idempotent_before_open() {
        let manager = manager(None);
        manager.close();
        manager.close();
        assert_eq!(manager.status().state, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let manager = manager(Some(2));
        let mut status = manager.watch_status();
        manager.open(Room::General, Arc::new(crate::auth::StaticToken::new("t")));

        let settled = status
            .wait_for(|s| s.state == ConnectionState::Closed)
            .await
            .unwrap()
            .clone();
        assert_eq!(settled.retry_count, 2);
        assert_eq!(settled.last_error.as_deref(), Some("Connection error: connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_forever_by_default() {
        let manager = manager(None);
        let mut status = manager.watch_status();
        manager.open(Room::General, Arc::new(crate::auth::StaticToken::new("t")));

        status.wait_for(|s| s.retry_count >= 5).await.unwrap();
        assert_ne!(manager.status().state, ConnectionState::Closed);
        manager.close();
        assert_eq!(manager.status().state, ConnectionState::Closed);
    }
}
