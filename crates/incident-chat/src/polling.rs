//! Fallback re-fetch while the live channel is down.
//!
//! The poller watches the channel status. Whenever the channel is not open it
//! re-fetches the conversation every `poll_interval` and merges the result
//! into the store; the moment the channel opens it stops ticking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::connection::ConnectionStatus;
use crate::error::{ChatError, Result};
use crate::store::StoreHandle;

/// Handle to a running poll task. Dropping it stops the task.
pub struct PollingFallback {
    task: JoinHandle<()>,
    /// True while the ticker runs, i.e. the channel is down and fetches are due.
    active: watch::Receiver<bool>,
}

impl PollingFallback {
    pub fn spawn(
        api: Arc<dyn ChatApi>,
        conversation_id: String,
        status: watch::Receiver<ConnectionStatus>,
        interval: Duration,
        store: StoreHandle,
    ) -> Self {
        let poller = Poller {
            api,
            conversation_id,
            interval,
            store,
        };
        let (active_tx, active) = watch::channel(false);
        Self {
            task: tokio::spawn(poller.run(status, active_tx)),
            active,
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Whether the poller is currently fetching on its interval.
    pub fn is_active(&self) -> bool {
        self.is_running() && *self.active.borrow()
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Poller {
    api: Arc<dyn ChatApi>,
    conversation_id: String,
    interval: Duration,
    store: StoreHandle,
}

impl Poller {
    async fn run(self, mut status: watch::Receiver<ConnectionStatus>, active: watch::Sender<bool>) {
        loop {
            // Idle while the live channel is open.
            if status.wait_for(|s| !s.is_open()).await.is_err() {
                return;
            }
            info!(conversation_id = %self.conversation_id, "live channel down, polling");
            active.send_replace(true);

            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    changed = status.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if status.borrow_and_update().is_open() {
                            info!(conversation_id = %self.conversation_id, "live channel back, polling stopped");
                            active.send_replace(false);
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match self.poll_once().await {
                            Ok(0) => {}
                            Ok(inserted) => {
                                debug!(conversation_id = %self.conversation_id, inserted, "poll merged messages");
                            }
                            Err(ChatError::SessionClosed) => return,
                            Err(err) => {
                                warn!(conversation_id = %self.conversation_id, "{}", err);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<usize> {
        let messages = self
            .api
            .list_messages(&self.conversation_id)
            .await
            .map_err(|err| ChatError::Poll(err.to_string()))?;
        self.store.merge(messages).await
    }
}
