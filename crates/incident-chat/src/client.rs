//! Entry point that wires the collaborators together.

use std::sync::Arc;

use crate::api::{ChatApi, HttpChatApi};
use crate::auth::TokenProvider;
use crate::config::ChatConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::model::CurrentUser;
use crate::notifications::NotificationDispatcher;
use crate::thread::ThreadSession;
use crate::transport::{Connector, WsConnector};

/// Factory for thread sessions and notification dispatchers.
///
/// Every session and dispatcher gets its own live channel; only the REST
/// client, connector and token provider are shared.
#[derive(Clone)]
pub struct ChatClient {
    config: ChatConfig,
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    user: CurrentUser,
}

impl ChatClient {
    /// Client over HTTP and WebSocket.
    pub fn connect(
        config: ChatConfig,
        tokens: Arc<dyn TokenProvider>,
        user: CurrentUser,
    ) -> Result<Self> {
        let api = Arc::new(HttpChatApi::new(&config, Arc::clone(&tokens))?);
        Ok(Self::with_parts(config, api, Arc::new(WsConnector), tokens, user))
    }

    /// Client over caller-supplied transports.
    pub fn with_parts(
        config: ChatConfig,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        user: CurrentUser,
    ) -> Self {
        Self {
            config,
            api,
            connector,
            tokens,
            user,
        }
    }

    pub fn thread_session(&self) -> ThreadSession {
        ThreadSession::new(
            self.config.clone(),
            Arc::clone(&self.api),
            self.connection(),
            Arc::clone(&self.tokens),
            self.user.clone(),
        )
    }

    pub fn notification_dispatcher(&self) -> NotificationDispatcher {
        NotificationDispatcher::new(
            self.connection(),
            Arc::clone(&self.tokens),
            self.user.clone(),
            self.config.event_buffer,
        )
    }

    pub fn api(&self) -> Arc<dyn ChatApi> {
        Arc::clone(&self.api)
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn connection(&self) -> ConnectionManager {
        ConnectionManager::new(
            self.config.clone(),
            Arc::clone(&self.connector),
            self.user.id.clone(),
        )
    }
}
