//! Turns what a view was opened with into a conversation id.
//!
//! Views are opened either with a conversation id or with an incident id. The
//! latter needs one fetch-or-create call; the result is cached for the life of
//! the owning session, and concurrent callers share the call in flight.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::error::{ChatError, Result};
use crate::model::{Conversation, Participant};

/// What a thread view is opened with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationRef {
    Conversation(String),
    Incident(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConversation {
    pub id: String,
    pub title: Option<String>,
    pub participants: Vec<Participant>,
}

impl From<Conversation> for ResolvedConversation {
    fn from(conversation: Conversation) -> Self {
        Self {
            id: conversation.id,
            title: conversation.title,
            participants: conversation.participants,
        }
    }
}

type InFlight = Shared<BoxFuture<'static, std::result::Result<ResolvedConversation, Arc<ChatError>>>>;

enum Entry {
    Ready(ResolvedConversation),
    Pending(InFlight),
}

/// Per-session resolution cache.
pub struct ConversationResolver {
    api: Arc<dyn ChatApi>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ConversationResolver {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self {
            api,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, reference: &ConversationRef) -> Result<ResolvedConversation> {
        let incident_id = match reference {
            ConversationRef::Conversation(id) => {
                return Ok(ResolvedConversation {
                    id: id.clone(),
                    title: None,
                    participants: Vec::new(),
                });
            }
            ConversationRef::Incident(id) => id,
        };

        let in_flight = {
            let mut entries = self.entries.lock();
            match entries.get(incident_id) {
                Some(Entry::Ready(resolved)) => {
                    debug!(incident_id = %incident_id, "resolution cache hit");
                    return Ok(resolved.clone());
                }
                Some(Entry::Pending(in_flight)) => in_flight.clone(),
                None => {
                    info!(incident_id = %incident_id, "resolving incident conversation");
                    let api = Arc::clone(&self.api);
                    let id = incident_id.clone();
                    let in_flight = async move {
                        api.conversation_for_incident(&id)
                            .await
                            .map(ResolvedConversation::from)
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    entries.insert(incident_id.clone(), Entry::Pending(in_flight.clone()));
                    in_flight
                }
            }
        };

        let outcome = in_flight.clone().await;

        let mut entries = self.entries.lock();
        let still_ours = matches!(
            entries.get(incident_id),
            Some(Entry::Pending(current)) if current.ptr_eq(&in_flight)
        );
        match outcome {
            Ok(resolved) => {
                if still_ours {
                    entries.insert(incident_id.clone(), Entry::Ready(resolved.clone()));
                }
                Ok(resolved)
            }
            Err(err) => {
                if still_ours {
                    entries.remove(incident_id);
                }
                warn!(incident_id = %incident_id, "resolution failed: {}", err);
                Err(ChatError::Resolution(err.to_string()))
            }
        }
    }

    /// Cached conversation id for an incident, without any I/O.
    pub fn cached(&self, incident_id: &str) -> Option<ResolvedConversation> {
        match self.entries.lock().get(incident_id) {
            Some(Entry::Ready(resolved)) => Some(resolved.clone()),
            _ => None,
        }
    }

    /// Forget every cached and in-flight resolution.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
