use super::auth::Authenticator;
use crate::session::SessionRegistry;
use crate::storage::ConversationStore;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Live sessions of this instance
    pub registry: Arc<SessionRegistry>,

    /// Conversation ownership and listener approvals
    pub conversations: ConversationStore,

    /// Verifies callers
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        conversations: ConversationStore,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry,
            conversations,
            auth,
        }
    }
}
