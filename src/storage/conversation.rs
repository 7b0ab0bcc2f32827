use super::{KeyValueStore, StorageKey};
use anyhow::{Context, Result};
use std::sync::Arc;

const CONVERSATION_PREFIX: &str = "conversation:";
const ALLOWED_LISTENERS_PREFIX: &str = "allowed-listeners:";
const OWNER_FIELD: &str = "owner";

/// Who may whisper in a conversation, and who may listen without asking
#[derive(Clone)]
pub struct ConversationStore {
    store: Arc<dyn KeyValueStore>,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn owner(&self, conversation_id: &str) -> Result<Option<String>> {
        let fields = self
            .store
            .get_fields(&StorageKey::new(CONVERSATION_PREFIX, conversation_id))
            .await
            .with_context(|| format!("Failed to load conversation {}", conversation_id))?;
        Ok(fields.get(OWNER_FIELD).cloned())
    }

    /// Whether the profile owns the conversation. An unowned conversation is
    /// claimed by the first profile to ask, even when several ask at once.
    pub async fn claim(&self, conversation_id: &str, profile_id: &str) -> Result<bool> {
        let claimed = self
            .store
            .set_field_nx(
                &StorageKey::new(CONVERSATION_PREFIX, conversation_id),
                OWNER_FIELD,
                profile_id,
            )
            .await
            .with_context(|| format!("Failed to claim conversation {}", conversation_id))?;
        if claimed {
            return Ok(true);
        }
        Ok(self.owner(conversation_id).await?.as_deref() == Some(profile_id))
    }

    /// Let a profile join future sessions of the conversation without a request
    pub async fn allow_listener(&self, conversation_id: &str, profile_id: &str) -> Result<()> {
        self.store
            .add_members(
                &StorageKey::new(ALLOWED_LISTENERS_PREFIX, conversation_id),
                &[profile_id.to_string()],
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to allow listener {} in conversation {}",
                    profile_id, conversation_id
                )
            })
    }

    pub async fn is_allowed_listener(&self, conversation_id: &str, profile_id: &str) -> Result<bool> {
        self.store
            .is_member(
                &StorageKey::new(ALLOWED_LISTENERS_PREFIX, conversation_id),
                profile_id,
            )
            .await
            .with_context(|| format!("Failed to check listeners of conversation {}", conversation_id))
    }
}
