use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Names of the three channels belonging to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub control: String,
    pub presence: String,
    pub content: String,
}

impl ChannelNames {
    pub fn new(prefix: &str, session_id: &str) -> Self {
        Self {
            control: format!("{}.{}.control", prefix, session_id),
            presence: format!("{}.{}.presence", prefix, session_id),
            content: format!("{}.{}.content", prefix, session_id),
        }
    }

    /// Control subject addressed to a single client
    pub fn control_for(&self, client_id: &str) -> String {
        format!("{}.{}", self.control, client_id)
    }

    /// Control subject every client listens on
    pub fn control_all(&self) -> String {
        format!("{}.all", self.control)
    }

    /// Subject the transport uses to ask attached clients to re-announce
    pub fn presence_probe(&self) -> String {
        format!("{}.probe", self.presence)
    }
}

/// What a credential allows on one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Publish,
    Subscribe,
    Presence,
}

/// Presence message published by clients on the presence channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub client_id: String,
    pub action: PresenceAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Enter,
    Present,
    Leave,
    Absent,
    Update,
}

/// Credential issued to a client for one session.
///
/// This is the grant handed to the broker's authorization callout. It names
/// the exact subjects the client uses: presence and its probe, broadcast
/// control and the client's own control subject, and content, which only
/// whisperers may publish on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientToken {
    pub client_id: String,
    pub session_id: String,
    pub capabilities: BTreeMap<String, Vec<Capability>>,
    pub issued_at: DateTime<Utc>,
}

impl ClientToken {
    pub fn new(
        session_id: &str,
        client_id: &str,
        channels: &ChannelNames,
        can_whisper: bool,
    ) -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(channels.presence.clone(), vec![Capability::Presence]);
        capabilities.insert(channels.presence_probe(), vec![Capability::Subscribe]);
        capabilities.insert(channels.control_all(), vec![Capability::Subscribe]);
        capabilities.insert(channels.control_for(client_id), vec![Capability::Subscribe]);
        let content = if can_whisper {
            vec![Capability::Publish, Capability::Subscribe]
        } else {
            vec![Capability::Subscribe]
        };
        capabilities.insert(channels.content.clone(), content);

        Self {
            client_id: client_id.to_string(),
            session_id: session_id.to_string(),
            capabilities,
            issued_at: Utc::now(),
        }
    }

    /// Whether the token allows `capability` on `channel`
    pub fn allows(&self, channel: &str, capability: Capability) -> bool {
        self.capabilities
            .get(channel)
            .map(|caps| caps.contains(&capability))
            .unwrap_or(false)
    }

    /// Opaque form handed to clients (base64 of the JSON grant)
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("Client token is not valid base64")?;
        serde_json::from_slice(&json).context("Client token is not a valid grant")
    }
}
