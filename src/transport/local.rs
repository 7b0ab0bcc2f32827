use super::messages::{ChannelNames, ClientToken, PresenceAction};
use super::roster::Roster;
use super::{offer, ContentEvent, ContentSender, StatusSender, Transport};
use crate::protocol::ContentPacket;
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

const CHANNEL_PREFIX: &str = "local";
const CONTROL_CAPACITY: usize = 256;

/// Who a control message was addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlTarget {
    All,
    Client(String),
}

/// A control packet as delivered on the local control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub target: ControlTarget,
    pub packet: String,
}

struct LocalSession {
    channels: ChannelNames,
    content: ContentSender,
    status: StatusSender,
    roster: Mutex<Roster>,
    control: broadcast::Sender<ControlMessage>,
}

/// In-process transport.
///
/// Every session gets a broadcast channel for control traffic; content and
/// presence are injected by the embedding process through
/// [`LocalTransport::publish_content`] and [`LocalTransport::set_presence`].
/// Control traffic is also kept in a per-session log that outlives the session.
pub struct LocalTransport {
    sessions: RwLock<HashMap<String, Arc<LocalSession>>>,
    control_log: Mutex<HashMap<String, Vec<ControlMessage>>>,
    fail_start: AtomicBool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            control_log: Mutex::new(HashMap::new()),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `start_session` fail (until reset)
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub async fn is_started(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Publish a content packet as its author.
    ///
    /// Only clients holding whisperer capability may publish content.
    pub async fn publish_content(&self, session_id: &str, packet: ContentPacket) -> Result<bool> {
        let session = self.session(session_id).await?;
        if !session.roster.lock().await.can_whisper(&packet.client_id) {
            bail!(
                "client {} may not publish content in session {}",
                packet.client_id,
                session_id
            );
        }
        debug!("Received content packet in {}: {}", session_id, packet);
        Ok(offer(&session.content, ContentEvent::Packet(packet), session_id))
    }

    /// Mark a client as attached to (or detached from) the presence channel
    pub async fn set_presence(&self, session_id: &str, client_id: &str, online: bool) -> Result<()> {
        let session = self.session(session_id).await?;
        let action = if online {
            PresenceAction::Enter
        } else {
            PresenceAction::Leave
        };
        let change = session.roster.lock().await.presence_changed(client_id, action);
        if let Some(status) = change {
            offer(&session.status, status, session_id);
        }
        Ok(())
    }

    /// Every control message sent in a session so far, oldest first
    pub async fn control_log(&self, session_id: &str) -> Vec<ControlMessage> {
        self.control_log
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribe to a running session's control channel
    pub async fn subscribe_control(
        &self,
        session_id: &str,
    ) -> Option<broadcast::Receiver<ControlMessage>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.control.subscribe())
    }

    async fn session(&self, session_id: &str) -> Result<Arc<LocalSession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| anyhow!("no session {}", session_id))
    }

    async fn deliver(&self, session_id: &str, message: ControlMessage) -> Result<()> {
        let session = self.session(session_id).await?;
        self.control_log
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        // no subscribers is fine: nobody is listening yet
        let _ = session.control.send(message);
        Ok(())
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn start_session(
        &self,
        session_id: &str,
        content: ContentSender,
        status: StatusSender,
    ) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            bail!("local transport refused to start session {}", session_id);
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            bail!("session {} already started", session_id);
        }

        let (control, _) = broadcast::channel(CONTROL_CAPACITY);
        let session = Arc::new(LocalSession {
            channels: ChannelNames::new(CHANNEL_PREFIX, session_id),
            content,
            status,
            roster: Mutex::new(Roster::new()),
            control,
        });
        offer(&session.content, ContentEvent::Attached, session_id);
        sessions.insert(session_id.to_string(), session);

        info!("Local transport attached to session {}", session_id);
        Ok(())
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        if self.sessions.write().await.remove(session_id).is_none() {
            bail!("no session {}", session_id);
        }
        info!("Local transport detached from session {}", session_id);
        Ok(())
    }

    async fn add_whisperer(&self, session_id: &str, client_id: &str) -> Result<bool> {
        let session = self.session(session_id).await?;
        let attached = session.roster.lock().await.add_whisperer(client_id);
        Ok(attached)
    }

    async fn add_listener(&self, session_id: &str, client_id: &str) -> Result<bool> {
        let session = self.session(session_id).await?;
        let attached = session.roster.lock().await.add_listener(client_id);
        Ok(attached)
    }

    async fn client_token(&self, session_id: &str, client_id: &str) -> Result<Option<ClientToken>> {
        let session = self.session(session_id).await?;
        let roster = session.roster.lock().await;
        Ok(roster.token(session_id, client_id, &session.channels))
    }

    async fn remove_client(&self, session_id: &str, client_id: &str) -> Result<()> {
        let session = self.session(session_id).await?;
        let mut roster = session.roster.lock().await;
        roster.remove(client_id)
    }

    async fn send(&self, session_id: &str, client_id: &str, packet: &str) -> Result<()> {
        let session = self.session(session_id).await?;
        if !session.roster.lock().await.contains(client_id) {
            bail!("unknown client: {}", client_id);
        }
        self.deliver(
            session_id,
            ControlMessage {
                target: ControlTarget::Client(client_id.to_string()),
                packet: packet.to_string(),
            },
        )
        .await
    }

    async fn broadcast(&self, session_id: &str, packet: &str) -> Result<()> {
        self.deliver(
            session_id,
            ControlMessage {
                target: ControlTarget::All,
                packet: packet.to_string(),
            },
        )
        .await
    }

    fn name(&self) -> &str {
        "local"
    }
}
