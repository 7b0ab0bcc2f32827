use super::messages::{ChannelNames, ClientToken, PresenceMessage};
use super::roster::Roster;
use super::{offer, ContentEvent, ContentSender, StatusSender, Transport};
use crate::protocol::ContentPacket;
use anyhow::{anyhow, bail, Context, Result};
use async_nats::{Client, Subscriber};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct NatsSession {
    channels: ChannelNames,
    roster: Arc<Mutex<Roster>>,
    cancel: CancellationToken,
}

/// Transport backed by NATS subjects.
///
/// All sessions share one connection. For a session `id` under prefix `p`:
/// - `p.id.control.{clientId}` / `p.id.control.all`: unicast / broadcast control
/// - `p.id.presence`: clients announce `enter`/`present`/`leave`/`absent`
/// - `p.id.presence.probe`: asks attached clients to re-announce
/// - `p.id.content`: encoded content packets from the Whisperer
pub struct NatsTransport {
    client: Client,
    subject_prefix: String,
    sessions: RwLock<HashMap<String, Arc<NatsSession>>>,
}

impl NatsTransport {
    /// Connect to NATS server
    pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            subject_prefix: subject_prefix.into(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    async fn session(&self, session_id: &str) -> Result<Arc<NatsSession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| anyhow!("no session {}", session_id))
    }

    async fn publish(&self, subject: String, packet: &str) -> Result<()> {
        self.client
            .publish(subject.clone(), packet.to_string().into())
            .await
            .with_context(|| format!("Failed to publish to {}", subject))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn start_session(
        &self,
        session_id: &str,
        content: ContentSender,
        status: StatusSender,
    ) -> Result<()> {
        if self.sessions.read().await.contains_key(session_id) {
            bail!("session {} already started", session_id);
        }

        info!("Opening NATS channels for session {}", session_id);

        let channels = ChannelNames::new(&self.subject_prefix, session_id);
        let presence_sub = self
            .client
            .subscribe(channels.presence.clone())
            .await
            .context("Failed to subscribe to presence channel")?;
        let content_sub = self
            .client
            .subscribe(channels.content.clone())
            .await
            .context("Failed to subscribe to content channel")?;

        let session = Arc::new(NatsSession {
            channels: channels.clone(),
            roster: Arc::new(Mutex::new(Roster::new())),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(receive_presence(
            session_id.to_string(),
            presence_sub,
            Arc::clone(&session.roster),
            status,
            session.cancel.clone(),
        ));
        tokio::spawn(receive_content(
            session_id.to_string(),
            content_sub,
            content.clone(),
            session.cancel.clone(),
        ));

        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), Arc::clone(&session));

        if let Err(e) = self.client.flush().await {
            warn!("Failed to flush NATS subscriptions for {}: {}", session_id, e);
        }
        if let Err(e) = self.publish(channels.presence_probe(), "").await {
            warn!("Failed to probe presence for {}: {}", session_id, e);
        }

        info!("NATS content channel attached for session {}", session_id);
        offer(&content, ContentEvent::Attached, session_id);

        Ok(())
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| anyhow!("no session {}", session_id))?;

        info!("Closing NATS channels for session {}", session_id);
        session.cancel.cancel();
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
        self.publish(session.channels.control_for(client_id), packet)
            .await
    }

    async fn broadcast(&self, session_id: &str, packet: &str) -> Result<()> {
        let session = self.session(session_id).await?;
        self.publish(session.channels.control_all(), packet).await
    }

    fn name(&self) -> &str {
        "nats"
    }
}

async fn receive_content(
    session_id: String,
    mut subscriber: Subscriber,
    content: ContentSender,
    cancel: CancellationToken,
) {
    debug!("Content receiver started for {}", session_id);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = subscriber.next() => {
                let Some(msg) = msg else { break };
                let text = match std::str::from_utf8(&msg.payload) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping non-UTF-8 content packet in {}: {}", session_id, e);
                        continue;
                    }
                };
                let mut packet = ContentPacket::parse(text);
                if packet.packet_id.is_empty() {
                    packet.packet_id = uuid::Uuid::new_v4().to_string();
                }
                debug!("Received content packet in {}: {}", session_id, packet);
                offer(&content, ContentEvent::Packet(packet), &session_id);
            }
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        error!("Failed to unsubscribe content channel for {}: {}", session_id, e);
    }
    debug!("Content receiver stopped for {}", session_id);
}

async fn receive_presence(
    session_id: String,
    mut subscriber: Subscriber,
    roster: Arc<Mutex<Roster>>,
    status: StatusSender,
    cancel: CancellationToken,
) {
    debug!("Presence receiver started for {}", session_id);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = subscriber.next() => {
                let Some(msg) = msg else { break };
                let presence = match serde_json::from_slice::<PresenceMessage>(&msg.payload) {
                    Ok(presence) => presence,
                    Err(e) => {
                        warn!("Failed to parse presence message in {}: {}", session_id, e);
                        continue;
                    }
                };
                debug!(
                    "Received presence message in {}: {} {:?}",
                    session_id, presence.client_id, presence.action
                );
                let change = roster
                    .lock()
                    .await
                    .presence_changed(&presence.client_id, presence.action);
                if let Some(change) = change {
                    offer(&status, change, &session_id);
                }
            }
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        error!("Failed to unsubscribe presence channel for {}: {}", session_id, e);
    }
    debug!("Presence receiver stopped for {}", session_id);
}
