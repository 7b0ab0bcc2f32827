use super::config::SessionConfig;
use super::error::{SessionError, SessionResult};
use super::registry::Registration;
use super::state::{PastTextLine, Participant, SessionState, Transcript};
use crate::protocol::{process_live_chunk, ContentChunk, ContentPacket, ControlSignal};
use crate::speech::SpeechGenerator;
use crate::storage::SuspendStore;
use crate::transport::{
    ClientStatus, ClientToken, ContentEvent, ContentReceiver, ContentSender, StatusReceiver,
    StatusSender, Transport,
};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a session in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Starting,
    Active,
    ShuttingDown,
    /// Terminal: the Whisperer ended the session
    Ended,
    /// Terminal here: another instance may resume the session
    Suspended,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Starting => "starting",
            SessionPhase::Active => "active",
            SessionPhase::ShuttingDown => "shutting_down",
            SessionPhase::Ended => "ended",
            SessionPhase::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

/// Collaborators every session is built with
#[derive(Clone)]
pub struct SessionServices {
    pub transport: Arc<dyn Transport>,
    pub speech: Arc<dyn SpeechGenerator>,
    pub suspend: SuspendStore,
    pub config: SessionConfig,
}

/// The open line and the packets that built it
#[derive(Debug, Default)]
struct LiveText {
    text: String,
    packets: Vec<ContentPacket>,
}

struct Queues {
    content_tx: ContentSender,
    content_rx: ContentReceiver,
    status_tx: StatusSender,
    status_rx: StatusReceiver,
}

/// One running conversation: its participants, its text, and the two
/// background tasks that follow presence and content.
///
/// Lock order is `state` before `live`.
pub struct Session {
    /// Conversation id
    id: String,

    services: SessionServices,

    /// Persistable state
    state: Mutex<SessionState>,

    /// Uncommitted text, rebuilt from packets on resume
    live: Mutex<LiveText>,

    phase: watch::Sender<SessionPhase>,

    /// Stops both background tasks
    cancel: CancellationToken,

    /// Queues handed to the transport at start
    queues: Mutex<Option<Queues>>,

    /// Handles for the presence and content tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,

    registration: Registration,
}

impl Session {
    pub(crate) fn new(
        state: SessionState,
        services: SessionServices,
        registration: Registration,
    ) -> Arc<Self> {
        let capacity = services.config.queue_capacity.max(1);
        let (content_tx, content_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = mpsc::channel(capacity);
        let (phase, _) = watch::channel(SessionPhase::Starting);

        Arc::new(Self {
            id: state.id.clone(),
            services,
            state: Mutex::new(state),
            live: Mutex::new(LiveText::default()),
            phase,
            cancel: CancellationToken::new(),
            queues: Mutex::new(Some(Queues {
                content_tx,
                content_rx,
                status_tx,
                status_rx,
            })),
            tasks: Mutex::new(Vec::new()),
            registration,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Follow phase transitions
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Attach to the transport, re-register known participants, and start the
    /// background tasks
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(queues) = self.queues.lock().await.take() else {
            anyhow::bail!("session {} already started", self.id);
        };
        let transport = &self.services.transport;

        info!(
            "Starting session {} on {} transport",
            self.id,
            transport.name()
        );
        transport
            .start_session(&self.id, queues.content_tx, queues.status_tx)
            .await
            .with_context(|| format!("Failed to attach session {} to transport", self.id))?;

        if let Err(e) = self.register_participants().await {
            if let Err(end_err) = transport.end_session(&self.id).await {
                warn!(
                    "Failed to detach session {} after start failure: {:#}",
                    self.id, end_err
                );
            }
            return Err(e);
        }

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(tokio::spawn(
                Arc::clone(self).monitor_participants(queues.status_rx),
            ));
            tasks.push(tokio::spawn(
                Arc::clone(self).transcribe_content(queues.content_rx),
            ));
        }

        self.transition(SessionPhase::Starting, SessionPhase::Active);

        let state = self.state.lock().await;
        self.notify_needs_auth(&state).await;
        info!(
            "Session {} active with {} participants and {} waiting",
            self.id,
            state.participants.len(),
            state.waitlist.len()
        );
        Ok(())
    }

    async fn register_participants(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for participant in state.participants.values_mut() {
            let online = self.register(participant).await.with_context(|| {
                format!(
                    "Failed to register client {} in session {}",
                    participant.client_id, self.id
                )
            })?;
            participant.is_online = online;
        }
        Ok(())
    }

    /// Grant a participant its transport capability; returns whether it is online
    async fn register(&self, participant: &Participant) -> Result<bool> {
        let transport = &self.services.transport;
        if participant.is_whisperer {
            transport
                .add_whisperer(&self.id, &participant.client_id)
                .await
        } else {
            transport
                .add_listener(&self.id, &participant.client_id)
                .await
        }
    }

    pub async fn add_whisperer(
        &self,
        client_id: &str,
        profile_id: &str,
        name: &str,
    ) -> SessionResult<()> {
        self.admit(Participant::new(client_id, profile_id, name, true))
            .await
    }

    /// Admit a listener, taking it off the waitlist if it was waiting
    pub async fn add_listener(
        &self,
        client_id: &str,
        profile_id: &str,
        name: &str,
    ) -> SessionResult<()> {
        self.admit(Participant::new(client_id, profile_id, name, false))
            .await
    }

    async fn admit(&self, mut participant: Participant) -> SessionResult<()> {
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if state.participants.contains_key(&participant.client_id) {
            return Err(SessionError::AlreadyPresent);
        }

        let online = self.register(&participant).await.map_err(|e| {
            error!(
                "Failed to register client {} in session {}: {:#}",
                participant.client_id, self.id, e
            );
            SessionError::Transport(e)
        })?;
        participant.is_online = online;

        state.remove_waiting(&participant.client_id);
        info!(
            "Admitted {} {} ({}) to session {}",
            if participant.is_whisperer {
                "whisperer"
            } else {
                "listener"
            },
            participant.client_id,
            participant.name,
            self.id
        );
        state
            .participants
            .insert(participant.client_id.clone(), participant);
        self.notify_needs_auth(&state).await;
        Ok(())
    }

    /// Ask the Whisperer to admit a listener
    pub async fn add_listener_request(
        &self,
        client_id: &str,
        profile_id: &str,
        name: &str,
    ) -> SessionResult<()> {
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if state.is_tracked(client_id) {
            return Err(SessionError::AlreadyPresent);
        }

        info!("Client {} waiting to join session {}", client_id, self.id);
        state
            .waitlist
            .push(Participant::new(client_id, profile_id, name, false));
        self.notify_needs_auth(&state).await;
        Ok(())
    }

    /// Drop a client from the waitlist or from the participants
    pub async fn remove_client(&self, client_id: &str) -> SessionResult<()> {
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if state.remove_waiting(client_id).is_some() {
            info!("Withdrew request of {} in session {}", client_id, self.id);
            return Ok(());
        }
        if !state.participants.contains_key(client_id) {
            return Err(SessionError::NotPresent);
        }

        self.services
            .transport
            .remove_client(&self.id, client_id)
            .await
            .map_err(|e| {
                error!(
                    "Failed to remove client {} from session {}: {:#}",
                    client_id, self.id, e
                );
                SessionError::Transport(e)
            })?;
        state.participants.remove(client_id);
        info!("Removed client {} from session {}", client_id, self.id);
        Ok(())
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.state
            .lock()
            .await
            .participants
            .values()
            .cloned()
            .collect()
    }

    /// Listeners waiting for admission, oldest first
    pub async fn requesters(&self) -> Vec<Participant> {
        self.state.lock().await.waitlist.clone()
    }

    pub async fn live_text(&self) -> String {
        self.live.lock().await.text.clone()
    }

    pub async fn past_text(&self) -> Vec<PastTextLine> {
        self.state.lock().await.past_text.clone()
    }

    /// Copy of the persistable state
    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    pub async fn transcript_id(&self) -> Option<String> {
        self.state.lock().await.transcript_id.clone()
    }

    /// Credential a participant attaches to the transport with
    pub async fn client_token(&self, client_id: &str) -> Result<Option<ClientToken>> {
        self.services
            .transport
            .client_token(&self.id, client_id)
            .await
    }

    /// Request a transcript when the session ends; repeated calls return the
    /// same id
    pub async fn transcribe(&self) -> String {
        let mut state = self.state.lock().await;
        state
            .transcript_id
            .get_or_insert_with(|| {
                let id = uuid::Uuid::new_v4().to_string();
                info!("Session {} will be transcribed as {}", self.id, id);
                id
            })
            .clone()
    }

    /// End the session for everyone.
    ///
    /// Returns the transcript id when a requested transcript was saved.
    pub async fn end(self: &Arc<Self>) -> Option<String> {
        if !self.transition(SessionPhase::Active, SessionPhase::Ended) {
            warn!(
                "Ignoring end of session {} in phase {}",
                self.id,
                self.phase()
            );
            return None;
        }

        info!("Ending session {}", self.id);
        self.registration.release(&self.id).await;
        self.state.lock().await.ended_at = Some(Utc::now());

        self.broadcast(ControlSignal::End).await;
        self.cancel.cancel();
        self.join_tasks().await;
        if let Err(e) = self.services.transport.end_session(&self.id).await {
            error!("Failed to detach ended session {}: {:#}", self.id, e);
        }

        let transcript_id = self.finalize_transcript().await;
        info!("Session {} ended", self.id);
        transcript_id
    }

    /// Hand the session off to another instance.
    ///
    /// The session leaves the registry at once but keeps buffering content
    /// for the grace period. It then detaches, persists its snapshot, and
    /// sends its id on `notify`. Returns false if the session was not active.
    pub async fn shutdown(self: &Arc<Self>, notify: mpsc::Sender<String>) -> bool {
        if !self.transition(SessionPhase::Active, SessionPhase::ShuttingDown) {
            warn!(
                "Ignoring shutdown of session {} in phase {}",
                self.id,
                self.phase()
            );
            return false;
        }

        info!(
            "Suspending session {} after {:?} grace period",
            self.id, self.services.config.grace_period
        );
        self.registration.release(&self.id).await;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(session.services.config.grace_period) => {}
                _ = session.cancel.cancelled() => {}
            }
            session.cancel.cancel();
            session.join_tasks().await;

            if let Err(e) = session.services.transport.end_session(&session.id).await {
                error!("Failed to detach suspended session {}: {:#}", session.id, e);
            }
            let state = session.state.lock().await.clone();
            if let Err(e) = session.services.suspend.suspend_state(&state).await {
                error!("Failed to suspend session {}: {:#}", session.id, e);
            }

            session.phase.send_replace(SessionPhase::Suspended);
            info!("Session {} suspended", session.id);
            if notify.send(session.id.clone()).await.is_err() {
                warn!("Nobody waiting for suspension of session {}", session.id);
            }
        });
        true
    }

    fn ensure_active(&self) -> SessionResult<()> {
        if self.phase() == SessionPhase::Active {
            Ok(())
        } else {
            Err(SessionError::Inactive)
        }
    }

    fn transition(&self, from: SessionPhase, to: SessionPhase) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        })
    }

    async fn join_tasks(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Session {} task failed: {}", self.id, e);
            }
        }
    }

    async fn broadcast(&self, signal: ControlSignal) {
        let packet = signal.to_packet();
        if let Err(e) = self.services.transport.broadcast(&self.id, &packet).await {
            error!(
                "Failed to broadcast {} in session {}: {:#}",
                packet, self.id, e
            );
        }
    }

    /// Tell an online Whisperer that listeners are waiting
    async fn notify_needs_auth(&self, state: &SessionState) {
        if state.waitlist.is_empty() {
            return;
        }
        let Some(whisperer) = state.online_whisperer() else {
            return;
        };

        let packet = ControlSignal::RequestsPending.to_packet();
        if let Err(e) = self
            .services
            .transport
            .send(&self.id, &whisperer.client_id, &packet)
            .await
        {
            error!(
                "Failed to send {} to whisperer {} in session {}: {:#}",
                packet, whisperer.client_id, self.id, e
            );
        }
    }

    async fn finalize_transcript(&self) -> Option<String> {
        let transcript = {
            let mut state = self.state.lock().await;
            let transcript_id = state.transcript_id.take()?;
            let live = self.live.lock().await;
            let mut transcript = Transcript::from_state(&transcript_id, &state);
            if !live.text.is_empty() {
                transcript.past_text.push(PastTextLine::now(live.text.clone()));
            }
            transcript
        };
        let transcript_id = transcript.id.clone();

        match self.services.suspend.store_transcript(&transcript).await {
            Ok(()) => {
                info!(
                    "Saved transcript {} of session {} ({} lines)",
                    transcript_id,
                    self.id,
                    transcript.past_text.len()
                );
                Some(transcript_id)
            }
            Err(e) => {
                error!(
                    "Failed to save transcript {} of session {}: {:#}",
                    transcript_id, self.id, e
                );
                None
            }
        }
    }

    async fn monitor_participants(self: Arc<Self>, mut status: StatusReceiver) {
        info!("Monitoring participants of session {}", self.id);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                change = status.recv() => match change {
                    Some(change) => self.participant_status(change).await,
                    None => break,
                },
            }
        }
        info!("Stopped monitoring participants of session {}", self.id);
    }

    async fn participant_status(&self, change: ClientStatus) {
        {
            let mut state = self.state.lock().await;
            let Some(participant) = state.participants.get_mut(&change.client_id) else {
                return;
            };
            participant.is_online = change.is_online;
            let whisperer_arrived = participant.is_whisperer && change.is_online;
            debug!(
                "Client {} in session {} is now {}",
                change.client_id,
                self.id,
                if change.is_online { "online" } else { "offline" }
            );
            if whisperer_arrived {
                self.notify_needs_auth(&state).await;
            }
        }
        self.broadcast(ControlSignal::ParticipantsChanged).await;
    }

    async fn transcribe_content(self: Arc<Self>, mut content: ContentReceiver) {
        info!("Transcribing content of session {}", self.id);

        // the transport always signals attachment first
        let early = tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Stopped transcribing content of session {}", self.id);
                return;
            }
            event = content.recv() => match event {
                Some(ContentEvent::Attached) => None,
                Some(ContentEvent::Packet(packet)) => {
                    warn!("Session {} received content before attaching", self.id);
                    Some(packet)
                }
                None => return,
            },
        };

        let backlog = match self.services.suspend.suspended_packets(&self.id).await {
            Ok(backlog) => backlog,
            Err(e) => {
                error!("Failed to load buffered packets of session {}: {:#}", self.id, e);
                Vec::new()
            }
        };
        let processed: HashSet<String> = backlog.iter().map(|p| p.packet_id.clone()).collect();
        let mut packets_to_check = backlog.len();
        if !backlog.is_empty() {
            info!(
                "Replaying {} buffered packets in session {}",
                backlog.len(),
                self.id
            );
        }
        for packet in backlog {
            self.transcribe_one_packet(packet).await;
        }
        if let Some(packet) = early {
            self.transcribe_one_packet(packet).await;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if self.phase() == SessionPhase::ShuttingDown {
                        self.flush_live_packets().await;
                    }
                    break;
                }
                event = content.recv() => match event {
                    Some(ContentEvent::Packet(packet)) => {
                        if self.phase() == SessionPhase::ShuttingDown {
                            self.buffer_packet(packet).await;
                            continue;
                        }
                        if packets_to_check > 0 {
                            // the prior instance may have seen this packet too
                            packets_to_check -= 1;
                            if processed.contains(&packet.packet_id) {
                                debug!("Skipping replayed packet {} in session {}", packet.packet_id, self.id);
                                continue;
                            }
                        }
                        self.transcribe_one_packet(packet).await;
                    }
                    Some(ContentEvent::Attached) => {
                        debug!("Session {} reattached", self.id);
                    }
                    None => break,
                },
            }
        }
        info!("Stopped transcribing content of session {}", self.id);
    }

    /// Apply one packet to the live text, committing any finished lines
    async fn transcribe_one_packet(&self, packet: ContentPacket) {
        let past = {
            let mut state = self.state.lock().await;
            let mut live = self.live.lock().await;
            let (text, past) = process_live_chunk(&live.text, &packet.chunk());
            if past.is_empty() {
                live.packets.push(packet.clone());
            } else {
                let now = Utc::now();
                state
                    .past_text
                    .extend(past.iter().map(|line| PastTextLine {
                        time: now,
                        text: line.clone(),
                    }));
                // only the open line needs replaying after a handoff
                live.packets = if text.is_empty() {
                    Vec::new()
                } else {
                    vec![ContentPacket::from_chunk(
                        packet.client_id.clone(),
                        &ContentChunk::new(0, text.clone()),
                    )]
                };
            }
            live.text = text;
            past
        };

        for (sequence, line) in past.iter().enumerate() {
            match self.services.speech.generate_speech(line).await {
                Ok(speech_id) => {
                    self.broadcast(ControlSignal::past_text_speech_id(
                        packet.packet_id.clone(),
                        sequence,
                        speech_id,
                    ))
                    .await
                }
                Err(e) => error!(
                    "Speech generation failed for packet {} in session {}: {:#}",
                    packet.packet_id, self.id, e
                ),
            }
        }
    }

    /// Keep a packet for the next instance while shutting down
    async fn buffer_packet(&self, packet: ContentPacket) {
        let mut live = self.live.lock().await;
        live.packets.push(packet);
        self.persist_live_packets(&mut live).await;
    }

    async fn flush_live_packets(&self) {
        let mut live = self.live.lock().await;
        if live.packets.is_empty() {
            return;
        }
        info!(
            "Saving {} live packets of session {} at shutdown",
            live.packets.len(),
            self.id
        );
        self.persist_live_packets(&mut live).await;
    }

    async fn persist_live_packets(&self, live: &mut LiveText) {
        match self
            .services
            .suspend
            .suspend_packets(&self.id, &live.packets)
            .await
        {
            Ok(()) => live.packets.clear(),
            Err(e) => error!(
                "Failed to save live packets of session {}: {:#}",
                self.id, e
            ),
        }
    }
}
