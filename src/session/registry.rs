use super::error::{SessionError, SessionResult};
use super::session::{Session, SessionServices};
use super::state::{SessionState, Transcript};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Holder for the session of one conversation id.
///
/// Locking a slot serializes creation and teardown of that conversation's
/// session without blocking other ids.
type Slot = Mutex<Option<Arc<Session>>>;

type Slots = Mutex<HashMap<String, Arc<Slot>>>;

/// A session's link back to the registry entry that holds it
pub(crate) struct Registration {
    slots: Weak<Slots>,
    slot: Weak<Slot>,
}

impl Registration {
    /// Remove the session from the registry; later lookups create a new one
    pub(crate) async fn release(&self, session_id: &str) {
        let Some(slot) = self.slot.upgrade() else {
            return;
        };
        slot.lock().await.take();
        if let Some(slots) = self.slots.upgrade() {
            remove_slot(&slots, session_id, &slot).await;
        }
    }
}

/// Drop the map entry for `session_id` if it still points at `slot`
async fn remove_slot(slots: &Slots, session_id: &str, slot: &Arc<Slot>) {
    let mut slots = slots.lock().await;
    if slots
        .get(session_id)
        .map(|current| Arc::ptr_eq(current, slot))
        .unwrap_or(false)
    {
        slots.remove(session_id);
    }
}

/// The live sessions of this server instance, at most one per conversation
pub struct SessionRegistry {
    services: SessionServices,
    slots: Arc<Slots>,

    /// Cancelled once the instance starts shutting down
    closing: CancellationToken,
}

impl SessionRegistry {
    pub fn new(services: SessionServices) -> Self {
        Self {
            services,
            slots: Arc::new(Mutex::new(HashMap::new())),
            closing: CancellationToken::new(),
        }
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Stop starting and resuming sessions. Running sessions are untouched.
    pub fn close(&self) {
        if !self.closing.is_cancelled() {
            info!("Session registry closing");
            self.closing.cancel();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Find the running session for a conversation, or start one.
    ///
    /// A new session resumes from a suspended snapshot when one exists. If
    /// the session fails to start, the snapshot is put back. Once the registry
    /// is closing, running sessions are still returned but no new one starts.
    pub async fn get_session(&self, session_id: &str) -> SessionResult<Arc<Session>> {
        loop {
            let slot = {
                let mut slots = self.slots.lock().await;
                Arc::clone(
                    slots
                        .entry(session_id.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(None))),
                )
            };

            let mut current = slot.lock().await;
            if !self.is_current(session_id, &slot).await {
                // released while we waited for it
                continue;
            }
            if let Some(session) = current.as_ref() {
                return Ok(Arc::clone(session));
            }
            // the slot is already mapped, so a shutdown that closed after this
            // check waits for the session below and stops it too
            if self.is_closing() {
                drop(current);
                remove_slot(&self.slots, session_id, &slot).await;
                return Err(SessionError::Closing);
            }

            let snapshot = match self.services.suspend.take_suspended_state(session_id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    drop(current);
                    remove_slot(&self.slots, session_id, &slot).await;
                    return Err(SessionError::Storage(e));
                }
            };
            let resumed = snapshot.is_some();
            let state = snapshot.unwrap_or_else(|| SessionState::new(session_id));
            let saved = resumed.then(|| state.clone());

            let registration = Registration {
                slots: Arc::downgrade(&self.slots),
                slot: Arc::downgrade(&slot),
            };
            let session = Session::new(state, self.services.clone(), registration);
            if let Err(e) = session.start().await {
                error!("Failed to start session {}: {:#}", session_id, e);
                if let Some(state) = saved {
                    if let Err(restore_err) = self.services.suspend.suspend_state(&state).await {
                        error!(
                            "Failed to restore snapshot of session {}: {:#}",
                            session_id, restore_err
                        );
                    }
                }
                drop(current);
                remove_slot(&self.slots, session_id, &slot).await;
                return Err(SessionError::Transport(e));
            }

            info!(
                "{} session {}",
                if resumed { "Resumed" } else { "Created" },
                session_id
            );
            *current = Some(Arc::clone(&session));
            return Ok(session);
        }
    }

    /// The running session for a conversation, without creating one
    pub async fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        let slot = self.slots.lock().await.get(session_id).cloned()?;
        let current = slot.lock().await;
        current.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions().await.len()
    }

    async fn sessions(&self) -> Vec<Arc<Session>> {
        let slots: Vec<Arc<Slot>> = self.slots.lock().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(session) = slot.lock().await.clone() {
                sessions.push(session);
            }
        }
        sessions
    }

    /// Saved transcript by id
    pub async fn stored_transcript(&self, transcript_id: &str) -> Result<Option<Transcript>> {
        self.services.suspend.stored_transcript(transcript_id).await
    }

    /// End every running session immediately; returns how many there were
    pub async fn end_all(&self) -> usize {
        self.close();
        let sessions = self.sessions().await;
        let count = sessions.len();
        for session in sessions {
            session.end().await;
        }
        info!("Ended {} sessions", count);
        count
    }

    /// Suspend every running session for another instance to resume.
    ///
    /// Closes the registry, waits out the grace period, then queues the
    /// suspended ids. Returns how many sessions were suspended.
    pub async fn shutdown_all(&self) -> usize {
        self.close();
        let sessions = self.sessions().await;
        if sessions.is_empty() {
            return 0;
        }

        let (completed_tx, mut completed_rx) = mpsc::channel(sessions.len());
        let mut pending = 0;
        for session in &sessions {
            if session.shutdown(completed_tx.clone()).await {
                pending += 1;
            }
        }
        drop(completed_tx);

        let mut suspended = 0;
        while pending > 0 {
            let Some(session_id) = completed_rx.recv().await else {
                break;
            };
            pending -= 1;
            match self.services.suspend.suspend_session(&session_id).await {
                Ok(()) => suspended += 1,
                Err(e) => error!("Failed to queue suspended session {}: {:#}", session_id, e),
            }
        }
        info!("Suspended {} sessions", suspended);
        suspended
    }

    /// Stop every session, either handing them off or ending them outright
    pub async fn shutdown(&self, end_sessions: bool) -> usize {
        if end_sessions {
            self.end_all().await
        } else {
            self.shutdown_all().await
        }
    }

    /// Resume sessions other instances suspended, until none arrive within the
    /// resume timeout or the registry closes.
    ///
    /// Each id gets two attempts. An id that fails both stays queued for a
    /// later instance; resumption stops once only such ids come back around.
    pub async fn resume_suspended_sessions(&self) -> usize {
        let timeout = self.services.config.resume_timeout;
        let mut resumed = 0;
        let mut failed = HashSet::new();
        loop {
            let next = tokio::select! {
                _ = self.closing.cancelled() => {
                    info!("Stopped resuming suspended sessions at shutdown");
                    break;
                }
                next = self.services.suspend.wait_for_suspended_session(timeout) => next,
            };
            let session_id = match next {
                Ok(Some(session_id)) => session_id,
                Ok(None) => {
                    info!("No more suspended sessions after {:?}", timeout);
                    break;
                }
                Err(e) => {
                    error!("Failed to retrieve suspended session: {:#}", e);
                    break;
                }
            };
            if failed.contains(&session_id) {
                info!(
                    "Giving up on resuming suspended sessions, {} could not be started",
                    failed.len()
                );
                break;
            }

            if let Err(e) = self.get_session(&session_id).await {
                if matches!(e, SessionError::Closing) {
                    break;
                }
                warn!("First attempt to resume session {} failed: {}", session_id, e);
                if let Err(e) = self.get_session(&session_id).await {
                    error!(
                        "Second attempt to resume session {} failed, leaving it queued: {}",
                        session_id, e
                    );
                    failed.insert(session_id);
                    continue;
                }
            }

            if let Err(e) = self.services.suspend.remove_suspended_session(&session_id).await {
                error!(
                    "Failed to dequeue resumed session {}: {:#}",
                    session_id, e
                );
                info!("Giving up on resuming suspended sessions");
                break;
            }
            resumed += 1;
        }
        resumed
    }

    async fn is_current(&self, session_id: &str, slot: &Arc<Slot>) -> bool {
        self.slots
            .lock()
            .await
            .get(session_id)
            .map(|current| Arc::ptr_eq(current, slot))
            .unwrap_or(false)
    }
}
