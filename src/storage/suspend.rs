use super::{KeyValueStore, ListEnd, StorageKey};
use crate::protocol::ContentPacket;
use crate::session::{SessionState, Transcript};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const SUSPENDED_LIST_PREFIX: &str = "list:";
const SUSPENDED_LIST_ID: &str = "suspended-session-list";
const SUSPENDED_STATE_PREFIX: &str = "suspended-session-state:";
const SUSPENDED_PACKETS_PREFIX: &str = "suspended-packets:";
const STORED_TRANSCRIPT_PREFIX: &str = "stored-transcript:";

/// Current layout of a suspended-session snapshot
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    state: &'a SessionState,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    state: SessionState,
}

/// Handoff records shared between server instances
///
/// - the suspended-session list, a queue of ids waiting to be resumed
/// - per-session snapshots, consumed on read
/// - per-session buffered content packets, expiring once read
/// - finalized transcripts
#[derive(Clone)]
pub struct SuspendStore {
    store: Arc<dyn KeyValueStore>,
    packet_ttl: Duration,
    transcript_ttl: Duration,
}

impl SuspendStore {
    pub fn new(store: Arc<dyn KeyValueStore>, packet_ttl: Duration, transcript_ttl: Duration) -> Self {
        Self {
            store,
            packet_ttl,
            transcript_ttl,
        }
    }

    fn suspended_list() -> StorageKey {
        StorageKey::new(SUSPENDED_LIST_PREFIX, SUSPENDED_LIST_ID)
    }

    /// Queue a session id for another instance to resume
    pub async fn suspend_session(&self, session_id: &str) -> Result<()> {
        self.store
            .push_range(&Self::suspended_list(), ListEnd::Left, &[session_id.to_string()])
            .await
            .with_context(|| format!("Failed to queue suspended session {}", session_id))
    }

    pub async fn remove_suspended_session(&self, session_id: &str) -> Result<()> {
        self.store
            .remove_element(&Self::suspended_list(), 1, session_id)
            .await
            .with_context(|| format!("Failed to dequeue suspended session {}", session_id))
    }

    /// Wait for a queued session id; `None` when the timeout passes first.
    ///
    /// The id stays queued until [`SuspendStore::remove_suspended_session`].
    pub async fn wait_for_suspended_session(&self, timeout: Duration) -> Result<Option<String>> {
        self.store
            .rotate_blocking(&Self::suspended_list(), timeout)
            .await
            .context("Failed to wait for suspended sessions")
    }

    pub async fn suspend_state(&self, state: &SessionState) -> Result<()> {
        let blob = serde_json::to_vec(&SnapshotRef {
            version: SNAPSHOT_VERSION,
            state,
        })
        .context("Failed to serialize session snapshot")?;
        self.store
            .set_blob(&StorageKey::new(SUSPENDED_STATE_PREFIX, &state.id), blob, None)
            .await
            .with_context(|| format!("Failed to store snapshot of session {}", state.id))
    }

    /// Consume the snapshot of a suspended session, if one exists
    pub async fn take_suspended_state(&self, session_id: &str) -> Result<Option<SessionState>> {
        let key = StorageKey::new(SUSPENDED_STATE_PREFIX, session_id);
        let Some(blob) = self
            .store
            .get_blob(&key)
            .await
            .with_context(|| format!("Failed to load snapshot of session {}", session_id))?
        else {
            return Ok(None);
        };

        let snapshot: Snapshot = serde_json::from_slice(&blob)
            .with_context(|| format!("Failed to parse snapshot of session {}", session_id))?;
        if snapshot.version != SNAPSHOT_VERSION {
            bail!(
                "Unsupported snapshot version {} for session {}",
                snapshot.version,
                session_id
            );
        }

        if let Err(e) = self.store.delete(&key).await {
            warn!("Failed to delete snapshot of session {}: {:#}", session_id, e);
        }
        Ok(Some(snapshot.state))
    }

    /// Packets a prior instance buffered for this session, oldest first.
    ///
    /// Reading starts their expiry clock.
    pub async fn suspended_packets(&self, session_id: &str) -> Result<Vec<ContentPacket>> {
        let key = StorageKey::new(SUSPENDED_PACKETS_PREFIX, session_id);
        let encoded = self
            .store
            .fetch_range(&key, 0, -1)
            .await
            .with_context(|| format!("Failed to load buffered packets of session {}", session_id))?;
        if let Err(e) = self.store.set_expiration(&key, self.packet_ttl).await {
            warn!(
                "Failed to expire buffered packets of session {}: {:#}",
                session_id, e
            );
        }
        Ok(encoded.iter().map(|s| ContentPacket::parse(s)).collect())
    }

    pub async fn suspend_packets(&self, session_id: &str, packets: &[ContentPacket]) -> Result<()> {
        if packets.is_empty() {
            return Ok(());
        }
        let encoded: Vec<String> = packets.iter().map(ContentPacket::encode).collect();
        self.store
            .push_range(
                &StorageKey::new(SUSPENDED_PACKETS_PREFIX, session_id),
                ListEnd::Right,
                &encoded,
            )
            .await
            .with_context(|| format!("Failed to buffer packets of session {}", session_id))
    }

    pub async fn store_transcript(&self, transcript: &Transcript) -> Result<()> {
        let blob = serde_json::to_vec(transcript).context("Failed to serialize transcript")?;
        self.store
            .set_blob(
                &StorageKey::new(STORED_TRANSCRIPT_PREFIX, &transcript.id),
                blob,
                Some(self.transcript_ttl),
            )
            .await
            .with_context(|| format!("Failed to store transcript {}", transcript.id))
    }

    pub async fn stored_transcript(&self, transcript_id: &str) -> Result<Option<Transcript>> {
        let key = StorageKey::new(STORED_TRANSCRIPT_PREFIX, transcript_id);
        let Some(blob) = self
            .store
            .get_blob(&key)
            .await
            .with_context(|| format!("Failed to load transcript {}", transcript_id))?
        else {
            return Ok(None);
        };
        let transcript = serde_json::from_slice(&blob)
            .with_context(|| format!("Failed to parse transcript {}", transcript_id))?;
        Ok(Some(transcript))
    }
}
