use super::messages::{ChannelNames, ClientToken, PresenceAction};
use super::ClientStatus;
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Member {
    can_whisper: bool,
    attached: bool,
}

/// Capability and presence bookkeeping for one transport session.
///
/// Presence is tracked for every client seen on the presence channel, tracked
/// or not, so that a client admitted after attaching is reported online.
/// Status transitions are only reported for clients that hold a capability.
#[derive(Debug, Default)]
pub struct Roster {
    members: HashMap<String, Member>,
    present: HashSet<String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant whisperer capability (publish + subscribe on content)
    pub fn add_whisperer(&mut self, client_id: &str) -> bool {
        let attached = self.present.contains(client_id);
        let member = self.members.entry(client_id.to_string()).or_insert(Member {
            can_whisper: true,
            attached,
        });
        member.can_whisper = true;
        member.attached
    }

    /// Grant listener capability (subscribe on content).
    ///
    /// A client that already whispers keeps its publish rights.
    pub fn add_listener(&mut self, client_id: &str) -> bool {
        let attached = self.present.contains(client_id);
        self.members
            .entry(client_id.to_string())
            .or_insert(Member {
                can_whisper: false,
                attached,
            })
            .attached
    }

    pub fn remove(&mut self, client_id: &str) -> Result<()> {
        if self.members.remove(client_id).is_none() {
            bail!("unknown client: {}", client_id);
        }
        Ok(())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.members.contains_key(client_id)
    }

    pub fn can_whisper(&self, client_id: &str) -> bool {
        self.members
            .get(client_id)
            .map(|m| m.can_whisper)
            .unwrap_or(false)
    }

    pub fn is_attached(&self, client_id: &str) -> bool {
        self.present.contains(client_id)
    }

    /// Apply a presence message; returns the status change to report, if any
    pub fn presence_changed(
        &mut self,
        client_id: &str,
        action: PresenceAction,
    ) -> Option<ClientStatus> {
        match action {
            PresenceAction::Enter | PresenceAction::Present => {
                self.present.insert(client_id.to_string());
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                self.present.remove(client_id);
            }
            PresenceAction::Update => {
                // clients never send updates
                warn!("Unexpected presence update from client {}", client_id);
                return None;
            }
        }

        let attached = self.present.contains(client_id);
        let member = self.members.get_mut(client_id)?;
        if member.attached == attached {
            return None;
        }
        member.attached = attached;
        Some(ClientStatus {
            client_id: client_id.to_string(),
            is_online: attached,
        })
    }

    /// Credential for a tracked client
    pub fn token(
        &self,
        session_id: &str,
        client_id: &str,
        channels: &ChannelNames,
    ) -> Option<ClientToken> {
        let member = self.members.get(client_id)?;
        Some(ClientToken::new(
            session_id,
            client_id,
            channels,
            member.can_whisper,
        ))
    }
}
