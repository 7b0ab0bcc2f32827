use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whisperer name recorded in transcripts of sessions that never had one
pub const UNKNOWN_WHISPERER: &str = "Unknown Whisperer";

/// Persistable state of a session: everything a suspended session hands to
/// the next server instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Conversation this session belongs to
    pub id: String,

    /// Admitted participants, keyed by client id
    pub participants: BTreeMap<String, Participant>,

    /// Listeners waiting for the Whisperer to admit them, oldest first
    pub waitlist: Vec<Participant>,

    /// Committed lines, oldest first
    pub past_text: Vec<PastTextLine>,

    pub started_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,

    /// Set once the Whisperer asks for a transcript
    #[serde(default)]
    pub transcript_id: Option<String>,
}

impl SessionState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            participants: BTreeMap::new(),
            waitlist: Vec::new(),
            past_text: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            transcript_id: None,
        }
    }

    /// Whether the client is admitted or waiting
    pub fn is_tracked(&self, client_id: &str) -> bool {
        self.participants.contains_key(client_id) || self.is_waiting(client_id)
    }

    pub fn is_waiting(&self, client_id: &str) -> bool {
        self.waitlist.iter().any(|p| p.client_id == client_id)
    }

    /// Take a client off the waitlist, returning its request
    pub fn remove_waiting(&mut self, client_id: &str) -> Option<Participant> {
        let index = self.waitlist.iter().position(|p| p.client_id == client_id)?;
        Some(self.waitlist.remove(index))
    }

    /// The whisperer that joined first, if any
    pub fn first_whisperer(&self) -> Option<&Participant> {
        self.participants
            .values()
            .filter(|p| p.is_whisperer)
            .min_by(|a, b| {
                a.joined_at
                    .cmp(&b.joined_at)
                    .then_with(|| a.client_id.cmp(&b.client_id))
            })
    }

    /// An online whisperer to route admission requests to
    pub fn online_whisperer(&self) -> Option<&Participant> {
        self.participants
            .values()
            .find(|p| p.is_whisperer && p.is_online)
    }
}

/// A client admitted to (or waiting for) a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub client_id: String,
    pub profile_id: String,
    pub name: String,
    pub is_whisperer: bool,
    pub is_online: bool,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(
        client_id: impl Into<String>,
        profile_id: impl Into<String>,
        name: impl Into<String>,
        is_whisperer: bool,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            profile_id: profile_id.into(),
            name: name.into(),
            is_whisperer,
            is_online: false,
            joined_at: Utc::now(),
        }
    }
}

/// A committed line of text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastTextLine {
    /// When the line was committed
    pub time: DateTime<Utc>,

    pub text: String,
}

impl PastTextLine {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            text: text.into(),
        }
    }
}

/// Final record of a transcribed session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub id: String,
    pub conversation_id: String,
    pub whisperer_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub past_text: Vec<PastTextLine>,
}

impl Transcript {
    pub fn from_state(id: impl Into<String>, state: &SessionState) -> Self {
        let whisperer_name = state
            .first_whisperer()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| UNKNOWN_WHISPERER.to_string());

        Self {
            id: id.into(),
            conversation_id: state.id.clone(),
            whisperer_name,
            start_time: state.started_at,
            end_time: state.ended_at,
            past_text: state.past_text.clone(),
        }
    }
}
