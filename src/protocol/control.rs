use std::fmt;

const REQUESTS_PENDING: &str = "approve-requests";
const PARTICIPANTS_CHANGED: &str = "participants-changed";
const PAST_TEXT_SPEECH_ID: &str = "past-text-speech-id";
const END: &str = "end";

/// An out-of-band session signal: an action plus ordered string arguments.
///
/// The wire form always carries the separator after the action, so a chunk
/// without arguments encodes as `action|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlChunk {
    pub action: String,
    pub args: Vec<String>,
}

impl ControlChunk {
    pub fn new(action: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            action: action.into(),
            args,
        }
    }

    /// Decode `action|arg1|arg2|...`
    pub fn parse(s: &str) -> Self {
        match s.split_once('|') {
            Some((action, rest)) if !rest.is_empty() => {
                Self::new(action, rest.split('|').map(str::to_string).collect())
            }
            Some((action, _)) => Self::new(action, Vec::new()),
            None => Self::new(s, Vec::new()),
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ControlChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.action, self.args.join("|"))
    }
}

/// The control signals a session sends to its participants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Tell the Whisperer that listeners are waiting for admission
    RequestsPending,

    /// The participant roster (or someone's online status) changed
    ParticipantsChanged,

    /// A line of past text has speech available for playback
    PastTextSpeechId {
        /// Packet that produced the past text
        packet_id: String,
        /// Which of that packet's past-text lines this is
        sequence: String,
        /// Id to request the generated speech with
        speech_id: String,
    },

    /// The session is over
    End,
}

impl ControlSignal {
    pub fn past_text_speech_id(
        packet_id: impl Into<String>,
        sequence: usize,
        speech_id: impl Into<String>,
    ) -> Self {
        Self::PastTextSpeechId {
            packet_id: packet_id.into(),
            sequence: sequence.to_string(),
            speech_id: speech_id.into(),
        }
    }

    pub fn to_chunk(&self) -> ControlChunk {
        match self {
            Self::RequestsPending => ControlChunk::new(REQUESTS_PENDING, Vec::new()),
            Self::ParticipantsChanged => ControlChunk::new(PARTICIPANTS_CHANGED, Vec::new()),
            Self::PastTextSpeechId {
                packet_id,
                sequence,
                speech_id,
            } => ControlChunk::new(
                PAST_TEXT_SPEECH_ID,
                vec![packet_id.clone(), sequence.clone(), speech_id.clone()],
            ),
            Self::End => ControlChunk::new(END, Vec::new()),
        }
    }

    /// Encoded packet ready for the control channel
    pub fn to_packet(&self) -> String {
        self.to_chunk().encode()
    }

    /// Recognize a control packet.
    ///
    /// Returns `None` for unknown actions, and for a speech-id packet that is
    /// missing any of its three arguments.
    pub fn from_packet(packet: &str) -> Option<Self> {
        let chunk = ControlChunk::parse(packet);
        match chunk.action.as_str() {
            REQUESTS_PENDING => Some(Self::RequestsPending),
            PARTICIPANTS_CHANGED => Some(Self::ParticipantsChanged),
            END => Some(Self::End),
            PAST_TEXT_SPEECH_ID => match chunk.args.as_slice() {
                [packet_id, sequence, speech_id, ..] => Some(Self::PastTextSpeechId {
                    packet_id: packet_id.clone(),
                    sequence: sequence.clone(),
                    speech_id: speech_id.clone(),
                }),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_requests_pending(packet: &str) -> bool {
        ControlChunk::parse(packet).action == REQUESTS_PENDING
    }

    pub fn is_participants_changed(packet: &str) -> bool {
        ControlChunk::parse(packet).action == PARTICIPANTS_CHANGED
    }

    pub fn is_end(packet: &str) -> bool {
        ControlChunk::parse(packet).action == END
    }
}
