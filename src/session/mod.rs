//! Conversation session management
//!
//! This module provides the `Session` state machine and the `SessionRegistry`
//! that owns the live sessions of a server instance:
//! - Admission of whisperers and listeners, and the listener waitlist
//! - Presence tracking and control notifications
//! - Reconciliation of the content stream into live and past text
//! - Transcripts, and suspend/resume handoff between instances

mod config;
mod error;
mod registry;
mod session;
mod state;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use registry::SessionRegistry;
pub use session::{Session, SessionPhase, SessionServices};
pub use state::{PastTextLine, Participant, SessionState, Transcript, UNKNOWN_WHISPERER};
