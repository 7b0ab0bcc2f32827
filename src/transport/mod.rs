//! Realtime transport for whisper sessions
//!
//! A transport multiplexes three logical channels per session:
//! - control: unicast and broadcast session signals
//! - presence: which clients are currently attached
//! - content: the Whisperer's edit stream
//!
//! Presence transitions and inbound content are surfaced asynchronously on the
//! queues handed to [`Transport::start_session`].
//!
//! Backpressure: both queues are bounded and producers never wait on them. An
//! event offered to a full queue is dropped and logged (see [`offer`]).

mod local;
mod messages;
mod nats;
mod roster;

pub use local::{ControlMessage, ControlTarget, LocalTransport};
pub use messages::{Capability, ChannelNames, ClientToken, PresenceAction, PresenceMessage};
pub use nats::NatsTransport;
pub use roster::Roster;

use crate::protocol::ContentPacket;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// A presence transition for a tracked client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub client_id: String,
    pub is_online: bool,
}

/// Events delivered on a session's content queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEvent {
    /// The content channel is attached; always the first event of a session
    Attached,
    /// An inbound content packet
    Packet(ContentPacket),
}

pub type ContentSender = mpsc::Sender<ContentEvent>;
pub type ContentReceiver = mpsc::Receiver<ContentEvent>;
pub type StatusSender = mpsc::Sender<ClientStatus>;
pub type StatusReceiver = mpsc::Receiver<ClientStatus>;

/// Realtime delivery capability used by sessions
///
/// Implementations:
/// - [`NatsTransport`]: subjects on a shared NATS connection
/// - [`LocalTransport`]: in-process channels (tests, single-node runs)
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Attach to the channels of a session and start delivering its events
    async fn start_session(
        &self,
        session_id: &str,
        content: ContentSender,
        status: StatusSender,
    ) -> Result<()>;

    /// Detach from a session's channels
    async fn end_session(&self, session_id: &str) -> Result<()>;

    /// Grant a client whisperer capability; returns whether it is attached now
    async fn add_whisperer(&self, session_id: &str, client_id: &str) -> Result<bool>;

    /// Grant a client listener capability; returns whether it is attached now
    async fn add_listener(&self, session_id: &str, client_id: &str) -> Result<bool>;

    /// Issue the credential a client uses to attach, `None` for unknown clients
    async fn client_token(&self, session_id: &str, client_id: &str) -> Result<Option<ClientToken>>;

    /// Revoke a client's capabilities
    async fn remove_client(&self, session_id: &str, client_id: &str) -> Result<()>;

    /// Send a control packet to one client
    async fn send(&self, session_id: &str, client_id: &str, packet: &str) -> Result<()>;

    /// Send a control packet to every client of the session
    async fn broadcast(&self, session_id: &str, packet: &str) -> Result<()>;

    /// Transport name for logging
    fn name(&self) -> &str;
}

/// Hand an event to a session queue without waiting.
///
/// Returns false when the event was shed because the queue is full or the
/// session has stopped reading.
pub fn offer<T>(queue: &mpsc::Sender<T>, event: T, session_id: &str) -> bool {
    match queue.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                "Session {} queue full (capacity {}), dropping event",
                session_id,
                queue.max_capacity()
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Session {} queue closed, dropping event", session_id);
            false
        }
    }
}
