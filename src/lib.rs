pub mod config;
pub mod http;
pub mod protocol;
pub mod session;
pub mod speech;
pub mod storage;
pub mod transport;

pub use config::{Config, StorageBackend};
pub use http::{create_router, AppState, Authenticator, Profile, TrustedHeaderAuthenticator};
pub use protocol::{diff_lines, process_live_chunk, ContentChunk, ContentPacket, ControlSignal};
pub use session::{
    Participant, PastTextLine, Session, SessionConfig, SessionError, SessionPhase,
    SessionRegistry, SessionServices, SessionState, Transcript,
};
pub use speech::{MockSpeech, SpeechGenerator};
pub use storage::{ConversationStore, KeyValueStore, MemoryStore, NatsStore, SuspendStore};
pub use transport::{ClientToken, LocalTransport, NatsTransport, Transport};
