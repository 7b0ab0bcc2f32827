#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use whisper_server::{
    LocalTransport, MemoryStore, MockSpeech, SessionConfig, SessionRegistry, SessionServices,
    SuspendStore,
};

/// Session tuning that keeps handoff tests fast
pub fn test_config() -> SessionConfig {
    SessionConfig {
        grace_period: Duration::from_millis(200),
        resume_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

/// One server instance: its own transport, a store shared with its peers
pub struct Instance {
    pub transport: Arc<LocalTransport>,
    pub speech: Arc<MockSpeech>,
    pub suspend: SuspendStore,
    pub registry: Arc<SessionRegistry>,
}

impl Instance {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self::with_config(store, test_config())
    }

    pub fn with_config(store: Arc<MemoryStore>, config: SessionConfig) -> Self {
        let transport = Arc::new(LocalTransport::new());
        let speech = Arc::new(MockSpeech::new());
        let suspend = SuspendStore::new(store, config.packet_ttl, config.transcript_ttl);
        let registry = Arc::new(SessionRegistry::new(SessionServices {
            transport: transport.clone(),
            speech: speech.clone(),
            suspend: suspend.clone(),
            config,
        }));
        Self {
            transport,
            speech,
            suspend,
            registry,
        }
    }
}

/// Poll `check` until it holds, for up to two seconds
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
