//! Text-to-speech for committed lines
//!
//! Sessions ask a [`SpeechGenerator`] for an id per committed line and hand
//! that id to listeners, who fetch the audio separately.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::io::AsyncRead;
use tracing::debug;

/// Generated audio, streamed
pub type SpeechStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait::async_trait]
pub trait SpeechGenerator: Send + Sync {
    /// Request speech for a line of text, returning the id to fetch it with
    async fn generate_speech(&self, text: &str) -> Result<String>;

    /// Audio for a previously generated id
    async fn generated_speech(&self, speech_id: &str) -> Result<SpeechStream>;
}

#[derive(Default)]
struct SpeechCache {
    by_text: HashMap<String, String>,
    by_id: HashMap<String, String>,
}

/// Speech generator that produces ids but no audio.
///
/// Ids are cached by normalized text, so repeating a line reuses its id.
#[derive(Default)]
pub struct MockSpeech {
    cache: Mutex<SpeechCache>,
}

impl MockSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    /// The text an id was generated for
    pub fn text_for(&self, speech_id: &str) -> Option<String> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.by_id.get(speech_id).cloned())
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

#[async_trait::async_trait]
impl SpeechGenerator for MockSpeech {
    async fn generate_speech(&self, text: &str) -> Result<String> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("speech cache poisoned"))?;
        let key = normalize(text);
        if let Some(id) = cache.by_text.get(&key) {
            return Ok(id.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        debug!("Mock speech {} for {:?}", id, text);
        cache.by_text.insert(key, id.clone());
        cache.by_id.insert(id.clone(), text.to_string());
        Ok(id)
    }

    async fn generated_speech(&self, speech_id: &str) -> Result<SpeechStream> {
        let known = self
            .cache
            .lock()
            .map_err(|_| anyhow!("speech cache poisoned"))?
            .by_id
            .contains_key(speech_id);
        if !known {
            return Err(anyhow!("no speech found for id {}", speech_id));
        }
        Ok(Box::pin(Cursor::new(Vec::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_ids_are_cached_by_normalized_text() {
        let speech = MockSpeech::new();
        let first = speech.generate_speech("Hello there").await.unwrap();
        let second = speech.generate_speech("  hello THERE ").await.unwrap();
        let other = speech.generate_speech("goodbye").await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(speech.text_for(&first).as_deref(), Some("Hello there"));
    }

    #[tokio::test]
    async fn test_generated_speech_requires_known_id() {
        let speech = MockSpeech::new();
        assert!(speech.generated_speech("nope").await.is_err());

        let id = speech.generate_speech("line").await.unwrap();
        let mut audio = speech.generated_speech(&id).await.unwrap();
        let mut bytes = Vec::new();
        audio.read_to_end(&mut bytes).await.unwrap();
        assert!(bytes.is_empty());
    }
}
