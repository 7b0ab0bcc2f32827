use crate::session::SessionConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Prefix of environment variables that override file settings,
/// e.g. `WHISPER__SESSION__GRACE_PERIOD_SECS=5`
pub const ENV_PREFIX: &str = "WHISPER";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
    pub session: SessionSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "whisper-server".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// NATS server; the in-process transport is used when unset
    pub nats_url: Option<String>,

    /// First token of every session subject
    pub subject_prefix: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            subject_prefix: "whisper".to_string(),
        }
    }
}

/// Where suspended sessions, transcripts and conversation records live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JetStream key-value bucket on the transport's NATS server, shared by
    /// every instance
    Nats,
    /// Process memory; suspended sessions cannot outlive the process
    Memory,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Key-value bucket used by the NATS backend
    pub bucket: String,

    /// Namespace prepended to every stored key
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Nats,
            bucket: "whisper".to_string(),
            key_prefix: "whisper:".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub grace_period_secs: u64,
    pub queue_capacity: usize,
    pub resume_timeout_secs: u64,
    pub packet_ttl_secs: u64,
    pub transcript_ttl_days: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            queue_capacity: 1024,
            resume_timeout_secs: 30,
            packet_ttl_secs: 30,
            transcript_ttl_days: 365,
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            grace_period: Duration::from_secs(self.grace_period_secs),
            queue_capacity: self.queue_capacity,
            resume_timeout: Duration::from_secs(self.resume_timeout_secs),
            packet_ttl: Duration::from_secs(self.packet_ttl_secs),
            transcript_ttl: Duration::from_secs(self.transcript_ttl_days * 24 * 60 * 60),
        }
    }
}

impl Config {
    /// Load settings from a file (extension optional) and the environment
    pub fn load(path: &str) -> Result<Self> {
        Self::build(config::File::with_name(path))
            .with_context(|| format!("Failed to load config from {}", path))
    }

    /// Like [`Config::load`], but a missing file leaves the defaults in place
    pub fn load_or_default(path: &str) -> Result<Self> {
        Self::build(config::File::with_name(path).required(false))
            .with_context(|| format!("Failed to load config from {}", path))
    }

    fn build(file: config::File<config::FileSourceFile, config::FileFormat>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_file_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "whisper-test"

[service.http]
bind = "0.0.0.0"
port = 9090

[transport]
nats_url = "nats://localhost:4222"

[storage]
backend = "memory"

[session]
grace_period_secs = 2
"#
        )
        .unwrap();

        let cfg = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.service.name, "whisper-test");
        assert_eq!(cfg.service.http.port, 9090);
        assert_eq!(
            cfg.transport.nats_url.as_deref(),
            Some("nats://localhost:4222")
        );
        assert_eq!(cfg.transport.subject_prefix, "whisper");
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.storage.bucket, "whisper");
        assert_eq!(cfg.storage.key_prefix, "whisper:");

        let session = cfg.session.to_session_config();
        assert_eq!(session.grace_period, Duration::from_secs(2));
        assert_eq!(session.queue_capacity, 1024);
        assert_eq!(session.transcript_ttl, Duration::from_secs(365 * 86400));
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load("/nonexistent/whisper-server").is_err());

        let cfg = Config::load_or_default("/nonexistent/whisper-server").unwrap();
        assert_eq!(cfg.service.http.port, 8080);
        assert!(cfg.transport.nats_url.is_none());
        assert_eq!(cfg.storage.backend, StorageBackend::Nats);
        assert_eq!(cfg.session.resume_timeout_secs, 30);
    }
}
