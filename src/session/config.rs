use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for sessions and the suspend/resume handoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a shutting-down session keeps absorbing content before it
    /// suspends itself
    /// Default: 10 seconds
    pub grace_period: Duration,

    /// Capacity of each session's content and status queues
    /// Default: 1024
    pub queue_capacity: usize,

    /// How long the resume loop waits for a suspended session before stopping
    /// Default: 30 seconds
    pub resume_timeout: Duration,

    /// Lifetime of buffered packets once a new instance has read them
    /// Default: 30 seconds
    pub packet_ttl: Duration,

    /// Retention of finalized transcripts
    /// Default: 365 days
    pub transcript_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            queue_capacity: 1024,
            resume_timeout: Duration::from_secs(30),
            packet_ttl: Duration::from_secs(30),
            transcript_ttl: Duration::from_secs(365 * 24 * 60 * 60),
        }
    }
}
