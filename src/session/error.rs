use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors returned by session lookup, admission and removal
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("already present")]
    AlreadyPresent,

    #[error("not present")]
    NotPresent,

    #[error("session is no longer active")]
    Inactive,

    #[error("server is shutting down")]
    Closing,

    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}
