//! HTTP API for whisper clients
//!
//! This module provides a REST API for joining and running conversations:
//! - POST /sessions/:id/whisper - Join as the Whisperer
//! - POST /sessions/:id/listen - Join as a listener, or ask to
//! - POST /sessions/:id/approve/:client - Admit a waiting listener
//! - DELETE /sessions/:id/clients/:client - Remove a client
//! - POST /sessions/:id/transcribe - Request a transcript
//! - POST /sessions/:id/end - End the session
//! - GET /sessions/:id - Query session status
//! - GET /sessions/:id/token - Reissue a transport credential
//! - GET /transcripts/:id - Fetch a saved transcript
//! - GET /health - Health check

mod auth;
mod handlers;
mod routes;
mod state;

pub use auth::{Authenticator, Profile, TrustedHeaderAuthenticator};
pub use handlers::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
