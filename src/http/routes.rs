use super::handlers;
use super::state::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Joining
        .route(
            "/sessions/:session_id/whisper",
            post(handlers::start_whisper),
        )
        .route("/sessions/:session_id/listen", post(handlers::start_listen))
        .route(
            "/sessions/:session_id/approve/:client_id",
            post(handlers::approve_listener),
        )
        .route(
            "/sessions/:session_id/clients/:client_id",
            delete(handlers::remove_client),
        )
        // Whisperer control
        .route(
            "/sessions/:session_id/transcribe",
            post(handlers::transcribe_session),
        )
        .route("/sessions/:session_id/end", post(handlers::end_session))
        // Queries
        .route("/sessions/:session_id", get(handlers::get_session))
        .route(
            "/sessions/:session_id/token",
            get(handlers::get_client_token),
        )
        .route(
            "/transcripts/:transcript_id",
            get(handlers::get_transcript),
        )
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
