use super::auth::{header_value, Profile, CLIENT_ID_HEADER};
use super::state::AppState;
use crate::session::{Participant, Session, SessionError, SessionPhase, Transcript};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub session_id: String,
    pub client_id: String,
    /// "admitted" or "waiting"
    pub status: String,
    /// Transport credential, once admitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub client_id: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct TranscriptIdResponse {
    pub session_id: String,
    pub transcript_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    pub phase: SessionPhase,
    pub participants: Vec<Participant>,
    pub requesters: Vec<Participant>,
    pub live_text: String,
    pub past_lines: usize,
}

/// An error reply with a JSON body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(e: anyhow::Error) -> Self {
        error!("Request failed: {:#}", e);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let status = match &e {
            SessionError::AlreadyPresent => StatusCode::CONFLICT,
            SessionError::NotPresent => StatusCode::NOT_FOUND,
            SessionError::Inactive => StatusCode::GONE,
            SessionError::Closing => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Transport(_) | SessionError::Storage(_) => {
                error!("Session operation failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The verified caller of a request
struct Caller {
    profile: Profile,
    client_id: String,
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<Caller> {
    let profile = state.auth.authenticate(headers).await.map_err(|e| {
        warn!("Rejected unauthenticated request: {:#}", e);
        ApiError::new(StatusCode::UNAUTHORIZED, format!("{:#}", e))
    })?;
    let client_id = header_value(headers, CLIENT_ID_HEADER).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("missing {} header", CLIENT_ID_HEADER),
        )
    })?;
    Ok(Caller { profile, client_id })
}

async fn running_session(state: &AppState, session_id: &str) -> ApiResult<Arc<Session>> {
    state.registry.lookup(session_id).await.ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Session {} is not running", session_id),
        )
    })
}

async fn require_whisperer(session: &Session, client_id: &str) -> ApiResult<()> {
    let is_whisperer = session
        .participants()
        .await
        .iter()
        .any(|p| p.client_id == client_id && p.is_whisperer);
    if is_whisperer {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::FORBIDDEN,
            format!("Client {} is not whispering in {}", client_id, session.id()),
        ))
    }
}

async fn encoded_token(session: &Session, client_id: &str) -> ApiResult<Option<String>> {
    let token = session
        .client_token(client_id)
        .await
        .map_err(ApiError::internal)?;
    token
        .map(|t| t.encode())
        .transpose()
        .map_err(ApiError::internal)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions/:session_id/whisper
/// Join a conversation as its Whisperer
pub async fn start_whisper(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<JoinResponse>> {
    let caller = authenticate(&state, &headers).await?;
    let owns = state
        .conversations
        .claim(&session_id, &caller.profile.id)
        .await
        .map_err(ApiError::internal)?;
    if !owns {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            format!("Conversation {} belongs to another profile", session_id),
        ));
    }

    let session = state.registry.get_session(&session_id).await?;
    session
        .add_whisperer(&caller.client_id, &caller.profile.id, &caller.profile.name)
        .await?;

    info!(
        "{} whispering in {} from client {}",
        caller.profile.name, session_id, caller.client_id
    );
    let token = encoded_token(&session, &caller.client_id).await?;
    Ok(Json(JoinResponse {
        session_id,
        client_id: caller.client_id,
        status: "admitted".to_string(),
        token,
    }))
}

/// POST /sessions/:session_id/listen
/// Join as a listener; callers the Whisperer has not approved before wait
pub async fn start_listen(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let caller = authenticate(&state, &headers).await?;
    let allowed = state
        .conversations
        .is_allowed_listener(&session_id, &caller.profile.id)
        .await
        .map_err(ApiError::internal)?;
    let session = state.registry.get_session(&session_id).await?;

    if !allowed {
        session
            .add_listener_request(&caller.client_id, &caller.profile.id, &caller.profile.name)
            .await?;
        info!(
            "{} asked to listen in {} from client {}",
            caller.profile.name, session_id, caller.client_id
        );
        let body = JoinResponse {
            session_id,
            client_id: caller.client_id,
            status: "waiting".to_string(),
            token: None,
        };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    session
        .add_listener(&caller.client_id, &caller.profile.id, &caller.profile.name)
        .await?;
    info!(
        "{} listening in {} from client {}",
        caller.profile.name, session_id, caller.client_id
    );
    let token = encoded_token(&session, &caller.client_id).await?;
    Ok(Json(JoinResponse {
        session_id,
        client_id: caller.client_id,
        status: "admitted".to_string(),
        token,
    })
    .into_response())
}

/// POST /sessions/:session_id/approve/:client_id
/// The Whisperer admits a waiting listener
pub async fn approve_listener(
    State(state): State<AppState>,
    Path((session_id, client_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<JoinResponse>> {
    let caller = authenticate(&state, &headers).await?;
    let session = running_session(&state, &session_id).await?;
    require_whisperer(&session, &caller.client_id).await?;

    let requester = session
        .requesters()
        .await
        .into_iter()
        .find(|p| p.client_id == client_id)
        .ok_or(SessionError::NotPresent)?;
    session
        .add_listener(&requester.client_id, &requester.profile_id, &requester.name)
        .await?;
    if let Err(e) = state
        .conversations
        .allow_listener(&session_id, &requester.profile_id)
        .await
    {
        error!("Failed to remember approval of {}: {:#}", requester.profile_id, e);
    }

    info!("Approved client {} in {}", client_id, session_id);
    Ok(Json(JoinResponse {
        session_id,
        client_id,
        status: "admitted".to_string(),
        token: None,
    }))
}

/// DELETE /sessions/:session_id/clients/:client_id
/// Remove a participant or withdraw a request; clients may remove themselves
pub async fn remove_client(
    State(state): State<AppState>,
    Path((session_id, client_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let caller = authenticate(&state, &headers).await?;
    let session = running_session(&state, &session_id).await?;
    if caller.client_id != client_id {
        require_whisperer(&session, &caller.client_id).await?;
    }

    session.remove_client(&client_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /sessions/:session_id/transcribe
/// Request a transcript of the session
pub async fn transcribe_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<TranscriptIdResponse>> {
    let caller = authenticate(&state, &headers).await?;
    let session = running_session(&state, &session_id).await?;
    require_whisperer(&session, &caller.client_id).await?;

    let transcript_id = session.transcribe().await;
    Ok(Json(TranscriptIdResponse {
        session_id,
        transcript_id: Some(transcript_id),
    }))
}

/// POST /sessions/:session_id/end
/// End the session for everyone
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<TranscriptIdResponse>> {
    let caller = authenticate(&state, &headers).await?;
    let session = running_session(&state, &session_id).await?;
    require_whisperer(&session, &caller.client_id).await?;

    let transcript_id = session.end().await;
    info!("{} ended session {}", caller.profile.name, session_id);
    Ok(Json(TranscriptIdResponse {
        session_id,
        transcript_id,
    }))
}

/// GET /sessions/:session_id
/// Phase, participants, and pending requests of a running session
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<SessionView>> {
    authenticate(&state, &headers).await?;
    let session = running_session(&state, &session_id).await?;

    Ok(Json(SessionView {
        id: session_id,
        phase: session.phase(),
        participants: session.participants().await,
        requesters: session.requesters().await,
        live_text: session.live_text().await,
        past_lines: session.past_text().await.len(),
    }))
}

/// GET /sessions/:session_id/token
/// Reissue the caller's transport credential
pub async fn get_client_token(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<TokenResponse>> {
    let caller = authenticate(&state, &headers).await?;
    let session = running_session(&state, &session_id).await?;

    let token = encoded_token(&session, &caller.client_id)
        .await?
        .ok_or(SessionError::NotPresent)?;
    Ok(Json(TokenResponse {
        client_id: caller.client_id,
        token,
    }))
}

/// GET /transcripts/:transcript_id
pub async fn get_transcript(
    State(state): State<AppState>,
    Path(transcript_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Transcript>> {
    authenticate(&state, &headers).await?;
    let transcript = state
        .registry
        .stored_transcript(&transcript_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("Transcript {} not found", transcript_id),
            )
        })?;
    Ok(Json(transcript))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
