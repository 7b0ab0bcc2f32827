mod common;

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::Instance;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use whisper_server::transport::{Capability, ClientToken};
use whisper_server::{create_router, AppState, ConversationStore, MemoryStore, TrustedHeaderAuthenticator};

fn app() -> (Instance, Router) {
    let store = Arc::new(MemoryStore::default());
    let server = Instance::new(store.clone());
    let state = AppState::new(
        server.registry.clone(),
        ConversationStore::new(store),
        Arc::new(TrustedHeaderAuthenticator),
    );
    (server, create_router(state))
}

fn request(method: &str, uri: &str, profile: &str, client: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-profile-id", profile)
        .header("x-profile-name", profile.to_uppercase())
        .header("x-client-id", client)
        .body(Body::empty())
        .unwrap()
}

async fn call(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Ok((status, body))
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let (_server, app) = app();
    let request = Request::builder().uri("/health").body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_requests_need_profile_and_client() -> Result<()> {
    let (_server, app) = app();

    let anonymous = Request::builder()
        .method("POST")
        .uri("/sessions/conv/whisper")
        .body(Body::empty())?;
    assert_eq!(call(&app, anonymous).await?.0, StatusCode::UNAUTHORIZED);

    let no_client = Request::builder()
        .method("POST")
        .uri("/sessions/conv/whisper")
        .header("x-profile-id", "alice")
        .body(Body::empty())?;
    assert_eq!(call(&app, no_client).await?.0, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_whisperer_owns_conversation() -> Result<()> {
    let (_server, app) = app();

    let (status, body) = call(&app, request("POST", "/sessions/conv/whisper", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "admitted");
    let token = ClientToken::decode(body["token"].as_str().unwrap())?;
    assert_eq!(token.client_id, "a1");
    assert!(token.allows("local.conv.content", Capability::Publish));

    let (status, _) = call(&app, request("POST", "/sessions/conv/whisper", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, request("POST", "/sessions/conv/whisper", "bob", "b1")).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn test_listener_approval_flow() -> Result<()> {
    let (_server, app) = app();
    call(&app, request("POST", "/sessions/conv/whisper", "alice", "a1")).await?;

    let (status, body) = call(&app, request("POST", "/sessions/conv/listen", "bob", "b1")).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "waiting");

    let (status, body) = call(&app, request("GET", "/sessions/conv", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "active");
    assert_eq!(body["requesters"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["requesters"][0]["name"], "BOB");

    // only the whisperer approves
    let (status, _) = call(&app, request("POST", "/sessions/conv/approve/b1", "bob", "b1")).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app, request("POST", "/sessions/conv/approve/zz", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, request("POST", "/sessions/conv/approve/b1", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, request("GET", "/sessions/conv", "alice", "a1")).await?;
    assert_eq!(body["participants"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["requesters"].as_array().map(Vec::len), Some(0));

    let (status, body) = call(&app, request("GET", "/sessions/conv/token", "bob", "b1")).await?;
    assert_eq!(status, StatusCode::OK);
    let token = ClientToken::decode(body["token"].as_str().unwrap())?;
    assert!(!token.allows("local.conv.content", Capability::Publish));

    // approved profiles join directly from any client
    let (status, body) = call(&app, request("POST", "/sessions/conv/listen", "bob", "b2")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "admitted");
    assert!(body["token"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_remove_client() -> Result<()> {
    let (_server, app) = app();
    call(&app, request("POST", "/sessions/conv/whisper", "alice", "a1")).await?;
    call(&app, request("POST", "/sessions/conv/listen", "bob", "b1")).await?;
    call(&app, request("POST", "/sessions/conv/listen", "carol", "c1")).await?;

    // others can't remove a client, but it can withdraw itself
    let (status, _) = call(&app, request("DELETE", "/sessions/conv/clients/b1", "carol", "c1")).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app, request("DELETE", "/sessions/conv/clients/b1", "bob", "b1")).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, request("DELETE", "/sessions/conv/clients/b1", "bob", "b1")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, request("DELETE", "/sessions/conv/clients/c1", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn test_transcribe_and_end() -> Result<()> {
    let (server, app) = app();
    call(&app, request("POST", "/sessions/conv/whisper", "alice", "a1")).await?;

    let (status, body) = call(&app, request("POST", "/sessions/conv/transcribe", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::OK);
    let transcript_id = body["transcript_id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, request("POST", "/sessions/conv/end", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transcript_id"], transcript_id.as_str());
    assert_eq!(server.registry.session_count().await, 0);

    let (status, _) = call(&app, request("GET", "/sessions/conv", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/transcripts/{}", transcript_id);
    let (status, body) = call(&app, request("GET", &uri, "alice", "a1")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conversationId"], "conv");
    assert_eq!(body["whispererName"], "ALICE");

    let (status, _) = call(&app, request("GET", "/transcripts/missing", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_no_new_sessions_while_shutting_down() -> Result<()> {
    let (server, app) = app();
    let (status, _) = call(&app, request("POST", "/sessions/conv/whisper", "alice", "a1")).await?;
    assert_eq!(status, StatusCode::OK);

    server.registry.close();
    let (status, body) = call(&app, request("POST", "/sessions/other/whisper", "alice", "a2")).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "server is shutting down");

    // the running session still answers
    let (status, _) = call(&app, request("POST", "/sessions/conv/listen", "bob", "b1")).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    Ok(())
}
