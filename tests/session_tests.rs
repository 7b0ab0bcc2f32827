mod common;

use anyhow::Result;
use common::{eventually, Instance};
use std::sync::Arc;
use whisper_server::protocol::{diff_lines, ContentChunk, ContentPacket, ControlSignal};
use whisper_server::session::{SessionError, SessionPhase};
use whisper_server::transport::{ControlMessage, ControlTarget, Transport};
use whisper_server::MemoryStore;

fn instance() -> Instance {
    Instance::new(Arc::new(MemoryStore::default()))
}

fn chunk_packet(client_id: &str, offset: i64, text: &str) -> ContentPacket {
    ContentPacket::from_chunk(client_id, &ContentChunk::new(offset, text))
}

#[tokio::test]
async fn test_admission_is_idempotent() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;
    assert_eq!(session.phase(), SessionPhase::Active);

    session.add_whisperer("w", "p-w", "Whisperer").await?;
    session.add_listener("l", "p-l", "Listener").await?;
    assert!(matches!(
        session.add_listener("l", "p-l", "Listener").await,
        Err(SessionError::AlreadyPresent)
    ));
    assert!(matches!(
        session.add_whisperer("w", "p-w", "Whisperer").await,
        Err(SessionError::AlreadyPresent)
    ));

    let participants = session.participants().await;
    assert_eq!(participants.len(), 2);
    assert!(participants.iter().any(|p| p.client_id == "w" && p.is_whisperer));
    assert!(participants.iter().any(|p| p.client_id == "l" && !p.is_whisperer));

    let token = session.client_token("w").await?.unwrap();
    assert_eq!(token.client_id, "w");
    Ok(())
}

#[tokio::test]
async fn test_waitlist_promotion() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;

    session.add_listener_request("r", "p-r", "Requester").await?;
    assert!(matches!(
        session.add_listener_request("r", "p-r", "Requester").await,
        Err(SessionError::AlreadyPresent)
    ));
    assert_eq!(session.requesters().await.len(), 1);
    assert!(session.participants().await.is_empty());

    session.add_listener("r", "p-r", "Requester").await?;
    assert!(session.requesters().await.is_empty());
    let participants = session.participants().await;
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].client_id, "r");

    // participants can't queue again
    assert!(matches!(
        session.add_listener_request("r", "p-r", "Requester").await,
        Err(SessionError::AlreadyPresent)
    ));
    Ok(())
}

#[tokio::test]
async fn test_requests_pending_goes_to_online_whisperer() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;

    // nobody to tell yet
    session.add_listener_request("r1", "p-r1", "First").await?;

    server.transport.set_presence("conv", "w", true).await?;
    session.add_whisperer("w", "p-w", "Whisperer").await?;
    assert!(session.participants().await[0].is_online);

    session.add_listener_request("r2", "p-r2", "Second").await?;

    let notices: Vec<ControlMessage> = server
        .transport
        .control_log("conv")
        .await
        .into_iter()
        .filter(|m| ControlSignal::is_requests_pending(&m.packet))
        .collect();
    assert_eq!(notices.len(), 2);
    assert!(notices
        .iter()
        .all(|m| m.target == ControlTarget::Client("w".to_string())));
    Ok(())
}

#[tokio::test]
async fn test_remove_client() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;
    session.add_listener("l", "p-l", "Listener").await?;
    session.add_listener_request("r", "p-r", "Requester").await?;

    session.remove_client("r").await?;
    assert!(session.requesters().await.is_empty());

    session.remove_client("l").await?;
    assert!(session.participants().await.is_empty());
    assert!(server.transport.client_token("conv", "l").await?.is_none());

    assert!(matches!(
        session.remove_client("l").await,
        Err(SessionError::NotPresent)
    ));
    Ok(())
}

#[tokio::test]
async fn test_presence_changes_are_broadcast() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;
    session.add_listener("l", "p-l", "Listener").await?;

    server.transport.set_presence("conv", "l", true).await?;
    assert!(
        eventually(|| async {
            session.participants().await.iter().any(|p| p.is_online)
        })
        .await
    );
    assert!(
        eventually(|| async {
            server
                .transport
                .control_log("conv")
                .await
                .iter()
                .any(|m| ControlSignal::is_participants_changed(&m.packet))
        })
        .await
    );
    Ok(())
}

#[tokio::test]
async fn test_content_is_transcribed() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;
    session.add_whisperer("w", "p-w", "Whisperer").await?;

    let commit = chunk_packet("w", -1, "");
    server
        .transport
        .publish_content("conv", chunk_packet("w", 0, "hello"))
        .await?;
    server.transport.publish_content("conv", commit.clone()).await?;
    server
        .transport
        .publish_content("conv", chunk_packet("w", 0, "wor"))
        .await?;

    assert!(eventually(|| async { session.live_text().await == "wor" }).await);
    let past = session.past_text().await;
    assert_eq!(past.len(), 1);
    assert_eq!(past[0].text, "hello");

    let log = server.transport.control_log("conv").await;
    let speech = log
        .iter()
        .find_map(|m| match ControlSignal::from_packet(&m.packet) {
            Some(ControlSignal::PastTextSpeechId {
                packet_id,
                sequence,
                speech_id,
            }) => Some((packet_id, sequence, speech_id)),
            _ => None,
        })
        .expect("speech id broadcast");
    assert_eq!(speech.0, commit.packet_id);
    assert_eq!(speech.1, "0");
    assert_eq!(server.speech.text_for(&speech.2).as_deref(), Some("hello"));
    Ok(())
}

#[tokio::test]
async fn test_pasted_lines_get_one_speech_id_each() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;
    session.add_whisperer("w", "p-w", "Whisperer").await?;

    let packets: Vec<ContentPacket> = diff_lines("", "one\ntwo\nthr")
        .iter()
        .map(|chunk| ContentPacket::from_chunk("w", chunk))
        .collect();
    let commits: Vec<String> = packets
        .iter()
        .filter(|p| p.chunk() == ContentChunk::newline())
        .map(|p| p.packet_id.clone())
        .collect();
    assert_eq!(commits.len(), 2);
    for packet in packets {
        server.transport.publish_content("conv", packet).await?;
    }

    assert!(eventually(|| async { session.live_text().await == "thr" }).await);
    let past: Vec<String> = session.past_text().await.into_iter().map(|l| l.text).collect();
    assert_eq!(past, vec!["one", "two"]);

    let speech: Vec<(String, String, String)> = server
        .transport
        .control_log("conv")
        .await
        .iter()
        .filter_map(|m| match ControlSignal::from_packet(&m.packet) {
            Some(ControlSignal::PastTextSpeechId {
                packet_id,
                sequence,
                speech_id,
            }) => Some((packet_id, sequence, speech_id)),
            _ => None,
        })
        .collect();
    assert_eq!(speech.len(), 2);
    for ((packet_id, sequence, speech_id), (commit, line)) in
        speech.iter().zip(commits.iter().zip(["one", "two"]))
    {
        assert_eq!(packet_id, commit);
        assert_eq!(sequence, "0");
        assert_eq!(server.speech.text_for(speech_id).as_deref(), Some(line));
    }
    Ok(())
}

#[tokio::test]
async fn test_end_saves_requested_transcript() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;
    session.add_whisperer("w", "p-w", "Ada").await?;

    let transcript_id = session.transcribe().await;
    assert_eq!(session.transcribe().await, transcript_id);
    assert_eq!(session.transcript_id().await, Some(transcript_id.clone()));

    for packet in [
        chunk_packet("w", 0, "first"),
        chunk_packet("w", -1, ""),
        chunk_packet("w", 0, "unfinished"),
    ] {
        server.transport.publish_content("conv", packet).await?;
    }
    assert!(eventually(|| async { session.live_text().await == "unfinished" }).await);

    assert_eq!(session.end().await, Some(transcript_id.clone()));
    assert_eq!(session.phase(), SessionPhase::Ended);
    assert!(server.registry.lookup("conv").await.is_none());
    assert!(!server.transport.is_started("conv").await);

    let log = server.transport.control_log("conv").await;
    assert!(log
        .iter()
        .any(|m| m.target == ControlTarget::All && ControlSignal::is_end(&m.packet)));

    let transcript = server
        .registry
        .stored_transcript(&transcript_id)
        .await?
        .expect("transcript saved");
    assert_eq!(transcript.conversation_id, "conv");
    assert_eq!(transcript.whisperer_name, "Ada");
    assert!(transcript.end_time.is_some());
    let lines: Vec<&str> = transcript.past_text.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(lines, vec!["first", "unfinished"]);

    // ending twice does nothing
    assert_eq!(session.end().await, None);
    Ok(())
}

#[tokio::test]
async fn test_end_without_transcript() -> Result<()> {
    let server = instance();
    let session = server.registry.get_session("conv").await?;
    assert_eq!(session.end().await, None);

    assert!(matches!(
        session.add_listener("l", "p-l", "Listener").await,
        Err(SessionError::Inactive)
    ));

    // the next lookup starts a fresh session
    let fresh = server.registry.get_session("conv").await?;
    assert!(!Arc::ptr_eq(&session, &fresh));
    assert_eq!(fresh.phase(), SessionPhase::Active);
    Ok(())
}

#[tokio::test]
async fn test_start_failure_propagates() -> Result<()> {
    let server = instance();
    server.transport.set_fail_start(true);
    assert!(server.registry.get_session("conv").await.is_err());
    assert_eq!(server.registry.session_count().await, 0);

    server.transport.set_fail_start(false);
    let session = server.registry.get_session("conv").await?;
    assert_eq!(session.phase(), SessionPhase::Active);
    assert_eq!(server.registry.session_count().await, 1);
    Ok(())
}
