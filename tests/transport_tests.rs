use anyhow::Result;
use tokio::sync::mpsc;
use whisper_server::protocol::{ContentChunk, ContentPacket};
use whisper_server::transport::{
    Capability, ChannelNames, ClientStatus, ClientToken, ContentEvent, ControlTarget,
    LocalTransport, PresenceAction, PresenceMessage, Roster, Transport,
};

#[test]
fn test_channel_names() {
    let channels = ChannelNames::new("whisper", "conv-1");
    assert_eq!(channels.control, "whisper.conv-1.control");
    assert_eq!(channels.presence, "whisper.conv-1.presence");
    assert_eq!(channels.content, "whisper.conv-1.content");
    assert_eq!(channels.control_for("c-1"), "whisper.conv-1.control.c-1");
    assert_eq!(channels.control_all(), "whisper.conv-1.control.all");
    assert_eq!(channels.presence_probe(), "whisper.conv-1.presence.probe");
}

#[test]
fn test_presence_message_serialization() {
    let json = r#"{"clientId":"c-1","action":"enter"}"#;
    let msg: PresenceMessage = serde_json::from_str(json).unwrap();
    assert_eq!(msg.client_id, "c-1");
    assert_eq!(msg.action, PresenceAction::Enter);

    let back = serde_json::to_string(&PresenceMessage {
        client_id: "c-2".to_string(),
        action: PresenceAction::Absent,
    })
    .unwrap();
    assert_eq!(back, r#"{"clientId":"c-2","action":"absent"}"#);
}

#[test]
fn test_client_token_capabilities() {
    let channels = ChannelNames::new("whisper", "conv-1");

    let whisperer = ClientToken::new("conv-1", "w", &channels, true);
    assert!(whisperer.allows(&channels.content, Capability::Publish));
    assert!(whisperer.allows(&channels.content, Capability::Subscribe));
    assert!(whisperer.allows(&channels.presence, Capability::Presence));
    assert!(whisperer.allows(&channels.control_for("w"), Capability::Subscribe));
    assert!(!whisperer.allows(&channels.control_all(), Capability::Publish));

    // clients receive on the subjects the transport actually publishes to
    let listener = ClientToken::new("conv-1", "l", &channels, false);
    assert!(!listener.allows(&channels.content, Capability::Publish));
    assert!(listener.allows(&channels.content, Capability::Subscribe));
    assert!(listener.allows(&channels.control_all(), Capability::Subscribe));
    assert!(listener.allows(&channels.control_for("l"), Capability::Subscribe));
    assert!(listener.allows(&channels.presence_probe(), Capability::Subscribe));
    assert!(!listener.allows(&channels.control_for("w"), Capability::Subscribe));

    let decoded = ClientToken::decode(&whisperer.encode().unwrap()).unwrap();
    assert_eq!(decoded, whisperer);
    assert!(ClientToken::decode("not base64!").is_err());
}

#[test]
fn test_roster_presence_before_admission() {
    let mut roster = Roster::new();

    // untracked clients are remembered but not reported
    assert_eq!(roster.presence_changed("l", PresenceAction::Enter), None);
    assert!(roster.add_listener("l"));
    assert!(!roster.add_whisperer("w"));

    assert_eq!(
        roster.presence_changed("w", PresenceAction::Present),
        Some(ClientStatus {
            client_id: "w".to_string(),
            is_online: true
        })
    );
    assert_eq!(roster.presence_changed("w", PresenceAction::Enter), None);
    assert_eq!(roster.presence_changed("w", PresenceAction::Update), None);
    assert_eq!(
        roster.presence_changed("l", PresenceAction::Leave),
        Some(ClientStatus {
            client_id: "l".to_string(),
            is_online: false
        })
    );

    // a whisperer demoted to listener keeps publish rights
    roster.add_listener("w");
    assert!(roster.can_whisper("w"));

    roster.remove("l").unwrap();
    assert!(!roster.contains("l"));
    assert!(roster.remove("l").is_err());
}

#[tokio::test]
async fn test_local_session_lifecycle() -> Result<()> {
    let transport = LocalTransport::new();
    let (content_tx, mut content_rx) = mpsc::channel(8);
    let (status_tx, mut status_rx) = mpsc::channel(8);

    transport.start_session("s", content_tx.clone(), status_tx.clone()).await?;
    assert_eq!(content_rx.recv().await, Some(ContentEvent::Attached));
    assert!(transport.is_started("s").await);
    assert!(transport
        .start_session("s", content_tx, status_tx)
        .await
        .is_err());

    assert!(!transport.add_whisperer("s", "w").await?);
    transport.add_listener("s", "l").await?;

    transport.set_presence("s", "w", true).await?;
    assert_eq!(
        status_rx.recv().await,
        Some(ClientStatus {
            client_id: "w".to_string(),
            is_online: true
        })
    );

    let packet = ContentPacket::from_chunk("w", &ContentChunk::new(0, "hi"));
    assert!(transport.publish_content("s", packet.clone()).await?);
    assert_eq!(content_rx.recv().await, Some(ContentEvent::Packet(packet)));

    // listeners may not publish
    let denied = ContentPacket::from_chunk("l", &ContentChunk::new(0, "no"));
    assert!(transport.publish_content("s", denied).await.is_err());

    transport.end_session("s").await?;
    assert!(!transport.is_started("s").await);
    assert!(transport.end_session("s").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_local_control_delivery() -> Result<()> {
    let transport = LocalTransport::new();
    let (content_tx, _content_rx) = mpsc::channel(8);
    let (status_tx, _status_rx) = mpsc::channel(8);
    transport.start_session("s", content_tx, status_tx).await?;
    transport.add_whisperer("s", "w").await?;

    let mut control = transport.subscribe_control("s").await.unwrap();
    transport.send("s", "w", "approve-requests|").await?;
    transport.broadcast("s", "end|").await?;
    assert!(transport.send("s", "stranger", "end|").await.is_err());

    let first = control.recv().await?;
    assert_eq!(first.target, ControlTarget::Client("w".to_string()));
    assert_eq!(first.packet, "approve-requests|");
    let second = control.recv().await?;
    assert_eq!(second.target, ControlTarget::All);

    let token = transport.client_token("s", "w").await?.unwrap();
    assert!(token.allows("local.s.content", Capability::Publish));
    assert!(transport.client_token("s", "stranger").await?.is_none());

    transport.end_session("s").await?;
    // the log outlives the session
    assert_eq!(transport.control_log("s").await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_local_fail_start() {
    let transport = LocalTransport::new();
    transport.set_fail_start(true);
    let (content_tx, _content_rx) = mpsc::channel(8);
    let (status_tx, _status_rx) = mpsc::channel(8);
    assert!(transport
        .start_session("s", content_tx, status_tx)
        .await
        .is_err());
    assert!(!transport.is_started("s").await);
}

#[tokio::test]
async fn test_full_queue_sheds_events() -> Result<()> {
    let transport = LocalTransport::new();
    let (content_tx, mut content_rx) = mpsc::channel(2);
    let (status_tx, _status_rx) = mpsc::channel(2);
    transport.start_session("s", content_tx, status_tx).await?;
    transport.add_whisperer("s", "w").await?;

    // Attached occupies one slot
    let kept = ContentPacket::from_chunk("w", &ContentChunk::new(0, "a"));
    let shed = ContentPacket::from_chunk("w", &ContentChunk::new(0, "b"));
    assert!(transport.publish_content("s", kept.clone()).await?);
    assert!(!transport.publish_content("s", shed).await?);

    assert_eq!(content_rx.recv().await, Some(ContentEvent::Attached));
    assert_eq!(content_rx.recv().await, Some(ContentEvent::Packet(kept)));
    Ok(())
}
