//! Connection tests
//!
//! Per-peer negotiation records, the link handshake, and data channel
//! framing, exercised through the public API.

use std::time::Duration;

use tokio::time::timeout;

use meshchat::network::{
    decode_frame, encode_frame, ConnectionState, IceCandidate, LinkEvent, LinkEventSender,
    MemoryNetwork, NegotiationRole, NetworkError, PeerConnectionRecord, PeerConnector,
};
use meshchat::protocol::{ChatMessage, MessageKind};

fn record(role: NegotiationRole) -> PeerConnectionRecord {
    PeerConnectionRecord::new("p2", "Bob", "addr-2", role, 1)
}

/// Test: A record starts new
/// Given a freshly created record
/// Then it is in state New with no link and nothing queued
#[test]
fn test_record_initial_state() {
    let rec = record(NegotiationRole::Initiator);

    assert_eq!(rec.state(), ConnectionState::New);
    assert!(rec.is_initiator());
    assert!(rec.link().is_none());
    assert!(!rec.remote_description_set());
    assert!(!rec.accepts_candidates());
    assert_eq!(rec.pending_candidate_count(), 0);
    assert!(rec.open_duration().is_none());
}

/// Test: Happy-path lifecycle
/// Given a negotiating record
/// When it connects, opens, and closes
/// Then each step is accepted and nothing leaves Closed
#[test]
fn test_record_lifecycle() {
    let mut rec = record(NegotiationRole::Responder);

    assert!(rec.transition(ConnectionState::Negotiating));
    assert!(rec.transition(ConnectionState::Connecting));
    assert!(rec.transition(ConnectionState::Open));
    assert!(rec.open_duration().is_some());
    assert!(rec.transition(ConnectionState::Closed));

    assert!(!rec.transition(ConnectionState::Open));
    assert!(!rec.transition(ConnectionState::Failed));
    assert_eq!(rec.state(), ConnectionState::Closed);
}

/// Test: No moving backwards
/// Given an open record
/// Then returning to an earlier negotiation state is ignored
#[test]
fn test_record_rejects_backward_transitions() {
    let mut rec = record(NegotiationRole::Initiator);
    rec.transition(ConnectionState::Negotiating);

    // The channel may open before the remote description step lands
    assert!(rec.transition(ConnectionState::Open));
    assert!(!rec.transition(ConnectionState::Connecting));
    assert!(!rec.transition(ConnectionState::Negotiating));
    assert_eq!(rec.state(), ConnectionState::Open);
}

/// Test: Failure from any live state
#[test]
fn test_failed_is_terminal_from_any_live_state() {
    for start in [
        ConnectionState::New,
        ConnectionState::Negotiating,
        ConnectionState::Connecting,
        ConnectionState::Open,
    ] {
        assert!(start.can_transition_to(ConnectionState::Failed), "{}", start);
        assert!(!ConnectionState::Failed.can_transition_to(start));
    }
    assert!(ConnectionState::Failed.is_terminal());
    assert!(ConnectionState::Closed.is_terminal());
    assert!(ConnectionState::Connecting.is_negotiating());
    assert!(ConnectionState::Open.can_transmit());
    assert!(!ConnectionState::Connecting.can_transmit());
}

/// Test: Early candidates are held
/// Given a record without a remote description
/// When candidates arrive
/// Then they are queued and released in arrival order once the description is set
#[test]
fn test_candidates_queued_until_remote_description() {
    let mut rec = record(NegotiationRole::Responder);
    rec.queue_candidate(IceCandidate::new("candidate:1"));
    rec.queue_candidate(IceCandidate::new("candidate:2"));
    assert_eq!(rec.pending_candidate_count(), 2);

    let flushed = rec.mark_remote_description_set();
    assert_eq!(
        flushed,
        vec![
            IceCandidate::new("candidate:1"),
            IceCandidate::new("candidate:2")
        ]
    );
    assert_eq!(rec.pending_candidate_count(), 0);
    assert!(rec.remote_description_set());

    // Still no link attached
    assert!(!rec.accepts_candidates());
}

/// Test: Early offer is held
#[test]
fn test_pending_offer() {
    let mut rec = record(NegotiationRole::Responder);
    assert!(rec.take_pending_offer().is_none());
    rec.set_pending_offer("sdp-offer".to_string());
    assert_eq!(rec.take_pending_offer().as_deref(), Some("sdp-offer"));
    assert!(rec.take_pending_offer().is_none());
}

/// Test: Candidate wire shape
/// Then candidates serialize with the browser field names
#[test]
fn test_ice_candidate_wire_format() {
    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    };
    let json = serde_json::to_value(&candidate).unwrap();
    assert_eq!(json["sdpMid"], "0");
    assert_eq!(json["sdpMLineIndex"], 0);

    let bare: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).unwrap();
    assert_eq!(bare, IceCandidate::new("c"));
}

/// Test: Data channel frames
/// Given a chat message
/// Then it is framed as a chat-message object with camelCase fields
#[test]
fn test_channel_frame_format() {
    let msg = ChatMessage::new("p1", "Alice", "hello", MessageKind::DiceRoll);
    let text = encode_frame(&msg).unwrap();

    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "chat-message");
    assert_eq!(value["senderId"], "p1");
    assert_eq!(value["senderDisplayName"], "Alice");
    assert_eq!(value["kind"], "diceRoll");

    assert_eq!(decode_frame(&text).unwrap(), msg);
    assert!(matches!(
        decode_frame("{\"type\":\"typing\"}"),
        Err(NetworkError::InvalidMessage(_))
    ));
}

/// Test: Link handshake
/// Given two memory links
/// When one offers and the other answers with candidates exchanged
/// Then both channels open and text flows
#[tokio::test]
async fn test_memory_link_handshake() {
    let network = MemoryNetwork::new();
    let (tx_a, mut rx_a) = LinkEventSender::channel();
    let (tx_b, mut rx_b) = LinkEventSender::channel();
    let a = network.connector("a").create_link("b", tx_a).await.unwrap();
    let b = network.connector("b").create_link("a", tx_b).await.unwrap();

    let offer = a.create_offer().await.unwrap();
    let answer = b.accept_offer(&offer).await.unwrap();
    a.accept_answer(&answer).await.unwrap();

    let mut open_a = false;
    let mut open_b = false;
    let mut cand_a = None;
    let mut cand_b = None;
    while cand_a.is_none() || cand_b.is_none() {
        tokio::select! {
            Some(e) = rx_a.recv() => if let LinkEvent::LocalCandidate(c) = e { cand_a = Some(c) },
            Some(e) = rx_b.recv() => if let LinkEvent::LocalCandidate(c) = e { cand_b = Some(c) },
        }
    }
    b.add_ice_candidate(cand_a.unwrap()).await.unwrap();
    a.add_ice_candidate(cand_b.unwrap()).await.unwrap();

    while !(open_a && open_b) {
        let event = timeout(Duration::from_secs(1), async {
            tokio::select! {
                Some(e) = rx_a.recv() => (true, e),
                Some(e) = rx_b.recv() => (false, e),
            }
        })
        .await
        .expect("channel never opened");
        match event {
            (true, LinkEvent::ChannelOpen) => open_a = true,
            (false, LinkEvent::ChannelOpen) => open_b = true,
            _ => {}
        }
    }

    b.send("pong".to_string()).await.unwrap();
    let got = timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap();
    assert_eq!(got, Some(LinkEvent::Message("pong".to_string())));

    a.close().await;
    b.close().await;
    assert_eq!(network.live_links("a"), 0);
    assert_eq!(network.live_links("b"), 0);
}
