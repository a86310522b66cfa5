//! Peer link abstraction
//!
//! Defines the seam between session negotiation logic and the engine that
//! actually moves bytes between two peers (WebRTC, or the in-memory network
//! used by tests). One [`PeerLink`] carries exactly one ordered, reliable
//! data channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::NetworkError;

/// Data channel label used by every link
pub const DATA_CHANNEL_LABEL: &str = "chat";

/// ICE candidate exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Events raised by a link engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local candidate was discovered and must be sent to the remote peer
    LocalCandidate(IceCandidate),
    /// The data channel is open
    ChannelOpen,
    /// A text frame arrived on the data channel
    Message(String),
    /// The data channel closed
    ChannelClosed,
    /// ICE or channel failure
    Failed(String),
}

/// Sink for link events
///
/// Cloneable; engines call [`LinkEventSender::send`] from their callbacks.
/// Returns false once the receiving side has gone away.
#[derive(Clone)]
pub struct LinkEventSender {
    sink: Arc<dyn Fn(LinkEvent) -> bool + Send + Sync>,
}

impl LinkEventSender {
    /// Create a sender from a sink closure
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(LinkEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Create a sender backed by an unbounded channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(move |event| tx.send(event).is_ok()), rx)
    }

    /// Deliver an event
    pub fn send(&self, event: LinkEvent) -> bool {
        (self.sink)(event)
    }
}

impl std::fmt::Debug for LinkEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkEventSender").finish_non_exhaustive()
    }
}

/// Factory for peer links
///
/// One link is allocated per remote peer per session.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Allocate a transport toward `remote_peer_id`
    ///
    /// Every local candidate the link discovers, and every channel state
    /// change, is reported through `events`.
    async fn create_link(
        &self,
        remote_peer_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NetworkError>;
}

/// A single negotiated connection to one remote peer
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the data channel, produce an offer and set it as local description
    async fn create_offer(&self) -> Result<String, NetworkError>;

    /// Apply a remote offer, produce an answer and set it as local description
    ///
    /// The data channel is announced later through [`LinkEvent::ChannelOpen`].
    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, NetworkError>;

    /// Apply the remote answer
    async fn accept_answer(&self, answer_sdp: &str) -> Result<(), NetworkError>;

    /// Apply a remote candidate; fails if no remote description is set yet
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NetworkError>;

    /// Send a text frame over the data channel
    async fn send(&self, text: String) -> Result<(), NetworkError>;

    /// Close the channel and release the transport
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_serialization() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };

        let json = serde_json::to_string(&candidate).unwrap();
        assert!(json.contains("sdpMLineIndex"));
        let parsed: IceCandidate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, candidate);

        let bare: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).unwrap();
        assert_eq!(bare, IceCandidate::new("c"));
    }

    #[tokio::test]
    async fn test_event_sender_channel() {
        let (sender, mut rx) = LinkEventSender::channel();
        assert!(sender.send(LinkEvent::ChannelOpen));
        assert_eq!(rx.recv().await, Some(LinkEvent::ChannelOpen));

        drop(rx);
        assert!(!sender.send(LinkEvent::ChannelClosed));
    }
}
