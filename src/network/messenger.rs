//! Data channel messaging
//!
//! Binds one ordered channel per peer connection, serializes outbound chat
//! messages and interprets channel events for the owning record.
//!
//! Sends are best effort: a message for a channel that is not open is
//! dropped without an error.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::protocol::{ChannelFrame, ChatMessage};

use super::connection::{ConnectionState, PeerConnectionRecord};
use super::error::NetworkError;
use super::link::{LinkEvent, PeerLink};

/// Outbound side of a bound data channel
///
/// Frames are written by a single task per channel, so per-peer order
/// matches the order of [`send`] calls.
pub struct ChannelBinding {
    peer_id: String,
    tx: mpsc::UnboundedSender<String>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBinding")
            .field("peer_id", &self.peer_id)
            .field("active", &!self.writer.is_finished())
            .finish()
    }
}

/// Outcome of a channel event for the owning record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelUpdate {
    /// Record moved to `open`
    Opened,
    /// A chat message arrived
    Delivered(ChatMessage),
    /// Record moved to `closed`
    Closed,
    /// Record moved to `failed`
    Failed(String),
    /// Nothing to report
    Ignored,
}

/// Bind a link's data channel to a peer
pub fn bind(link: Arc<dyn PeerLink>, peer_id: &str) -> ChannelBinding {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let peer = peer_id.to_string();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = link.send(frame).await {
                debug!("Frame to {} dropped: {}", peer, e);
            }
        }
        trace!("Writer for {} stopped", peer);
    });

    ChannelBinding {
        peer_id: peer_id.to_string(),
        tx,
        writer,
    }
}

/// Queue a message for a peer if its channel is open
///
/// Returns true if the message was handed to the channel writer.
pub fn send(record: &PeerConnectionRecord, message: &ChatMessage) -> bool {
    if !record.state().can_transmit() {
        debug!(
            "Dropping message {} for {}: channel {}",
            message.id,
            record.peer_id,
            record.state()
        );
        return false;
    }

    let Some(binding) = record.binding() else {
        debug!("Dropping message {} for {}: no channel", message.id, record.peer_id);
        return false;
    };

    match encode_frame(message) {
        Ok(frame) => binding.tx.send(frame).is_ok(),
        Err(e) => {
            warn!("Failed to encode message {}: {}", message.id, e);
            false
        }
    }
}

/// Serialize a chat message into a channel frame
pub fn encode_frame(message: &ChatMessage) -> Result<String, NetworkError> {
    Ok(ChannelFrame::Chat(message.clone()).to_json()?)
}

/// Parse a channel frame into a chat message
pub fn decode_frame(text: &str) -> Result<ChatMessage, NetworkError> {
    match ChannelFrame::from_json(text) {
        Ok(ChannelFrame::Chat(message)) => Ok(message),
        Err(e) => Err(NetworkError::InvalidMessage(e.to_string())),
    }
}

/// Apply a channel event to the record that owns the channel
pub fn on_channel_event(record: &mut PeerConnectionRecord, event: LinkEvent) -> ChannelUpdate {
    match event {
        LinkEvent::ChannelOpen => {
            if record.transition(ConnectionState::Open) {
                ChannelUpdate::Opened
            } else {
                ChannelUpdate::Ignored
            }
        }
        LinkEvent::Message(text) => {
            if record.state().is_terminal() {
                trace!("Ignoring frame from {} on {} channel", record.peer_id, record.state());
                return ChannelUpdate::Ignored;
            }
            match decode_frame(&text) {
                Ok(message) => ChannelUpdate::Delivered(message),
                Err(e) => {
                    warn!("Invalid frame from {}: {}", record.peer_id, e);
                    ChannelUpdate::Ignored
                }
            }
        }
        LinkEvent::ChannelClosed => {
            if record.transition(ConnectionState::Closed) {
                ChannelUpdate::Closed
            } else {
                ChannelUpdate::Ignored
            }
        }
        LinkEvent::Failed(reason) => {
            if record.transition(ConnectionState::Failed) {
                ChannelUpdate::Failed(reason)
            } else {
                ChannelUpdate::Ignored
            }
        }
        LinkEvent::LocalCandidate(_) => ChannelUpdate::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::NegotiationRole;
    use crate::protocol::MessageKind;

    fn record() -> PeerConnectionRecord {
        let mut rec = PeerConnectionRecord::new("p2", "Bob", "addr-2", NegotiationRole::Responder, 7);
        rec.transition(ConnectionState::Negotiating);
        rec
    }

    #[test]
    fn test_frame_round_trip() {
        let msg = ChatMessage::new("p1", "Alice", "hello", MessageKind::Text);
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_frame("not json"),
            Err(NetworkError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_send_dropped_when_not_open() {
        let rec = record();
        let msg = ChatMessage::new("p1", "Alice", "hello", MessageKind::Text);
        assert!(!send(&rec, &msg));
    }

    #[test]
    fn test_channel_events_drive_state() {
        let mut rec = record();

        assert_eq!(on_channel_event(&mut rec, LinkEvent::ChannelOpen), ChannelUpdate::Opened);
        assert_eq!(rec.state(), ConnectionState::Open);
        // A second open is not a new transition
        assert_eq!(on_channel_event(&mut rec, LinkEvent::ChannelOpen), ChannelUpdate::Ignored);

        let msg = ChatMessage::new("p2", "Bob", "yo", MessageKind::Text);
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(
            on_channel_event(&mut rec, LinkEvent::Message(frame)),
            ChannelUpdate::Delivered(msg)
        );
        assert_eq!(
            on_channel_event(&mut rec, LinkEvent::Message("{}".to_string())),
            ChannelUpdate::Ignored
        );

        assert_eq!(on_channel_event(&mut rec, LinkEvent::ChannelClosed), ChannelUpdate::Closed);
        assert_eq!(rec.state(), ConnectionState::Closed);
        assert_eq!(
            on_channel_event(&mut rec, LinkEvent::Failed("late".to_string())),
            ChannelUpdate::Ignored
        );
    }

    #[test]
    fn test_failure_reported_once() {
        let mut rec = record();
        assert_eq!(
            on_channel_event(&mut rec, LinkEvent::Failed("ice".to_string())),
            ChannelUpdate::Failed("ice".to_string())
        );
        assert_eq!(rec.state(), ConnectionState::Failed);
        assert_eq!(on_channel_event(&mut rec, LinkEvent::ChannelClosed), ChannelUpdate::Ignored);
    }
}
