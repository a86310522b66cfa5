//! Network error types

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Relay rejected request: {0}")]
    RelayRejected(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Duplicate peer: {0}")]
    DuplicatePeer(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Room is full")]
    RoomFull,

    #[error("Timeout")]
    Timeout,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal faults surfaced to the application through the event stream
///
/// None of these abort the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// The relay link was lost; open peer channels keep working
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// SDP or ICE failure for a single peer
    #[error("Negotiation with {peer_id} failed: {reason}")]
    NegotiationFailed { peer_id: String, reason: String },

    /// Data channel error for a single peer
    #[error("Channel to {peer_id} failed: {reason}")]
    ChannelFailed { peer_id: String, reason: String },
}

impl TransportFault {
    /// Peer the fault is scoped to, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Self::SignalingUnavailable(_) => None,
            Self::NegotiationFailed { peer_id, .. } | Self::ChannelFailed { peer_id, .. } => {
                Some(peer_id)
            }
        }
    }
}
