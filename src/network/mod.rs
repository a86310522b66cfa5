//! Network module for peer-mesh chat
//!
//! Handles room signaling, peer link negotiation, data channel messaging,
//! presence, and the transports built on top of them.

mod connection;
mod error;
mod link;
mod memory;
mod messenger;
mod presence;
#[cfg(feature = "webrtc")]
mod rtc;
mod router;
mod session;
mod signaling;
mod transport;

pub use connection::{ConnectionState, NegotiationRole, PeerConnectionRecord};
pub use error::{NetworkError, TransportFault};
pub use link::{
    IceCandidate, LinkEvent, LinkEventSender, PeerConnector, PeerLink, DATA_CHANNEL_LABEL,
};
pub use memory::{MemoryConnector, MemoryLink, MemoryNetwork, MemoryRelay};
pub use messenger::{decode_frame, encode_frame, ChannelBinding, ChannelUpdate};
pub use presence::PresenceTracker;
#[cfg(feature = "webrtc")]
pub use rtc::{RtcConnector, RtcLink};
pub use router::{MessageRouter, DEFAULT_HISTORY_CAPACITY};
pub use session::{
    Session, SessionConfig, SessionCoordinator, SessionHandle, DEFAULT_NEGOTIATION_TIMEOUT,
};
pub use signaling::{
    PeerInfo, RelayCommand, RelayEvent, RelayLink, RoomInfo, RoomRegistry, SignalKind,
    SignalingConnection, SignalingMessage, SignalingRelay, SignalingServer, WebSocketRelay,
    DEFAULT_JOIN_TIMEOUT, MAX_PEERS_PER_ROOM,
};
pub use transport::{BrokerTransport, ChatEvent, ChatTransport, MeshTransport};
