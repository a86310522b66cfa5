//! meshchat - Real-time room chat over a peer mesh
//!
//! Peers meet in a room through a signaling relay, negotiate direct data
//! channels with every other member, and exchange chat messages over them.
//! A broker transport that publishes through the relay is available as a
//! fallback.

pub mod config;
pub mod network;
pub mod protocol;

pub use config::{ChatConfig, ReconnectPolicy, TransportKind};
pub use network::{BrokerTransport, ChatEvent, ChatTransport, MeshTransport, NetworkError};
pub use protocol::{ChatMessage, MessageKind};
