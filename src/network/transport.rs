//! Chat transports
//!
//! [`ChatTransport`] is the application-facing surface. Two strategies
//! implement it:
//!
//! - [`MeshTransport`]: direct peer links negotiated through the relay;
//!   the relay only carries signaling.
//! - [`BrokerTransport`]: chat messages travel through the relay itself and
//!   presence mirrors relay membership.
//!
//! Both report through the same [`ChatEvent`] stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{ChatMessage, MessageKind};

use super::connection::ConnectionState;
use super::error::{NetworkError, TransportFault};
use super::link::PeerConnector;
use super::presence::PresenceTracker;
use super::router::MessageRouter;
use super::session::{Session, SessionConfig, SessionCoordinator, SessionHandle};
use super::signaling::{RelayCommand, RelayEvent, RelayLink, SignalingRelay};

/// Notification delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A message was delivered: the local echo or a remote message
    Message(ChatMessage),
    /// A peer became reachable
    PeerConnected(String),
    /// A reachable peer went away
    PeerDisconnected(String),
    /// A non-fatal fault; the session keeps running
    Error(TransportFault),
}

/// Real-time chat transport
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Join a room
    ///
    /// Fails with `AlreadyConnected` if a session is active.
    async fn connect(
        &mut self,
        room_id: &str,
        local_peer_id: &str,
        display_name: &str,
    ) -> Result<(), NetworkError>;

    /// Leave the room; no-op when not connected
    async fn disconnect(&mut self);

    /// Send a message to the room
    ///
    /// Fails with `NotConnected` before `connect`.
    async fn send_message(&self, body: &str, kind: MessageKind)
        -> Result<ChatMessage, NetworkError>;

    /// Peers currently reachable, in ascending id order
    async fn connected_peers(&self) -> Vec<String>;

    /// Recently delivered messages, oldest first
    async fn history(&self) -> Vec<ChatMessage>;

    fn is_connected(&self) -> bool;

    fn session(&self) -> Option<&Session>;
}

/// Full-mesh transport over direct peer links
pub struct MeshTransport {
    relay: Arc<dyn SignalingRelay>,
    connector: Arc<dyn PeerConnector>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<ChatEvent>,
    handle: Option<SessionHandle>,
}

impl MeshTransport {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        connector: Arc<dyn PeerConnector>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                relay,
                connector,
                config,
                events,
                handle: None,
            },
            rx,
        )
    }

    /// Negotiation state of every known peer
    pub async fn peer_states(&self) -> Vec<(String, ConnectionState)> {
        match &self.handle {
            Some(handle) => handle.peer_states().await,
            None => Vec::new(),
        }
    }

    /// Whether the local peer was first in the room
    pub fn is_host(&self) -> Option<bool> {
        self.handle.as_ref().map(|h| h.session().is_host)
    }
}

#[async_trait]
impl ChatTransport for MeshTransport {
    async fn connect(
        &mut self,
        room_id: &str,
        local_peer_id: &str,
        display_name: &str,
    ) -> Result<(), NetworkError> {
        if self.handle.is_some() {
            return Err(NetworkError::AlreadyConnected);
        }

        let handle = SessionCoordinator::start(
            self.relay.clone(),
            self.connector.clone(),
            room_id,
            local_peer_id,
            display_name,
            self.config.clone(),
            self.events.clone(),
        )
        .await?;
        self.handle = Some(handle);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }

    async fn send_message(
        &self,
        body: &str,
        kind: MessageKind,
    ) -> Result<ChatMessage, NetworkError> {
        let handle = self.handle.as_ref().ok_or(NetworkError::NotConnected)?;
        handle.send(body.to_string(), kind).await
    }

    async fn connected_peers(&self) -> Vec<String> {
        match &self.handle {
            Some(handle) => handle.connected_peers().await,
            None => Vec::new(),
        }
    }

    async fn history(&self) -> Vec<ChatMessage> {
        match &self.handle {
            Some(handle) => handle.history().await,
            None => Vec::new(),
        }
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    fn session(&self) -> Option<&Session> {
        self.handle.as_ref().map(|h| h.session())
    }
}

/// Broker-side session state
struct BrokerState {
    presence: PresenceTracker,
    router: MessageRouter,
    /// signaling address -> peer id
    members: HashMap<String, String>,
}

struct BrokerSession {
    session: Session,
    outbound: mpsc::UnboundedSender<RelayCommand>,
    state: Arc<Mutex<BrokerState>>,
    pump: JoinHandle<()>,
}

/// Transport that publishes chat through the relay
pub struct BrokerTransport {
    relay: Arc<dyn SignalingRelay>,
    history_capacity: usize,
    events: mpsc::UnboundedSender<ChatEvent>,
    active: Option<BrokerSession>,
}

impl BrokerTransport {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                relay,
                history_capacity: config.history_capacity,
                events,
                active: None,
            },
            rx,
        )
    }
}

/// Apply relay events to broker state until the link ends
async fn pump_broker(
    mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    state: Arc<Mutex<BrokerState>>,
    events: mpsc::UnboundedSender<ChatEvent>,
    local_peer_id: String,
) {
    while let Some(event) = relay_events.recv().await {
        let mut state = state.lock();
        match event {
            RelayEvent::PeerJoined(peer) => {
                if peer.peer_id == local_peer_id {
                    continue;
                }
                state
                    .members
                    .insert(peer.signaling_address, peer.peer_id.clone());
                if state.presence.join(&peer.peer_id) {
                    let _ = events.send(ChatEvent::PeerConnected(peer.peer_id));
                }
            }
            RelayEvent::PeerLeft { signaling_address } => {
                if let Some(peer_id) = state.members.remove(&signaling_address) {
                    if state.presence.leave(&peer_id) {
                        let _ = events.send(ChatEvent::PeerDisconnected(peer_id));
                    }
                }
            }
            RelayEvent::Chat(message) => {
                state.router.inbound(message);
            }
            RelayEvent::Signal { kind, from, .. } => {
                debug!("Ignoring {} from {} on broker session", kind, from);
            }
            RelayEvent::Closed(reason) => {
                warn!("Relay unavailable: {}", reason);
                let _ = events.send(ChatEvent::Error(TransportFault::SignalingUnavailable(reason)));
                return;
            }
        }
    }
}

#[async_trait]
impl ChatTransport for BrokerTransport {
    async fn connect(
        &mut self,
        room_id: &str,
        local_peer_id: &str,
        display_name: &str,
    ) -> Result<(), NetworkError> {
        if self.active.is_some() {
            return Err(NetworkError::AlreadyConnected);
        }

        let RelayLink {
            roster,
            outbound,
            events: relay_events,
            ..
        } = self
            .relay
            .join(room_id, local_peer_id, display_name)
            .await
            .map_err(|e| match e {
                NetworkError::Timeout | NetworkError::Io(_) => {
                    NetworkError::SignalingUnavailable(e.to_string())
                }
                other => other,
            })?;

        let session = Session {
            room_id: room_id.to_string(),
            local_peer_id: local_peer_id.to_string(),
            display_name: display_name.to_string(),
            is_host: roster.is_empty(),
        };

        let mut state = BrokerState {
            presence: PresenceTracker::new(),
            router: MessageRouter::new(
                local_peer_id,
                display_name,
                self.history_capacity,
                self.events.clone(),
            )
            .with_self_echo_filter(),
            members: HashMap::new(),
        };
        for peer in roster {
            state
                .members
                .insert(peer.signaling_address, peer.peer_id.clone());
            if state.presence.join(&peer.peer_id) {
                let _ = self.events.send(ChatEvent::PeerConnected(peer.peer_id));
            }
        }

        let state = Arc::new(Mutex::new(state));
        let pump = tokio::spawn(pump_broker(
            relay_events,
            state.clone(),
            self.events.clone(),
            local_peer_id.to_string(),
        ));

        info!("Joined room {} over broker as {}", room_id, local_peer_id);
        self.active = Some(BrokerSession {
            session,
            outbound,
            state,
            pump,
        });
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.outbound.send(RelayCommand::Leave);
            active.pump.abort();
            active.state.lock().presence.clear();
            info!("Left room {}", active.session.room_id);
        }
    }

    async fn send_message(
        &self,
        body: &str,
        kind: MessageKind,
    ) -> Result<ChatMessage, NetworkError> {
        let active = self.active.as_ref().ok_or(NetworkError::NotConnected)?;
        let message = active.state.lock().router.compose(body, kind);
        if active
            .outbound
            .send(RelayCommand::Chat(message.clone()))
            .is_err()
        {
            debug!("Relay gone, message {} not published", message.id);
        }
        Ok(message)
    }

    async fn connected_peers(&self) -> Vec<String> {
        match &self.active {
            Some(active) => active.state.lock().presence.peers(),
            None => Vec::new(),
        }
    }

    async fn history(&self) -> Vec<ChatMessage> {
        match &self.active {
            Some(active) => active.state.lock().router.history(),
            None => Vec::new(),
        }
    }

    fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.outbound.send(RelayCommand::Leave);
            active.pump.abort();
        }
    }
}
