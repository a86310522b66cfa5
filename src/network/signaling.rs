//! Signaling relay for peer discovery and negotiation
//!
//! The relay tracks room membership and forwards opaque negotiation payloads
//! between members. Every member is addressed by a signaling address the
//! relay assigns on join; peers never learn each other's socket addresses.
//!
//! Server side: [`RoomRegistry`] holds the rooms, [`SignalingServer`] exposes
//! it over WebSocket. Client side: [`SignalingRelay`] is the seam the session
//! coordinator consumes, implemented over WebSocket by [`WebSocketRelay`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::protocol::ChatMessage;

use super::error::NetworkError;

/// Maximum peers per room
pub const MAX_PEERS_PER_ROOM: usize = 10;

/// Default time to wait for the relay to acknowledge a join
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Negotiation payload tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room member as seen by other members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    /// Opaque routing handle assigned by the relay
    pub signaling_address: String,
}

/// Room information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub peer_count: usize,
    pub max_peers: usize,
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SignalingMessage {
    // Client -> Server
    Join {
        room_id: String,
        peer_id: String,
        display_name: String,
    },
    Leave,
    Signal {
        target: String,
        kind: SignalKind,
        payload: String,
    },
    PeerCount {
        room_id: String,
    },
    ListRooms,

    // Both directions: client -> server to publish, server -> client to deliver
    Chat {
        message: ChatMessage,
    },

    // Server -> Client
    Joined {
        room_id: String,
        signaling_address: String,
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        peer: PeerInfo,
    },
    PeerLeft {
        signaling_address: String,
    },
    Relayed {
        from: String,
        kind: SignalKind,
        payload: String,
    },
    PeerCountResult {
        room_id: String,
        count: usize,
    },
    RoomList {
        rooms: Vec<RoomInfo>,
    },
    Error {
        message: String,
    },
}

/// Event delivered by a relay link to the session
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    PeerJoined(PeerInfo),
    PeerLeft { signaling_address: String },
    Signal {
        from: String,
        kind: SignalKind,
        payload: String,
    },
    /// Chat message published by another member (broker path)
    Chat(ChatMessage),
    /// The relay link is gone
    Closed(String),
}

/// Request sent by the session over a relay link
#[derive(Debug, Clone, PartialEq)]
pub enum RelayCommand {
    Signal {
        target: String,
        kind: SignalKind,
        payload: String,
    },
    Chat(ChatMessage),
    Leave,
}

/// Membership in one room on a relay
///
/// Dropping `outbound` or sending [`RelayCommand::Leave`] leaves the room.
#[derive(Debug)]
pub struct RelayLink {
    /// Address the relay assigned to the local member
    pub local_address: String,
    /// Members already in the room at join time, self excluded
    pub roster: Vec<PeerInfo>,
    pub outbound: mpsc::UnboundedSender<RelayCommand>,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// Rendezvous service used to bootstrap peer links
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Join a room and subscribe to its events
    async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<RelayLink, NetworkError>;
}

/// Translate a server message into a relay event
///
/// Returns `None` for messages that carry no session event.
pub(crate) fn relay_event_from(msg: SignalingMessage) -> Option<RelayEvent> {
    match msg {
        SignalingMessage::PeerJoined { peer } => Some(RelayEvent::PeerJoined(peer)),
        SignalingMessage::PeerLeft { signaling_address } => {
            Some(RelayEvent::PeerLeft { signaling_address })
        }
        SignalingMessage::Relayed {
            from,
            kind,
            payload,
        } => Some(RelayEvent::Signal {
            from,
            kind,
            payload,
        }),
        SignalingMessage::Chat { message } => Some(RelayEvent::Chat(message)),
        SignalingMessage::Error { message } => {
            warn!("Relay error: {}", message);
            None
        }
        other => {
            trace!("Ignoring relay message {:?}", other);
            None
        }
    }
}

/// Member of a room on the server
struct Member {
    info: PeerInfo,
    outbox: mpsc::UnboundedSender<SignalingMessage>,
}

/// Room state on the server
struct Room {
    id: String,
    /// Join order
    members: Vec<Member>,
}

impl Room {
    fn send_to(&self, address: &str, msg: SignalingMessage) -> bool {
        match self
            .members
            .iter()
            .find(|m| m.info.signaling_address == address)
        {
            Some(member) => member.outbox.send(msg).is_ok(),
            None => false,
        }
    }

    fn send_to_others(&self, except: &str, msg: &SignalingMessage) -> usize {
        self.members
            .iter()
            .filter(|m| m.info.signaling_address != except)
            .filter(|m| m.outbox.send(msg.clone()).is_ok())
            .count()
    }
}

/// Server-side room membership
///
/// Cloning shares the same rooms.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member to a room, creating the room if needed
    ///
    /// Returns the assigned signaling address and the existing members.
    /// Existing members are sent `PeerJoined`.
    pub async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
        outbox: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<(String, Vec<PeerInfo>), NetworkError> {
        if room_id.is_empty() || peer_id.is_empty() {
            return Err(NetworkError::InvalidMessage(
                "room_id and peer_id are required".to_string(),
            ));
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_insert_with(|| Room {
            id: room_id.to_string(),
            members: Vec::new(),
        });

        if room.members.iter().any(|m| m.info.peer_id == peer_id) {
            return Err(NetworkError::DuplicatePeer(peer_id.to_string()));
        }
        if room.members.len() >= MAX_PEERS_PER_ROOM {
            return Err(NetworkError::RoomFull);
        }

        let info = PeerInfo {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            signaling_address: Uuid::new_v4().to_string(),
        };
        let roster: Vec<PeerInfo> = room.members.iter().map(|m| m.info.clone()).collect();

        room.send_to_others(
            &info.signaling_address,
            &SignalingMessage::PeerJoined { peer: info.clone() },
        );

        let address = info.signaling_address.clone();
        room.members.push(Member { info, outbox });

        info!(
            "Peer {} joined room {} ({} member(s))",
            peer_id,
            room_id,
            room.members.len()
        );
        Ok((address, roster))
    }

    /// Remove a member; remaining members are sent `PeerLeft`
    ///
    /// Empty rooms are removed. Returns false if the member was unknown.
    pub async fn leave(&self, room_id: &str, address: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };

        let before = room.members.len();
        room.members.retain(|m| m.info.signaling_address != address);
        if room.members.len() == before {
            return false;
        }

        room.send_to_others(
            address,
            &SignalingMessage::PeerLeft {
                signaling_address: address.to_string(),
            },
        );
        debug!("Member {} left room {}", address, room_id);

        if room.members.is_empty() {
            rooms.remove(room_id);
            info!("Room {} removed (empty)", room_id);
        }
        true
    }

    /// Forward a negotiation payload to one member, stamped with the sender
    pub async fn forward(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        kind: SignalKind,
        payload: String,
    ) -> Result<(), NetworkError> {
        let rooms = self.rooms.read().await;
        let room = rooms
            .get(room_id)
            .ok_or_else(|| NetworkError::PeerNotFound(target.to_string()))?;

        let msg = SignalingMessage::Relayed {
            from: from.to_string(),
            kind,
            payload,
        };
        if room.send_to(target, msg) {
            trace!("Relayed {} {} -> {}", kind, from, target);
            Ok(())
        } else {
            Err(NetworkError::PeerNotFound(target.to_string()))
        }
    }

    /// Publish a chat message to every member except the sender
    ///
    /// Returns the number of members it was queued for.
    pub async fn broadcast_chat(&self, room_id: &str, from: &str, message: ChatMessage) -> usize {
        let rooms = self.rooms.read().await;
        match rooms.get(room_id) {
            Some(room) => room.send_to_others(from, &SignalingMessage::Chat { message }),
            None => 0,
        }
    }

    /// Members currently in a room
    pub async fn peer_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|r| r.members.len()).unwrap_or(0)
    }

    /// Get list of rooms
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms.read().await;
        let mut list: Vec<RoomInfo> = rooms
            .values()
            .map(|room| RoomInfo {
                id: room.id.clone(),
                peer_count: room.members.len(),
                max_peers: MAX_PEERS_PER_ROOM,
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

/// Signaling server state
#[derive(Clone, Default)]
pub struct SignalingServer {
    registry: RoomRegistry,
}

impl SignalingServer {
    /// Create a new signaling server
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server over an existing registry
    pub fn with_registry(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Start the signaling server
    pub async fn run(&self, addr: &str) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signaling server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept plain WebSocket connections from a bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NetworkError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New signaling connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Upgrade a stream to WebSocket and serve it until it closes
    ///
    /// Works over any byte stream, including a TLS stream.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws_stream = accept_async(stream).await.map_err(|e| {
            NetworkError::SignalingUnavailable(format!("WebSocket accept failed: {}", e))
        })?;

        let (mut write, mut read) = ws_stream.split();
        let mut membership: Option<(String, String)> = None;
        let mut outbox_rx: Option<mpsc::UnboundedReceiver<SignalingMessage>> = None;

        loop {
            let reply = tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SignalingMessage>(&text) {
                                Ok(msg) => self.process_message(msg, &mut membership, &mut outbox_rx).await,
                                Err(e) => {
                                    warn!("Invalid message: {}", e);
                                    Some(SignalingMessage::Error {
                                        message: format!("Invalid message: {}", e),
                                    })
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break;
                        }
                        _ => None,
                    }
                }

                // Messages addressed to this member by others
                queued = async {
                    if let Some(ref mut rx) = outbox_rx {
                        rx.recv().await
                    } else {
                        std::future::pending::<Option<SignalingMessage>>().await
                    }
                } => queued,
            };

            if let Some(msg) = reply {
                let json = serde_json::to_string(&msg)?;
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }

        // Clean up on disconnect
        if let Some((room_id, address)) = membership {
            self.registry.leave(&room_id, &address).await;
        }

        Ok(())
    }

    /// Process one client message, returning the direct reply if any
    async fn process_message(
        &self,
        msg: SignalingMessage,
        membership: &mut Option<(String, String)>,
        outbox_rx: &mut Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    ) -> Option<SignalingMessage> {
        match msg {
            SignalingMessage::Join {
                room_id,
                peer_id,
                display_name,
            } => {
                if membership.is_some() {
                    return Some(SignalingMessage::Error {
                        message: "Already joined".to_string(),
                    });
                }

                let (tx, rx) = mpsc::unbounded_channel();
                match self
                    .registry
                    .join(&room_id, &peer_id, &display_name, tx)
                    .await
                {
                    Ok((signaling_address, peers)) => {
                        *membership = Some((room_id.clone(), signaling_address.clone()));
                        *outbox_rx = Some(rx);
                        Some(SignalingMessage::Joined {
                            room_id,
                            signaling_address,
                            peers,
                        })
                    }
                    Err(e) => Some(SignalingMessage::Error {
                        message: e.to_string(),
                    }),
                }
            }

            SignalingMessage::Leave => {
                if let Some((room_id, address)) = membership.take() {
                    self.registry.leave(&room_id, &address).await;
                    *outbox_rx = None;
                }
                None
            }

            SignalingMessage::Signal {
                target,
                kind,
                payload,
            } => {
                let Some((room_id, address)) = membership.as_ref() else {
                    return Some(SignalingMessage::Error {
                        message: "Not joined".to_string(),
                    });
                };
                match self
                    .registry
                    .forward(room_id, address, &target, kind, payload)
                    .await
                {
                    Ok(()) => None,
                    Err(e) => {
                        debug!("Signal from {} dropped: {}", address, e);
                        Some(SignalingMessage::Error {
                            message: e.to_string(),
                        })
                    }
                }
            }

            SignalingMessage::Chat { message } => {
                let Some((room_id, address)) = membership.as_ref() else {
                    return Some(SignalingMessage::Error {
                        message: "Not joined".to_string(),
                    });
                };
                self.registry.broadcast_chat(room_id, address, message).await;
                None
            }

            SignalingMessage::PeerCount { room_id } => {
                let count = self.registry.peer_count(&room_id).await;
                Some(SignalingMessage::PeerCountResult { room_id, count })
            }

            SignalingMessage::ListRooms => Some(SignalingMessage::RoomList {
                rooms: self.registry.list_rooms().await,
            }),

            // Server->Client messages are ignored if received
            _ => None,
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// An active connection to the signaling server
pub struct SignalingConnection {
    ws_stream: WsStream,
}

impl SignalingConnection {
    /// Connect to the signaling server
    pub async fn connect(server_url: &str) -> Result<Self, NetworkError> {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(|e| NetworkError::SignalingUnavailable(format!("Connect failed: {}", e)))?;

        debug!("Connected to signaling server: {}", server_url);

        Ok(Self { ws_stream })
    }

    /// Send a message to the server
    pub async fn send(&mut self, msg: &SignalingMessage) -> Result<(), NetworkError> {
        let json = serde_json::to_string(msg)?;

        self.ws_stream
            .send(Message::Text(json))
            .await
            .map_err(|e| NetworkError::SignalingUnavailable(format!("Send failed: {}", e)))
    }

    /// Receive a message from the server
    pub async fn recv(&mut self) -> Result<SignalingMessage, NetworkError> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| NetworkError::InvalidMessage(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(NetworkError::SignalingUnavailable(
                        "Connection closed".to_string(),
                    ));
                }
                Some(Err(e)) => {
                    return Err(NetworkError::SignalingUnavailable(format!(
                        "Receive failed: {}",
                        e
                    )));
                }
                _ => continue,
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), NetworkError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| NetworkError::SignalingUnavailable(format!("Close failed: {}", e)))
    }
}

/// Relay reached over a WebSocket signaling server
#[derive(Debug, Clone)]
pub struct WebSocketRelay {
    url: String,
    join_timeout: Duration,
}

impl WebSocketRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Query how many members a room currently has
    pub async fn peer_count(&self, room_id: &str) -> Result<usize, NetworkError> {
        let reply = self
            .request(SignalingMessage::PeerCount {
                room_id: room_id.to_string(),
            })
            .await?;
        match reply {
            SignalingMessage::PeerCountResult { count, .. } => Ok(count),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Query the relay's rooms
    pub async fn list_rooms(&self) -> Result<Vec<RoomInfo>, NetworkError> {
        match self.request(SignalingMessage::ListRooms).await? {
            SignalingMessage::RoomList { rooms } => Ok(rooms),
            other => Err(unexpected_reply(other)),
        }
    }

    /// One-shot request over a fresh connection
    async fn request(&self, msg: SignalingMessage) -> Result<SignalingMessage, NetworkError> {
        let mut conn = SignalingConnection::connect(&self.url).await?;
        conn.send(&msg).await?;
        let reply = tokio::time::timeout(self.join_timeout, conn.recv())
            .await
            .map_err(|_| NetworkError::Timeout)??;
        let _ = conn.close().await;
        Ok(reply)
    }
}

fn unexpected_reply(msg: SignalingMessage) -> NetworkError {
    match msg {
        SignalingMessage::Error { message } => NetworkError::RelayRejected(message),
        other => NetworkError::InvalidMessage(format!("Unexpected reply: {:?}", other)),
    }
}

#[async_trait]
impl SignalingRelay for WebSocketRelay {
    async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<RelayLink, NetworkError> {
        let mut conn = SignalingConnection::connect(&self.url).await?;
        conn.send(&SignalingMessage::Join {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
        })
        .await?;

        let (local_address, roster) = tokio::time::timeout(self.join_timeout, await_joined(&mut conn))
            .await
            .map_err(|_| NetworkError::Timeout)??;

        info!(
            "Joined room {} as {} ({} existing member(s))",
            room_id,
            local_address,
            roster.len()
        );

        let (outbound, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(pump_websocket(conn.ws_stream, commands, events_tx));

        Ok(RelayLink {
            local_address,
            roster,
            outbound,
            events,
        })
    }
}

/// Wait for the relay to acknowledge a join
async fn await_joined(
    conn: &mut SignalingConnection,
) -> Result<(String, Vec<PeerInfo>), NetworkError> {
    loop {
        match conn.recv().await? {
            SignalingMessage::Joined {
                signaling_address,
                peers,
                ..
            } => return Ok((signaling_address, peers)),
            SignalingMessage::Error { message } => return Err(NetworkError::RelayRejected(message)),
            other => trace!("Ignoring {:?} before join ack", other),
        }
    }
}

/// Shuttle relay commands and events between a session and the socket
async fn pump_websocket(
    ws_stream: WsStream,
    mut commands: mpsc::UnboundedReceiver<RelayCommand>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(msg) => {
                                if let Some(event) = relay_event_from(msg) {
                                    if events.send(event).is_err() {
                                        // Session gone
                                        let _ = write.close().await;
                                        return;
                                    }
                                }
                            }
                            Err(e) => warn!("Invalid relay message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "Connection closed".to_string(),
                    Some(Err(e)) => break format!("Receive failed: {}", e),
                    _ => {}
                }
            }

            cmd = commands.recv() => {
                let msg = match cmd {
                    Some(RelayCommand::Signal { target, kind, payload }) => {
                        SignalingMessage::Signal { target, kind, payload }
                    }
                    Some(RelayCommand::Chat(message)) => SignalingMessage::Chat { message },
                    Some(RelayCommand::Leave) | None => {
                        if let Ok(json) = serde_json::to_string(&SignalingMessage::Leave) {
                            let _ = write.send(Message::Text(json)).await;
                        }
                        let _ = write.close().await;
                        debug!("Left relay");
                        return;
                    }
                };

                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            break format!("Send failed: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode relay command: {}", e),
                }
            }
        }
    };

    warn!("Relay link lost: {}", reason);
    let _ = events.send(RelayEvent::Closed(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    #[test]
    fn test_signal_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&SignalKind::IceCandidate).unwrap(),
            "\"ice-candidate\""
        );
        assert_eq!(
            serde_json::from_str::<SignalKind>("\"offer\"").unwrap(),
            SignalKind::Offer
        );
    }

    #[test]
    fn test_signaling_message_serialize() {
        let msg = SignalingMessage::Signal {
            target: "addr-2".to_string(),
            kind: SignalKind::Answer,
            payload: "sdp".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Signal\""));
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();

        match parsed {
            SignalingMessage::Signal {
                target,
                kind,
                payload,
            } => {
                assert_eq!(target, "addr-2");
                assert_eq!(kind, SignalKind::Answer);
                assert_eq!(payload, "sdp");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[tokio::test]
    async fn test_registry_join_notifies_existing_members() {
        let registry = RoomRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let (addr1, roster1) = registry.join("table-42", "p1", "Alice", tx1).await.unwrap();
        assert!(roster1.is_empty());

        let (addr2, roster2) = registry.join("table-42", "p2", "Bob", tx2).await.unwrap();
        assert_eq!(roster2.len(), 1);
        assert_eq!(roster2[0].signaling_address, addr1);
        assert_ne!(addr1, addr2);

        match rx1.try_recv().unwrap() {
            SignalingMessage::PeerJoined { peer } => {
                assert_eq!(peer.peer_id, "p2");
                assert_eq!(peer.signaling_address, addr2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx2.try_recv().is_err(), "joiner is not told about itself");
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates_and_full_rooms() {
        let registry = RoomRegistry::new();
        let mut receivers = Vec::new();
        for i in 0..MAX_PEERS_PER_ROOM {
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push(rx);
            registry
                .join("r", &format!("p{}", i), "n", tx)
                .await
                .unwrap();
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            registry.join("r", "p0", "dup", tx.clone()).await,
            Err(NetworkError::DuplicatePeer(_))
        ));
        assert!(matches!(
            registry.join("r", "late", "n", tx).await,
            Err(NetworkError::RoomFull)
        ));
        assert_eq!(registry.peer_count("r").await, MAX_PEERS_PER_ROOM);
    }

    #[tokio::test]
    async fn test_registry_forward_and_leave() {
        let registry = RoomRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (addr1, _) = registry.join("r", "p1", "A", tx1).await.unwrap();
        let (addr2, _) = registry.join("r", "p2", "B", tx2).await.unwrap();
        let _ = rx1.try_recv(); // PeerJoined

        registry
            .forward("r", &addr1, &addr2, SignalKind::Offer, "o".to_string())
            .await
            .unwrap();
        match rx2.try_recv().unwrap() {
            SignalingMessage::Relayed { from, kind, .. } => {
                assert_eq!(from, addr1);
                assert_eq!(kind, SignalKind::Offer);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            registry
                .forward("r", &addr1, "nobody", SignalKind::Answer, String::new())
                .await,
            Err(NetworkError::PeerNotFound(_))
        ));

        assert!(registry.leave("r", &addr2).await);
        assert!(!registry.leave("r", &addr2).await);
        match rx1.try_recv().unwrap() {
            SignalingMessage::PeerLeft { signaling_address } => assert_eq!(signaling_address, addr2),
            other => panic!("unexpected {:?}", other),
        }

        assert!(registry.leave("r", &addr1).await);
        assert!(registry.list_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_chat_excludes_sender() {
        let registry = RoomRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (addr1, _) = registry.join("r", "p1", "A", tx1).await.unwrap();
        registry.join("r", "p2", "B", tx2).await.unwrap();
        let _ = rx1.try_recv();

        let msg = ChatMessage::new("p1", "A", "hi", MessageKind::Text);
        assert_eq!(registry.broadcast_chat("r", &addr1, msg.clone()).await, 1);

        assert!(rx1.try_recv().is_err());
        match rx2.try_recv().unwrap() {
            SignalingMessage::Chat { message } => assert_eq!(message, msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_relay_event_translation() {
        let peer = PeerInfo {
            peer_id: "p2".to_string(),
            display_name: "Bob".to_string(),
            signaling_address: "a2".to_string(),
        };
        assert_eq!(
            relay_event_from(SignalingMessage::PeerJoined { peer: peer.clone() }),
            Some(RelayEvent::PeerJoined(peer))
        );
        assert_eq!(relay_event_from(SignalingMessage::ListRooms), None);
        assert_eq!(
            relay_event_from(SignalingMessage::Error {
                message: "x".to_string()
            }),
            None
        );
    }
}
