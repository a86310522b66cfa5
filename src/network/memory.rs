//! In-process relay and peer links
//!
//! [`MemoryRelay`] runs the same [`RoomRegistry`] as the WebSocket server,
//! without sockets. [`MemoryNetwork`] simulates the offer/answer/candidate
//! handshake between links so sessions can be driven end to end in tests and
//! in offline demos.
//!
//! A memory channel opens once both sides hold a local and a remote
//! description and have applied at least one remote candidate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::error::NetworkError;
use super::link::{IceCandidate, LinkEvent, LinkEventSender, PeerConnector, PeerLink};
use super::signaling::{
    relay_event_from, RelayCommand, RelayEvent, RelayLink, RoomRegistry, SignalingMessage,
    SignalingRelay,
};

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

type KillSwitches = Arc<Mutex<HashMap<(String, String), (u64, oneshot::Sender<()>)>>>;

/// Relay backed by an in-process room registry
#[derive(Clone, Default)]
pub struct MemoryRelay {
    registry: RoomRegistry,
    /// Kill switches for live memberships, keyed by (room, peer id)
    severs: KillSwitches,
    next_membership: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay over an existing registry, e.g. one also served over WebSocket
    pub fn with_registry(registry: RoomRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Make subsequent joins fail with `SignalingUnavailable`
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Drop a member's relay link as if the socket died
    ///
    /// The member receives [`RelayEvent::Closed`] and the room sees it leave.
    pub fn sever(&self, room_id: &str, peer_id: &str) -> bool {
        let key = (room_id.to_string(), peer_id.to_string());
        match self.severs.lock().remove(&key) {
            Some((_, kill)) => kill.send(()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<RelayLink, NetworkError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NetworkError::SignalingUnavailable(
                "relay offline".to_string(),
            ));
        }

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (local_address, roster) = self
            .registry
            .join(room_id, peer_id, display_name, outbox_tx)
            .await
            .map_err(|e| match e {
                NetworkError::RoomFull | NetworkError::DuplicatePeer(_) => {
                    NetworkError::RelayRejected(e.to_string())
                }
                other => other,
            })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let token = self.next_membership.fetch_add(1, Ordering::Relaxed);
        self.severs
            .lock()
            .insert((room_id.to_string(), peer_id.to_string()), (token, kill_tx));

        let (outbound, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(pump_memory(
            MemoryMembership {
                registry: self.registry.clone(),
                severs: self.severs.clone(),
                token,
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                address: local_address.clone(),
            },
            outbox_rx,
            commands,
            events_tx,
            kill_rx,
        ));

        Ok(RelayLink {
            local_address,
            roster,
            outbound,
            events,
        })
    }
}

struct MemoryMembership {
    registry: RoomRegistry,
    severs: KillSwitches,
    token: u64,
    room_id: String,
    peer_id: String,
    address: String,
}

impl MemoryMembership {
    async fn leave(&self) {
        self.registry.leave(&self.room_id, &self.address).await;
        let key = (self.room_id.clone(), self.peer_id.clone());
        let mut severs = self.severs.lock();
        // A rejoin under the same id may already own the slot
        if severs.get(&key).map(|(token, _)| *token) == Some(self.token) {
            severs.remove(&key);
        }
    }
}

async fn pump_memory(
    membership: MemoryMembership,
    mut outbox: mpsc::UnboundedReceiver<SignalingMessage>,
    mut commands: mpsc::UnboundedReceiver<RelayCommand>,
    events: mpsc::UnboundedSender<RelayEvent>,
    mut kill: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(msg) = outbox.recv() => {
                if let Some(event) = relay_event_from(msg) {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(RelayCommand::Signal { target, kind, payload }) => {
                        if let Err(e) = membership
                            .registry
                            .forward(&membership.room_id, &membership.address, &target, kind, payload)
                            .await
                        {
                            debug!("Signal from {} dropped: {}", membership.peer_id, e);
                        }
                    }
                    Some(RelayCommand::Chat(message)) => {
                        membership
                            .registry
                            .broadcast_chat(&membership.room_id, &membership.address, message)
                            .await;
                    }
                    Some(RelayCommand::Leave) | None => break,
                }
            }

            Ok(()) = &mut kill => {
                debug!("Relay link for {} severed", membership.peer_id);
                membership.leave().await;
                let _ = events.send(RelayEvent::Closed("relay link severed".to_string()));
                return;
            }
        }
    }

    membership.leave().await;
}

/// Simulated network shared by every memory connector in a test
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_link: u64,
    links: HashMap<u64, LinkSlot>,
    hold_channels: bool,
    /// (local, remote) pairs whose link allocation fails
    failures: HashSet<(String, String)>,
}

struct LinkSlot {
    owner: String,
    remote: String,
    events: LinkEventSender,
    partner: Option<u64>,
    local_description: bool,
    remote_description: bool,
    remote_candidates: usize,
    open: bool,
    closed: bool,
}

impl LinkSlot {
    fn ready(&self) -> bool {
        !self.closed && self.local_description && self.remote_description && self.remote_candidates > 0
    }
}

impl NetworkState {
    /// Open both ends of a link pair if both are ready
    ///
    /// Returns the event sinks to notify once the lock is released.
    fn try_open(&mut self, id: u64) -> Vec<LinkEventSender> {
        if self.hold_channels {
            return Vec::new();
        }
        let Some(partner) = self.links.get(&id).and_then(|slot| slot.partner) else {
            return Vec::new();
        };

        let both_ready = [id, partner].iter().all(|link| {
            self.links
                .get(link)
                .map(|slot| slot.ready() && !slot.open)
                .unwrap_or(false)
        });
        if !both_ready {
            return Vec::new();
        }

        let mut sinks = Vec::new();
        for link in [id, partner] {
            if let Some(slot) = self.links.get_mut(&link) {
                slot.open = true;
                sinks.push(slot.events.clone());
            }
        }
        sinks
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector allocating links owned by `local_peer_id`
    pub fn connector(&self, local_peer_id: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local_peer_id: local_peer_id.into(),
        }
    }

    /// Keep channels from opening while set
    pub fn hold_channels(&self, hold: bool) {
        self.inner.lock().hold_channels = hold;
    }

    /// Make link allocation from `local` toward `remote` fail
    pub fn inject_failure(&self, local: &str, remote: &str) {
        self.inner
            .lock()
            .failures
            .insert((local.to_string(), remote.to_string()));
    }

    /// Report an ICE failure on `owner`'s link toward `remote`
    pub fn break_link(&self, owner: &str, remote: &str) -> bool {
        let sinks: Vec<LinkEventSender> = {
            let state = self.inner.lock();
            state
                .links
                .values()
                .filter(|slot| slot.owner == owner && slot.remote == remote && !slot.closed)
                .map(|slot| slot.events.clone())
                .collect()
        };
        for sink in &sinks {
            sink.send(LinkEvent::Failed("ICE connection failed".to_string()));
        }
        !sinks.is_empty()
    }

    /// Links owned by `peer_id` that have not been closed
    pub fn live_links(&self, peer_id: &str) -> usize {
        self.inner
            .lock()
            .links
            .values()
            .filter(|slot| slot.owner == peer_id && !slot.closed)
            .count()
    }

    /// Open links owned by `peer_id`
    pub fn open_links(&self, peer_id: &str) -> usize {
        self.inner
            .lock()
            .links
            .values()
            .filter(|slot| slot.owner == peer_id && slot.open && !slot.closed)
            .count()
    }
}

/// Allocates memory links for one local peer
#[derive(Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    local_peer_id: String,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create_link(
        &self,
        remote_peer_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NetworkError> {
        let mut state = self.network.inner.lock();
        if state
            .failures
            .contains(&(self.local_peer_id.clone(), remote_peer_id.to_string()))
        {
            return Err(NetworkError::NegotiationFailed(format!(
                "cannot allocate link to {}",
                remote_peer_id
            )));
        }

        state.next_link += 1;
        let id = state.next_link;
        state.links.insert(
            id,
            LinkSlot {
                owner: self.local_peer_id.clone(),
                remote: remote_peer_id.to_string(),
                events,
                partner: None,
                local_description: false,
                remote_description: false,
                remote_candidates: 0,
                open: false,
                closed: false,
            },
        );
        trace!("Memory link {} {} -> {}", id, self.local_peer_id, remote_peer_id);

        Ok(Arc::new(MemoryLink {
            id,
            network: self.network.clone(),
        }))
    }
}

/// One end of a simulated peer connection
pub struct MemoryLink {
    id: u64,
    network: MemoryNetwork,
}

impl MemoryLink {
    fn parse_sdp(sdp: &str, prefix: &str) -> Result<u64, NetworkError> {
        sdp.strip_prefix(prefix)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| NetworkError::NegotiationFailed(format!("malformed description: {}", sdp)))
    }

    /// Mark the local description set and announce a host candidate
    fn set_local_description(&self, state: &mut NetworkState) -> Result<LinkEventSender, NetworkError> {
        let slot = state
            .links
            .get_mut(&self.id)
            .filter(|slot| !slot.closed)
            .ok_or(NetworkError::ChannelClosed)?;
        slot.local_description = true;
        Ok(slot.events.clone())
    }

    fn candidate(&self) -> LinkEvent {
        LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", self.id, 40000 + self.id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        })
    }

    fn notify(sinks: Vec<LinkEventSender>, event: LinkEvent) {
        for sink in sinks {
            sink.send(event.clone());
        }
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&self) -> Result<String, NetworkError> {
        let sink = {
            let mut state = self.network.inner.lock();
            self.set_local_description(&mut state)?
        };
        sink.send(self.candidate());
        Ok(format!("{}{}", OFFER_PREFIX, self.id))
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, NetworkError> {
        let offerer = Self::parse_sdp(offer_sdp, OFFER_PREFIX)?;
        let (sink, opened) = {
            let mut state = self.network.inner.lock();
            if !state.links.contains_key(&offerer) {
                return Err(NetworkError::NegotiationFailed(format!(
                    "unknown offer {}",
                    offer_sdp
                )));
            }
            let slot = state
                .links
                .get_mut(&self.id)
                .filter(|slot| !slot.closed)
                .ok_or(NetworkError::ChannelClosed)?;
            slot.remote_description = true;
            slot.partner = Some(offerer);
            let sink = self.set_local_description(&mut state)?;
            (sink, state.try_open(self.id))
        };
        sink.send(self.candidate());
        Self::notify(opened, LinkEvent::ChannelOpen);
        Ok(format!("{}{}", ANSWER_PREFIX, self.id))
    }

    async fn accept_answer(&self, answer_sdp: &str) -> Result<(), NetworkError> {
        let answerer = Self::parse_sdp(answer_sdp, ANSWER_PREFIX)?;
        let opened = {
            let mut state = self.network.inner.lock();
            let slot = state
                .links
                .get_mut(&self.id)
                .filter(|slot| !slot.closed)
                .ok_or(NetworkError::ChannelClosed)?;
            if !slot.local_description {
                return Err(NetworkError::NegotiationFailed(
                    "answer without local offer".to_string(),
                ));
            }
            slot.remote_description = true;
            slot.partner = Some(answerer);
            state.try_open(self.id)
        };
        Self::notify(opened, LinkEvent::ChannelOpen);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NetworkError> {
        let opened = {
            let mut state = self.network.inner.lock();
            let slot = state
                .links
                .get_mut(&self.id)
                .filter(|slot| !slot.closed)
                .ok_or(NetworkError::ChannelClosed)?;
            if !slot.remote_description {
                return Err(NetworkError::NegotiationFailed(format!(
                    "candidate before remote description: {}",
                    candidate.candidate
                )));
            }
            slot.remote_candidates += 1;
            state.try_open(self.id)
        };
        Self::notify(opened, LinkEvent::ChannelOpen);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), NetworkError> {
        let sink = {
            let state = self.network.inner.lock();
            let slot = state
                .links
                .get(&self.id)
                .filter(|slot| slot.open && !slot.closed)
                .ok_or(NetworkError::ChannelClosed)?;
            slot.partner
                .and_then(|partner| state.links.get(&partner))
                .filter(|remote| remote.open && !remote.closed)
                .map(|remote| remote.events.clone())
                .ok_or(NetworkError::ChannelClosed)?
        };
        sink.send(LinkEvent::Message(text));
        Ok(())
    }

    async fn close(&self) {
        let sink = {
            let mut state = self.network.inner.lock();
            let Some(slot) = state.links.get_mut(&self.id) else {
                return;
            };
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.open = false;
            let partner = slot.partner;

            // The remote end sees its channel close
            partner.and_then(|id| state.links.get_mut(&id)).and_then(|remote| {
                if remote.closed {
                    return None;
                }
                let was_open = remote.open;
                remote.open = false;
                was_open.then(|| remote.events.clone())
            })
        };
        if let Some(sink) = sink {
            sink.send(LinkEvent::ChannelClosed);
        }
        trace!("Memory link {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("sender dropped")
    }

    #[tokio::test]
    async fn test_handshake_opens_both_ends() {
        let network = MemoryNetwork::new();
        let (tx_a, mut rx_a) = LinkEventSender::channel();
        let (tx_b, mut rx_b) = LinkEventSender::channel();
        let a = network.connector("a").create_link("b", tx_a).await.unwrap();
        let b = network.connector("b").create_link("a", tx_b).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let LinkEvent::LocalCandidate(cand_a) = next_event(&mut rx_a).await else {
            panic!("expected candidate");
        };

        // Candidate before any remote description is refused
        assert!(b.add_ice_candidate(cand_a.clone()).await.is_err());

        let answer = b.accept_offer(&offer).await.unwrap();
        let LinkEvent::LocalCandidate(cand_b) = next_event(&mut rx_b).await else {
            panic!("expected candidate");
        };
        a.accept_answer(&answer).await.unwrap();
        a.add_ice_candidate(cand_b).await.unwrap();
        b.add_ice_candidate(cand_a).await.unwrap();

        assert_eq!(next_event(&mut rx_a).await, LinkEvent::ChannelOpen);
        assert_eq!(next_event(&mut rx_b).await, LinkEvent::ChannelOpen);
        assert_eq!(network.open_links("a"), 1);

        a.send("ping".to_string()).await.unwrap();
        assert_eq!(next_event(&mut rx_b).await, LinkEvent::Message("ping".to_string()));

        a.close().await;
        assert_eq!(next_event(&mut rx_b).await, LinkEvent::ChannelClosed);
        assert_eq!(network.live_links("a"), 0);
        assert_eq!(network.live_links("b"), 1);
        assert!(b.send("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_allocation_failure() {
        let network = MemoryNetwork::new();
        network.inject_failure("a", "b");
        let (tx, _rx) = LinkEventSender::channel();
        assert!(network.connector("a").create_link("b", tx.clone()).await.is_err());
        assert!(network.connector("a").create_link("c", tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_relay_round_trip() {
        let relay = MemoryRelay::new();
        let mut first = relay.join("room", "p1", "Alice").await.unwrap();
        let second = relay.join("room", "p2", "Bob").await.unwrap();
        assert!(first.roster.is_empty());
        assert_eq!(second.roster[0].peer_id, "p1");

        match timeout(Duration::from_secs(1), first.events.recv()).await.unwrap() {
            Some(RelayEvent::PeerJoined(peer)) => assert_eq!(peer.peer_id, "p2"),
            other => panic!("unexpected {:?}", other),
        }

        second
            .outbound
            .send(RelayCommand::Signal {
                target: first.local_address.clone(),
                kind: crate::network::SignalKind::Offer,
                payload: "sdp".to_string(),
            })
            .unwrap();
        match timeout(Duration::from_secs(1), first.events.recv()).await.unwrap() {
            Some(RelayEvent::Signal { from, payload, .. }) => {
                assert_eq!(from, second.local_address);
                assert_eq!(payload, "sdp");
            }
            other => panic!("unexpected {:?}", other),
        }

        drop(second);
        match timeout(Duration::from_secs(1), first.events.recv()).await.unwrap() {
            Some(RelayEvent::PeerLeft { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sever_closes_link() {
        let relay = MemoryRelay::new();
        let mut link = relay.join("room", "p1", "Alice").await.unwrap();
        assert!(relay.sever("room", "p1"));

        match timeout(Duration::from_secs(1), link.events.recv()).await.unwrap() {
            Some(RelayEvent::Closed(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(relay.registry().peer_count("room").await, 0);

        relay.set_available(false);
        assert!(matches!(
            relay.join("room", "p1", "Alice").await,
            Err(NetworkError::SignalingUnavailable(_))
        ));
    }
}
