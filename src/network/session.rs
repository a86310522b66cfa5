//! Session coordinator for mesh chat rooms
//!
//! One coordinator task owns a session: the relay link, every
//! [`PeerConnectionRecord`], the [`PresenceTracker`] and the
//! [`MessageRouter`]. Relay events, link events, negotiation results and API
//! calls are all funneled through one queue and handled one at a time, so no
//! handler ever observes another half-way through.
//!
//! Negotiation steps that suspend (link allocation, SDP generation,
//! applying descriptions and candidates) run in their own tasks and post
//! their result back tagged with the record's generation. Results for a
//! record that no longer exists, or for an older record of the same peer, are
//! discarded and any link they carry is closed.
//!
//! Roles: a member already in the room initiates toward anyone who joins
//! later; a newcomer answers the members it finds in the join roster.
//!
//! An open channel outlives relay membership: `peer-left` for an open peer
//! only detaches its record, which is dropped when the channel ends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ChatConfig, ReconnectPolicy};
use crate::protocol::{ChatMessage, MessageKind};

use super::connection::{ConnectionState, NegotiationRole, PeerConnectionRecord};
use super::error::{NetworkError, TransportFault};
use super::link::{IceCandidate, LinkEvent, LinkEventSender, PeerConnector, PeerLink};
use super::messenger::{self, ChannelUpdate};
use super::presence::PresenceTracker;
use super::router::{MessageRouter, DEFAULT_HISTORY_CAPACITY};
use super::signaling::{PeerInfo, RelayCommand, RelayEvent, RelayLink, SignalKind, SignalingRelay};
use super::transport::ChatEvent;

/// Default time a peer may spend negotiating before it is marked failed
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Messages kept in the local history buffer
    pub history_capacity: usize,
    /// Deadline for a record to reach `open`; zero disables it
    pub negotiation_timeout: Duration,
    /// Relay reconnection, disabled by default
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl From<&ChatConfig> for SessionConfig {
    fn from(config: &ChatConfig) -> Self {
        Self {
            history_capacity: config.history_capacity,
            negotiation_timeout: Duration::from_millis(config.negotiation_timeout_ms),
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Identity of a joined session
///
/// Fixed for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub room_id: String,
    pub local_peer_id: String,
    pub display_name: String,
    /// The room was empty when the local peer joined
    pub is_host: bool,
}

/// Result of a suspended negotiation step
enum Negotiation {
    /// Link allocated; initiators also carry their offer
    Allocated {
        link: Arc<dyn PeerLink>,
        offer: Option<String>,
    },
    /// Remote description applied; responders also carry their answer
    RemoteApplied { answer: Option<String> },
    Failed(String),
    Deadline,
}

enum Command {
    Send {
        body: String,
        kind: MessageKind,
        reply: oneshot::Sender<ChatMessage>,
    },
    ConnectedPeers(oneshot::Sender<Vec<String>>),
    PeerStates(oneshot::Sender<Vec<(String, ConnectionState)>>),
    History(oneshot::Sender<Vec<ChatMessage>>),
    Shutdown(Option<oneshot::Sender<()>>),
}

enum SessionEvent {
    Link {
        peer_id: String,
        generation: u64,
        event: LinkEvent,
    },
    Negotiation {
        peer_id: String,
        generation: u64,
        outcome: Negotiation,
    },
    RelayRestored(RelayLink),
    ReconnectExhausted(u32),
    Command(Command),
}

/// Posts into a session queue until the session closes
#[derive(Clone)]
struct EventPoster {
    tx: mpsc::UnboundedSender<SessionEvent>,
    closed: Arc<AtomicBool>,
}

impl EventPoster {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn post(&self, event: SessionEvent) -> bool {
        !self.is_closed() && self.tx.send(event).is_ok()
    }

    /// Post a negotiation result; a link nobody will own is closed here
    async fn post_outcome(&self, peer_id: String, generation: u64, outcome: Negotiation) {
        let event = SessionEvent::Negotiation {
            peer_id,
            generation,
            outcome,
        };
        let rejected = if self.is_closed() {
            Some(event)
        } else {
            self.tx.send(event).err().map(|e| e.0)
        };

        if let Some(SessionEvent::Negotiation {
            peer_id,
            outcome: Negotiation::Allocated { link, .. },
            ..
        }) = rejected
        {
            debug!("Session closed, releasing link to {}", peer_id);
            link.close().await;
        }
    }
}

fn dispose(link: Arc<dyn PeerLink>) {
    tokio::spawn(async move {
        link.close().await;
    });
}

/// Owns the state of one joined room
pub struct SessionCoordinator {
    session: Session,
    config: SessionConfig,
    relay: Arc<dyn SignalingRelay>,
    connector: Arc<dyn PeerConnector>,
    relay_out: Option<mpsc::UnboundedSender<RelayCommand>>,
    local_address: String,
    records: HashMap<String, PeerConnectionRecord>,
    presence: PresenceTracker,
    router: MessageRouter,
    events: mpsc::UnboundedSender<ChatEvent>,
    poster: EventPoster,
    next_generation: u64,
}

impl SessionCoordinator {
    /// Join a room and start coordinating it
    ///
    /// Fails with `SignalingUnavailable` if the relay cannot be reached.
    pub async fn start(
        relay: Arc<dyn SignalingRelay>,
        connector: Arc<dyn PeerConnector>,
        room_id: &str,
        local_peer_id: &str,
        display_name: &str,
        config: SessionConfig,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<SessionHandle, NetworkError> {
        if room_id.is_empty() || local_peer_id.is_empty() {
            return Err(NetworkError::InvalidMessage(
                "room id and peer id must not be empty".to_string(),
            ));
        }

        let link = relay
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
            is_host: link.roster.is_empty(),
        };
        info!(
            "Joined room {} as {} (host: {}, {} peer(s) present)",
            session.room_id,
            session.local_peer_id,
            session.is_host,
            link.roster.len()
        );

        let (tx, queue) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let router = MessageRouter::new(
            local_peer_id,
            display_name,
            config.history_capacity,
            events.clone(),
        );

        let RelayLink {
            local_address,
            roster,
            outbound,
            events: relay_events,
        } = link;

        let mut coordinator = SessionCoordinator {
            session: session.clone(),
            config,
            relay,
            connector,
            relay_out: Some(outbound),
            local_address,
            records: HashMap::new(),
            presence: PresenceTracker::new(),
            router,
            events,
            poster: EventPoster {
                tx: tx.clone(),
                closed: closed.clone(),
            },
            next_generation: 0,
        };

        for peer in roster {
            coordinator.open_record(peer, NegotiationRole::Responder);
        }

        let task = tokio::spawn(coordinator.run(queue, Some(relay_events)));

        Ok(SessionHandle {
            session,
            tx,
            closed,
            task: Some(task),
        })
    }

    async fn run(
        mut self,
        mut queue: mpsc::UnboundedReceiver<SessionEvent>,
        mut relay_events: Option<mpsc::UnboundedReceiver<RelayEvent>>,
    ) {
        loop {
            tokio::select! {
                event = queue.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event, &mut relay_events).await {
                        break;
                    }
                }

                relay_event = async {
                    if let Some(ref mut rx) = relay_events {
                        rx.recv().await
                    } else {
                        std::future::pending::<Option<RelayEvent>>().await
                    }
                } => {
                    match relay_event {
                        Some(RelayEvent::Closed(reason)) => self.relay_lost(reason, &mut relay_events),
                        Some(event) => self.on_relay_event(event),
                        None => self.relay_lost("relay link closed".to_string(), &mut relay_events),
                    }
                }
            }
        }

        debug!("Session {} stopped", self.session.room_id);
    }

    /// Returns false once the session should stop
    async fn handle_event(
        &mut self,
        event: SessionEvent,
        relay_events: &mut Option<mpsc::UnboundedReceiver<RelayEvent>>,
    ) -> bool {
        match event {
            SessionEvent::Link {
                peer_id,
                generation,
                event,
            } => self.on_link_event(peer_id, generation, event),
            SessionEvent::Negotiation {
                peer_id,
                generation,
                outcome,
            } => self.on_negotiation(peer_id, generation, outcome),
            SessionEvent::RelayRestored(link) => self.relay_restored(link, relay_events),
            SessionEvent::ReconnectExhausted(attempts) => {
                warn!("Gave up reconnecting to relay after {} attempt(s)", attempts);
                self.emit(ChatEvent::Error(TransportFault::SignalingUnavailable(
                    format!("gave up reconnecting after {} attempt(s)", attempts),
                )));
            }
            SessionEvent::Command(Command::Shutdown(reply)) => {
                self.shutdown().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return false;
            }
            SessionEvent::Command(command) => self.on_command(command),
        }
        true
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { body, kind, reply } => {
                let (message, _) = self.router.broadcast(body, kind, self.records.values());
                let _ = reply.send(message);
            }
            Command::ConnectedPeers(reply) => {
                let _ = reply.send(self.presence.peers());
            }
            Command::PeerStates(reply) => {
                let mut states: Vec<(String, ConnectionState)> = self
                    .records
                    .values()
                    .map(|r| (r.peer_id.clone(), r.state()))
                    .collect();
                states.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = reply.send(states);
            }
            Command::History(reply) => {
                let _ = reply.send(self.router.history());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::PeerJoined(peer) => self.on_peer_joined(peer),
            RelayEvent::PeerLeft { signaling_address } => {
                match self.peer_for_address(&signaling_address) {
                    Some(peer_id) => self.peer_left_relay(&peer_id),
                    None => debug!("peer-left for unknown address {}", signaling_address),
                }
            }
            RelayEvent::Signal {
                from,
                kind,
                payload,
            } => self.on_signal(from, kind, payload),
            RelayEvent::Chat(message) => {
                trace!("Ignoring relayed chat {} on mesh session", message.id);
            }
            RelayEvent::Closed(_) => {}
        }
    }

    fn on_peer_joined(&mut self, peer: PeerInfo) {
        if peer.peer_id == self.session.local_peer_id {
            return;
        }

        if let Some(existing) = self.records.get_mut(&peer.peer_id) {
            if existing.state() == ConnectionState::Open {
                info!("Peer {} is back on the relay", peer.peer_id);
                existing.reattach(peer.signaling_address);
                return;
            }
            if !existing.state().is_terminal() {
                warn!(
                    "Rejecting duplicate peer-joined for {} ({})",
                    peer.peer_id,
                    existing.state()
                );
                return;
            }
            self.drop_record(&peer.peer_id);
        }

        info!("Peer {} ({}) joined", peer.peer_id, peer.display_name);
        self.open_record(peer, NegotiationRole::Initiator);
    }

    fn on_signal(&mut self, from: String, kind: SignalKind, payload: String) {
        let Some(peer_id) = self.peer_for_address(&from) else {
            debug!("Dropping {} from unknown address {}", kind, from);
            return;
        };

        match kind {
            SignalKind::Offer => self.on_offer(peer_id, payload),
            SignalKind::Answer => self.on_answer(peer_id, payload),
            SignalKind::IceCandidate => self.on_remote_candidate(peer_id, payload),
        }
    }

    fn on_offer(&mut self, peer_id: String, offer: String) {
        let Some(record) = self.records.get_mut(&peer_id) else {
            return;
        };

        // A fresh offer for a finished negotiation restarts the peer
        if record.remote_description_set() || record.state().is_terminal() {
            info!("Peer {} renegotiating", peer_id);
            let peer = PeerInfo {
                peer_id: record.peer_id.clone(),
                display_name: record.display_name.clone(),
                signaling_address: record.signaling_address.clone(),
            };
            self.drop_record(&peer_id);
            self.open_record(peer, NegotiationRole::Responder);
            if let Some(record) = self.records.get_mut(&peer_id) {
                record.set_pending_offer(offer);
            }
            return;
        }

        if record.is_initiator() {
            warn!("Ignoring offer from {}: local side initiates", peer_id);
            return;
        }

        match record.link().cloned() {
            Some(link) => {
                let generation = record.generation;
                self.spawn_accept_offer(peer_id, generation, link, offer);
            }
            None => {
                trace!("Holding offer from {} until link is allocated", peer_id);
                record.set_pending_offer(offer);
            }
        }
    }

    fn on_answer(&mut self, peer_id: String, answer: String) {
        let Some(record) = self.records.get(&peer_id) else {
            return;
        };
        if !record.is_initiator() || record.remote_description_set() || record.state().is_terminal()
        {
            debug!("Ignoring unexpected answer from {}", peer_id);
            return;
        }
        let Some(link) = record.link().cloned() else {
            warn!("Answer from {} before local offer", peer_id);
            return;
        };

        let generation = record.generation;
        let poster = self.poster.clone();
        tokio::spawn(async move {
            let outcome = match link.accept_answer(&answer).await {
                Ok(()) => Negotiation::RemoteApplied { answer: None },
                Err(e) => Negotiation::Failed(e.to_string()),
            };
            poster.post_outcome(peer_id, generation, outcome).await;
        });
    }

    fn on_remote_candidate(&mut self, peer_id: String, payload: String) {
        let candidate: IceCandidate = match serde_json::from_str(&payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Malformed candidate from {}: {}", peer_id, e);
                return;
            }
        };
        let Some(record) = self.records.get_mut(&peer_id) else {
            return;
        };
        if record.state().is_terminal() {
            return;
        }

        match record.link().cloned() {
            Some(link) if record.accepts_candidates() => {
                spawn_add_candidates(peer_id, link, vec![candidate]);
            }
            _ => {
                record.queue_candidate(candidate);
                trace!(
                    "Queued candidate from {} ({} pending)",
                    peer_id,
                    record.pending_candidate_count()
                );
            }
        }
    }

    fn on_negotiation(&mut self, peer_id: String, generation: u64, outcome: Negotiation) {
        let live = self
            .records
            .get(&peer_id)
            .map(|r| r.generation == generation && !r.state().is_terminal())
            .unwrap_or(false);
        if !live {
            trace!("Discarding stale negotiation result for {}", peer_id);
            if let Negotiation::Allocated { link, .. } = outcome {
                dispose(link);
            }
            return;
        }

        match outcome {
            Negotiation::Allocated { link, offer } => self.link_allocated(peer_id, link, offer),
            Negotiation::RemoteApplied { answer } => self.remote_applied(peer_id, answer),
            Negotiation::Failed(reason) => {
                warn!("Negotiation with {} failed: {}", peer_id, reason);
                self.fail_record(
                    &peer_id,
                    TransportFault::NegotiationFailed {
                        peer_id: peer_id.clone(),
                        reason,
                    },
                );
            }
            Negotiation::Deadline => {
                let pending_for = self
                    .records
                    .get(&peer_id)
                    .filter(|r| r.state().is_negotiating())
                    .map(|r| r.age());
                if let Some(elapsed) = pending_for {
                    warn!("Negotiation with {} timed out after {:?}", peer_id, elapsed);
                    self.fail_record(
                        &peer_id,
                        TransportFault::NegotiationFailed {
                            peer_id: peer_id.clone(),
                            reason: "negotiation timed out".to_string(),
                        },
                    );
                }
            }
        }
    }

    fn link_allocated(&mut self, peer_id: String, link: Arc<dyn PeerLink>, offer: Option<String>) {
        let Some(record) = self.records.get_mut(&peer_id) else {
            dispose(link);
            return;
        };
        record.attach_link(link.clone());
        record.bind_channel(messenger::bind(link.clone(), &peer_id));
        let generation = record.generation;
        let target = record.signaling_address.clone();
        let pending_offer = record.take_pending_offer();

        if let Some(offer) = offer {
            debug!("Sending offer to {}", peer_id);
            self.signal(&target, SignalKind::Offer, offer);
        } else if let Some(remote_offer) = pending_offer {
            self.spawn_accept_offer(peer_id, generation, link, remote_offer);
        }
    }

    fn remote_applied(&mut self, peer_id: String, answer: Option<String>) {
        let Some(record) = self.records.get_mut(&peer_id) else {
            return;
        };
        let flushed = record.mark_remote_description_set();
        record.transition(ConnectionState::Connecting);
        let target = record.signaling_address.clone();
        let link = record.link().cloned();

        if let Some(answer) = answer {
            debug!("Sending answer to {}", peer_id);
            self.signal(&target, SignalKind::Answer, answer);
        }
        if let Some(link) = link {
            if !flushed.is_empty() {
                debug!("Applying {} queued candidate(s) for {}", flushed.len(), peer_id);
                spawn_add_candidates(peer_id, link, flushed);
            }
        }
    }

    fn on_link_event(&mut self, peer_id: String, generation: u64, event: LinkEvent) {
        let Some(record) = self
            .records
            .get_mut(&peer_id)
            .filter(|r| r.generation == generation)
        else {
            trace!("Dropping link event for stale record {}", peer_id);
            return;
        };

        if let LinkEvent::LocalCandidate(candidate) = event {
            if record.state().is_terminal() {
                return;
            }
            let target = record.signaling_address.clone();
            match serde_json::to_string(&candidate) {
                Ok(payload) => self.signal(&target, SignalKind::IceCandidate, payload),
                Err(e) => warn!("Failed to encode candidate: {}", e),
            }
            return;
        }

        let was_open = record.state() == ConnectionState::Open;
        let update = messenger::on_channel_event(record, event);
        let open_for = record.open_duration();
        match update {
            ChannelUpdate::Opened => {
                info!("Channel to {} open", peer_id);
                if self.presence.join(&peer_id) {
                    self.emit(ChatEvent::PeerConnected(peer_id));
                }
            }
            ChannelUpdate::Delivered(message) => {
                self.router.inbound(message);
            }
            ChannelUpdate::Closed => {
                match open_for {
                    Some(elapsed) => info!("Channel to {} closed after {:?}", peer_id, elapsed),
                    None => info!("Channel to {} closed", peer_id),
                }
                self.release(&peer_id, None);
                self.forget_if_detached(&peer_id);
            }
            ChannelUpdate::Failed(reason) => {
                warn!("Link to {} failed: {}", peer_id, reason);
                let fault = if was_open {
                    TransportFault::ChannelFailed {
                        peer_id: peer_id.clone(),
                        reason,
                    }
                } else {
                    TransportFault::NegotiationFailed {
                        peer_id: peer_id.clone(),
                        reason,
                    }
                };
                self.release(&peer_id, Some(fault));
                self.forget_if_detached(&peer_id);
            }
            ChannelUpdate::Ignored => {}
        }
    }

    fn relay_lost(
        &mut self,
        reason: String,
        relay_events: &mut Option<mpsc::UnboundedReceiver<RelayEvent>>,
    ) {
        if relay_events.take().is_none() && self.relay_out.is_none() {
            return;
        }
        self.relay_out = None;

        warn!("Relay unavailable: {}", reason);
        self.emit(ChatEvent::Error(TransportFault::SignalingUnavailable(reason)));

        if self.config.reconnect.enabled {
            self.spawn_reconnect();
        }
    }

    fn relay_restored(
        &mut self,
        link: RelayLink,
        relay_events: &mut Option<mpsc::UnboundedReceiver<RelayEvent>>,
    ) {
        let RelayLink {
            local_address,
            roster,
            outbound,
            events,
        } = link;

        info!(
            "Relay restored as {} ({} peer(s) present)",
            local_address,
            roster.len()
        );
        self.local_address = local_address;
        self.relay_out = Some(outbound);
        *relay_events = Some(events);

        let present: HashSet<String> = roster.iter().map(|p| p.peer_id.clone()).collect();
        let departed: Vec<String> = self
            .records
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for peer_id in departed {
            self.peer_left_relay(&peer_id);
        }

        for peer in roster {
            match self.records.get_mut(&peer.peer_id) {
                Some(record) if !record.state().is_terminal() => {
                    record.reattach(peer.signaling_address);
                }
                Some(_) => {
                    self.drop_record(&peer.peer_id);
                    self.open_record(peer, NegotiationRole::Responder);
                }
                None => self.open_record(peer, NegotiationRole::Responder),
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Leaving room {}", self.session.room_id);
        self.poster.closed.store(true, Ordering::SeqCst);

        for (_, mut record) in self.records.drain() {
            record.transition(ConnectionState::Closed);
            if let Some(link) = record.take_link() {
                link.close().await;
            }
        }
        self.presence.clear();

        if let Some(outbound) = self.relay_out.take() {
            let _ = outbound.send(RelayCommand::Leave);
        }
    }

    /// Create a record and start allocating its link
    fn open_record(&mut self, peer: PeerInfo, role: NegotiationRole) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let mut record = PeerConnectionRecord::new(
            &peer.peer_id,
            &peer.display_name,
            &peer.signaling_address,
            role,
            generation,
        );
        record.transition(ConnectionState::Negotiating);
        self.records.insert(peer.peer_id.clone(), record);

        self.spawn_allocation(peer.peer_id.clone(), generation, role);
        self.spawn_deadline(peer.peer_id, generation);
    }

    /// The relay no longer has the peer
    ///
    /// An open channel outlives the relay membership: the record is kept,
    /// detached, until the channel itself ends. Anything else is dropped.
    fn peer_left_relay(&mut self, peer_id: &str) {
        let open = self
            .records
            .get(peer_id)
            .map(|r| r.state() == ConnectionState::Open)
            .unwrap_or(false);
        if !open {
            info!("Peer {} left", peer_id);
            self.drop_record(peer_id);
            return;
        }

        info!("Peer {} left the relay, keeping its open channel", peer_id);
        if let Some(record) = self.records.get_mut(peer_id) {
            record.detach();
        }
    }

    fn forget_if_detached(&mut self, peer_id: &str) {
        if self
            .records
            .get(peer_id)
            .map(|r| r.is_detached())
            .unwrap_or(false)
        {
            debug!("Forgetting {}, no longer on the relay", peer_id);
            self.drop_record(peer_id);
        }
    }

    /// Remove a record, closing its link
    fn drop_record(&mut self, peer_id: &str) {
        if let Some(mut record) = self.records.remove(peer_id) {
            record.transition(ConnectionState::Closed);
            if let Some(link) = record.take_link() {
                dispose(link);
            }
        }
        if self.presence.leave(peer_id) {
            self.emit(ChatEvent::PeerDisconnected(peer_id.to_string()));
        }
    }

    /// Move a record to `failed` and report the fault
    fn fail_record(&mut self, peer_id: &str, fault: TransportFault) {
        let failed = self
            .records
            .get_mut(peer_id)
            .map(|r| r.transition(ConnectionState::Failed))
            .unwrap_or(false);
        if failed {
            self.release(peer_id, Some(fault));
        }
    }

    /// Close a terminal record's link and drop the peer from presence
    fn release(&mut self, peer_id: &str, fault: Option<TransportFault>) {
        if let Some(link) = self.records.get_mut(peer_id).and_then(|r| r.take_link()) {
            dispose(link);
        }
        if let Some(fault) = fault {
            self.emit(ChatEvent::Error(fault));
        }
        if self.presence.leave(peer_id) {
            self.emit(ChatEvent::PeerDisconnected(peer_id.to_string()));
        }
    }

    fn peer_for_address(&self, address: &str) -> Option<String> {
        self.records
            .values()
            .find(|r| r.signaling_address == address)
            .map(|r| r.peer_id.clone())
    }

    fn signal(&self, target: &str, kind: SignalKind, payload: String) {
        let command = RelayCommand::Signal {
            target: target.to_string(),
            kind,
            payload,
        };
        match &self.relay_out {
            Some(outbound) if outbound.send(command).is_ok() => {
                trace!("{} -> {}: {}", self.local_address, target, kind);
            }
            _ => debug!("Relay unavailable, dropping {} for {}", kind, target),
        }
    }

    fn emit(&self, event: ChatEvent) {
        // The receiver may be gone if the application stopped listening
        let _ = self.events.send(event);
    }

    fn link_sink(&self, peer_id: &str, generation: u64) -> LinkEventSender {
        let poster = self.poster.clone();
        let peer_id = peer_id.to_string();
        LinkEventSender::new(move |event| {
            poster.post(SessionEvent::Link {
                peer_id: peer_id.clone(),
                generation,
                event,
            })
        })
    }

    fn spawn_allocation(&self, peer_id: String, generation: u64, role: NegotiationRole) {
        let connector = self.connector.clone();
        let poster = self.poster.clone();
        let sink = self.link_sink(&peer_id, generation);

        tokio::spawn(async move {
            let outcome = match connector.create_link(&peer_id, sink).await {
                Ok(link) => match role {
                    NegotiationRole::Initiator => match link.create_offer().await {
                        Ok(offer) => Negotiation::Allocated {
                            link,
                            offer: Some(offer),
                        },
                        Err(e) => {
                            link.close().await;
                            Negotiation::Failed(e.to_string())
                        }
                    },
                    NegotiationRole::Responder => Negotiation::Allocated { link, offer: None },
                },
                Err(e) => Negotiation::Failed(e.to_string()),
            };
            poster.post_outcome(peer_id, generation, outcome).await;
        });
    }

    fn spawn_accept_offer(
        &self,
        peer_id: String,
        generation: u64,
        link: Arc<dyn PeerLink>,
        offer: String,
    ) {
        let poster = self.poster.clone();
        tokio::spawn(async move {
            let outcome = match link.accept_offer(&offer).await {
                Ok(answer) => Negotiation::RemoteApplied {
                    answer: Some(answer),
                },
                Err(e) => Negotiation::Failed(e.to_string()),
            };
            poster.post_outcome(peer_id, generation, outcome).await;
        });
    }

    fn spawn_deadline(&self, peer_id: String, generation: u64) {
        let timeout = self.config.negotiation_timeout;
        if timeout.is_zero() {
            return;
        }
        let poster = self.poster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            poster
                .post_outcome(peer_id, generation, Negotiation::Deadline)
                .await;
        });
    }

    fn spawn_reconnect(&self) {
        let relay = self.relay.clone();
        let poster = self.poster.clone();
        let policy = self.config.reconnect.clone();
        let session = self.session.clone();

        tokio::spawn(async move {
            for attempt in 1..=policy.max_attempts {
                tokio::time::sleep(policy.delay_for(attempt)).await;
                if poster.is_closed() {
                    return;
                }

                match relay
                    .join(&session.room_id, &session.local_peer_id, &session.display_name)
                    .await
                {
                    Ok(link) => {
                        if poster.is_closed() {
                            let _ = link.outbound.send(RelayCommand::Leave);
                            return;
                        }
                        if let Err(e) = poster.tx.send(SessionEvent::RelayRestored(link)) {
                            if let SessionEvent::RelayRestored(link) = e.0 {
                                let _ = link.outbound.send(RelayCommand::Leave);
                            }
                        }
                        return;
                    }
                    Err(e) => debug!("Relay reconnect attempt {} failed: {}", attempt, e),
                }
            }
            poster.post(SessionEvent::ReconnectExhausted(policy.max_attempts));
        });
    }
}

fn spawn_add_candidates(peer_id: String, link: Arc<dyn PeerLink>, candidates: Vec<IceCandidate>) {
    tokio::spawn(async move {
        for candidate in candidates {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                debug!("Candidate for {} not applied: {}", peer_id, e);
            }
        }
    });
}

/// Handle to a running session
///
/// Dropping the handle leaves the room.
pub struct SessionHandle {
    session: Session,
    tx: mpsc::UnboundedSender<SessionEvent>,
    closed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Broadcast a message to every open channel
    ///
    /// The local echo has been delivered by the time this returns.
    pub async fn send(&self, body: String, kind: MessageKind) -> Result<ChatMessage, NetworkError> {
        self.request(|reply| Command::Send { body, kind, reply })
            .await
            .ok_or(NetworkError::NotConnected)
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        self.request(Command::ConnectedPeers)
            .await
            .unwrap_or_default()
    }

    pub async fn peer_states(&self) -> Vec<(String, ConnectionState)> {
        self.request(Command::PeerStates).await.unwrap_or_default()
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.request(Command::History).await.unwrap_or_default()
    }

    /// Close every peer link and leave the room
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(SessionEvent::Command(Command::Shutdown(Some(reply))))
            .is_ok()
        {
            let _ = done.await;
        }
        self.closed.store(true, Ordering::SeqCst);

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        if self.is_closed() {
            return None;
        }
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionEvent::Command(command(reply))).ok()?;
        rx.await.ok()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(SessionEvent::Command(Command::Shutdown(None)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_from_chat_config() {
        let mut chat = ChatConfig::default();
        chat.history_capacity = 7;
        chat.negotiation_timeout_ms = 1500;

        let config = SessionConfig::from(&chat);
        assert_eq!(config.history_capacity, 7);
        assert_eq!(config.negotiation_timeout, Duration::from_millis(1500));
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn test_default_session_config() {
        let config = SessionConfig::default();
        assert_eq!(config.history_capacity, DEFAULT_HISTORY_CAPACITY);
        assert_eq!(config.negotiation_timeout, DEFAULT_NEGOTIATION_TIMEOUT);
    }
}
