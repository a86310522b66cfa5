//! Per-peer connection records and the negotiation state machine

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::link::{IceCandidate, PeerLink};
use super::messenger::ChannelBinding;

/// Connection state
///
/// State machine for one remote peer's link.
///
/// ```text
/// [*] --> New
/// New --> Negotiating: record created, link allocation started
/// Negotiating --> Connecting: remote description applied
/// Connecting --> Open: data channel open
/// Negotiating --> Open: channel opened before the description outcome was processed
/// any --> Closed: peer left, channel closed, or session disconnected
/// any --> Failed: ICE, SDP or channel error
/// ```
///
/// `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New = 0,
    Negotiating = 1,
    Connecting = 2,
    Open = 3,
    Closed = 4,
    Failed = 5,
}

impl ConnectionState {
    /// Check if the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Check if negotiation is still in progress
    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::New | Self::Negotiating | Self::Connecting)
    }

    /// Check if the channel can carry messages
    pub fn can_transmit(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        (next as u8) > (*self as u8)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the offer/answer exchange the local peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Creates the data channel and sends the offer
    Initiator,
    /// Waits for the offer and answers it
    Responder,
}

/// State for one remote peer within a session
///
/// Created only in response to a `peer-joined` event; at most one record
/// exists per peer id.
pub struct PeerConnectionRecord {
    pub peer_id: String,
    pub display_name: String,
    pub signaling_address: String,
    pub role: NegotiationRole,
    /// Distinguishes this record's async continuations from those of an
    /// earlier record for the same peer id
    pub generation: u64,
    state: ConnectionState,
    link: Option<Arc<dyn PeerLink>>,
    binding: Option<ChannelBinding>,
    remote_description_set: bool,
    /// Remote candidates received before the remote description was applied
    pending_candidates: Vec<IceCandidate>,
    /// Remote offer received before the link was allocated
    pending_offer: Option<String>,
    /// The relay reported the peer gone while its channel stayed open
    detached: bool,
    created_at: Instant,
    opened_at: Option<Instant>,
}

impl PeerConnectionRecord {
    pub fn new(
        peer_id: impl Into<String>,
        display_name: impl Into<String>,
        signaling_address: impl Into<String>,
        role: NegotiationRole,
        generation: u64,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            signaling_address: signaling_address.into(),
            role,
            generation,
            state: ConnectionState::New,
            link: None,
            binding: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            pending_offer: None,
            detached: false,
            created_at: Instant::now(),
            opened_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`; illegal transitions are ignored and return false
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            trace!(
                "Peer {}: ignoring transition {} -> {}",
                self.peer_id,
                self.state,
                next
            );
            return false;
        }

        debug!("Peer {}: {} -> {}", self.peer_id, self.state, next);
        self.state = next;
        if next == ConnectionState::Open {
            self.opened_at = Some(Instant::now());
        }
        true
    }

    pub fn is_initiator(&self) -> bool {
        self.role == NegotiationRole::Initiator
    }

    pub fn attach_link(&mut self, link: Arc<dyn PeerLink>) {
        self.link = Some(link);
    }

    pub fn link(&self) -> Option<&Arc<dyn PeerLink>> {
        self.link.as_ref()
    }

    /// Detach the link and its channel binding so the caller can close them
    pub fn take_link(&mut self) -> Option<Arc<dyn PeerLink>> {
        self.binding = None;
        self.link.take()
    }

    pub fn bind_channel(&mut self, binding: ChannelBinding) {
        self.binding = Some(binding);
    }

    pub fn binding(&self) -> Option<&ChannelBinding> {
        self.binding.as_ref()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Check if remote candidates can be applied to the link right now
    pub fn accepts_candidates(&self) -> bool {
        self.remote_description_set && self.link.is_some()
    }

    /// Hold a remote candidate until the remote description is applied
    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Record that the remote description was applied and return the
    /// candidates that were held back, in arrival order
    pub fn mark_remote_description_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn set_pending_offer(&mut self, sdp: String) {
        self.pending_offer = Some(sdp);
    }

    pub fn take_pending_offer(&mut self) -> Option<String> {
        self.pending_offer.take()
    }

    /// Keep the record after the peer left the relay
    ///
    /// The record is dropped once its channel ends.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// The peer is back on the relay under a new address
    pub fn reattach(&mut self, signaling_address: impl Into<String>) {
        self.signaling_address = signaling_address.into();
        self.detached = false;
    }

    /// Time since the record was created
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Time since the channel opened
    pub fn open_duration(&self) -> Option<std::time::Duration> {
        self.opened_at.map(|at| at.elapsed())
    }
}

impl std::fmt::Debug for PeerConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionRecord")
            .field("peer_id", &self.peer_id)
            .field("signaling_address", &self.signaling_address)
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("has_link", &self.link.is_some())
            .field("pending_candidates", &self.pending_candidates.len())
            .field("detached", &self.detached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PeerConnectionRecord {
        PeerConnectionRecord::new("p2", "Bob", "addr-2", NegotiationRole::Initiator, 1)
    }

    #[test]
    fn test_forward_transitions() {
        let mut rec = record();
        assert_eq!(rec.state(), ConnectionState::New);
        assert!(rec.transition(ConnectionState::Negotiating));
        assert!(rec.transition(ConnectionState::Connecting));
        assert!(rec.transition(ConnectionState::Open));
        assert!(rec.open_duration().is_some());

        // No going back
        assert!(!rec.transition(ConnectionState::Connecting));
        assert_eq!(rec.state(), ConnectionState::Open);
    }

    #[test]
    fn test_open_may_skip_connecting() {
        let mut rec = record();
        rec.transition(ConnectionState::Negotiating);
        assert!(rec.transition(ConnectionState::Open));
        assert!(!rec.transition(ConnectionState::Connecting));
    }

    #[test]
    fn test_terminal_states_absorb() {
        let mut rec = record();
        rec.transition(ConnectionState::Negotiating);
        assert!(rec.transition(ConnectionState::Failed));
        assert!(!rec.transition(ConnectionState::Open));
        assert!(!rec.transition(ConnectionState::Closed));
        assert_eq!(rec.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_terminal_reachable_from_any_state() {
        for start in [
            ConnectionState::New,
            ConnectionState::Negotiating,
            ConnectionState::Connecting,
            ConnectionState::Open,
        ] {
            assert!(start.can_transition_to(ConnectionState::Closed));
            assert!(start.can_transition_to(ConnectionState::Failed));
        }
    }

    #[test]
    fn test_candidates_held_until_remote_description() {
        let mut rec = record();
        assert!(!rec.accepts_candidates());

        rec.queue_candidate(IceCandidate::new("c1"));
        rec.queue_candidate(IceCandidate::new("c2"));
        assert_eq!(rec.pending_candidate_count(), 2);

        let flushed = rec.mark_remote_description_set();
        assert_eq!(
            flushed,
            vec![IceCandidate::new("c1"), IceCandidate::new("c2")]
        );
        assert_eq!(rec.pending_candidate_count(), 0);
        assert!(rec.remote_description_set());
        // Still no link attached
        assert!(!rec.accepts_candidates());
    }

    #[test]
    fn test_pending_offer_taken_once() {
        let mut rec = record();
        rec.set_pending_offer("sdp".to_string());
        assert_eq!(rec.take_pending_offer().as_deref(), Some("sdp"));
        assert!(rec.take_pending_offer().is_none());
    }

    #[test]
    fn test_detach_and_reattach() {
        let mut rec = record();
        assert!(!rec.is_detached());

        rec.detach();
        assert!(rec.is_detached());

        rec.reattach("addr-9");
        assert!(!rec.is_detached());
        assert_eq!(rec.signaling_address, "addr-9");
    }
}
