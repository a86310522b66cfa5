//! Message routing between the application and peer channels
//!
//! Outbound: builds a [`ChatMessage`] from the local identity, echoes it to
//! the application, then fans it out to every open channel.
//! Inbound: hands remote messages to the application verbatim.
//!
//! Every message id is delivered to the application at most once.

use std::collections::{HashSet, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::{ChatMessage, MessageKind};

use super::connection::PeerConnectionRecord;
use super::messenger;
use super::transport::ChatEvent;

/// Default number of messages kept in the local history buffer
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Number of recent message ids remembered for duplicate suppression
const DELIVERED_ID_WINDOW: usize = 1024;

/// Routes chat messages for one session
pub struct MessageRouter {
    local_peer_id: String,
    display_name: String,
    events: mpsc::UnboundedSender<ChatEvent>,
    /// Drop inbound messages authored by the local peer
    filter_self_echo: bool,
    history: VecDeque<ChatMessage>,
    history_capacity: usize,
    delivered_ids: HashSet<String>,
    delivered_order: VecDeque<String>,
}

impl MessageRouter {
    pub fn new(
        local_peer_id: impl Into<String>,
        display_name: impl Into<String>,
        history_capacity: usize,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            display_name: display_name.into(),
            events,
            filter_self_echo: false,
            history: VecDeque::with_capacity(history_capacity.min(1024)),
            history_capacity,
            delivered_ids: HashSet::new(),
            delivered_order: VecDeque::new(),
        }
    }

    /// Drop inbound messages whose sender is the local peer
    ///
    /// Needed for transports that echo a sender's own traffic back.
    pub fn with_self_echo_filter(mut self) -> Self {
        self.filter_self_echo = true;
        self
    }

    /// Build a message authored by the local peer and echo it locally
    pub fn compose(&mut self, body: impl Into<String>, kind: MessageKind) -> ChatMessage {
        let message = ChatMessage::new(&self.local_peer_id, &self.display_name, body, kind);
        self.deliver(message.clone());
        message
    }

    /// Compose, echo, and send to every peer whose channel is open
    ///
    /// Returns the message and the ids of the peers it was handed to.
    pub fn broadcast<'a, I>(
        &mut self,
        body: impl Into<String>,
        kind: MessageKind,
        peers: I,
    ) -> (ChatMessage, Vec<String>)
    where
        I: IntoIterator<Item = &'a PeerConnectionRecord>,
    {
        let message = self.compose(body, kind);

        let mut sent_to = Vec::new();
        for record in peers {
            if messenger::send(record, &message) {
                sent_to.push(record.peer_id.clone());
            }
        }

        debug!(
            "Message {} fanned out to {} peer(s)",
            message.id,
            sent_to.len()
        );
        (message, sent_to)
    }

    /// Deliver a message received from a remote peer
    ///
    /// Returns false if the message was suppressed.
    pub fn inbound(&mut self, message: ChatMessage) -> bool {
        if self.filter_self_echo && message.is_from(&self.local_peer_id) {
            trace!("Dropping self echo {}", message.id);
            return false;
        }
        self.deliver(message)
    }

    /// Messages delivered so far, oldest first
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.iter().cloned().collect()
    }

    fn deliver(&mut self, message: ChatMessage) -> bool {
        if !self.remember_id(&message.id) {
            debug!("Dropping duplicate message {}", message.id);
            return false;
        }

        if self.history_capacity > 0 {
            if self.history.len() >= self.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(message.clone());
        }

        // The receiver may be gone if the application stopped listening
        let _ = self.events.send(ChatEvent::Message(message));
        true
    }

    fn remember_id(&mut self, id: &str) -> bool {
        if !self.delivered_ids.insert(id.to_string()) {
            return false;
        }
        self.delivered_order.push_back(id.to_string());
        if self.delivered_order.len() > DELIVERED_ID_WINDOW {
            if let Some(oldest) = self.delivered_order.pop_front() {
                self.delivered_ids.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::NegotiationRole;

    fn make_router(capacity: usize) -> (MessageRouter, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MessageRouter::new("p1", "Alice", capacity, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> Vec<ChatMessage> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::Message(m) = event {
                out.push(m);
            }
        }
        out
    }

    #[test]
    fn test_broadcast_without_peers_echoes_once() {
        let (mut router, mut rx) = make_router(10);
        let (message, sent_to) = router.broadcast("hello", MessageKind::Text, Vec::new());

        assert!(sent_to.is_empty());
        let delivered = drain(&mut rx);
        assert_eq!(delivered, vec![message.clone()]);
        assert_eq!(message.sender_id, "p1");
        assert_eq!(message.sender_display_name, "Alice");
    }

    #[test]
    fn test_broadcast_skips_unopened_records() {
        let (mut router, mut rx) = make_router(10);
        let pending = PeerConnectionRecord::new(
            "p2",
            "Bob",
            "addr-2",
            NegotiationRole::Initiator,
            1,
        );

        let (_, sent_to) = router.broadcast("hi", MessageKind::Text, [&pending]);
        assert!(sent_to.is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_inbound_delivered_verbatim() {
        let (mut router, mut rx) = make_router(10);
        let remote = ChatMessage::new("p2", "Bob", "hey", MessageKind::System);

        assert!(router.inbound(remote.clone()));
        assert_eq!(drain(&mut rx), vec![remote]);
    }

    #[test]
    fn test_duplicate_ids_suppressed() {
        let (mut router, mut rx) = make_router(10);
        let remote = ChatMessage::new("p2", "Bob", "hey", MessageKind::Text);

        assert!(router.inbound(remote.clone()));
        assert!(!router.inbound(remote));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_self_echo_filter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = MessageRouter::new("p1", "Alice", 10, tx).with_self_echo_filter();

        let own = ChatMessage::new("p1", "Alice", "mine", MessageKind::Text);
        assert!(!router.inbound(own));
        assert!(drain(&mut rx).is_empty());

        // Without the filter a foreign-id message from self is delivered
        let (mut plain, mut plain_rx) = make_router(10);
        let own = ChatMessage::new("p1", "Alice", "mine", MessageKind::Text);
        assert!(plain.inbound(own));
        assert_eq!(drain(&mut plain_rx).len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let (mut router, _rx) = make_router(3);
        for i in 0..5 {
            router.compose(format!("msg {}", i), MessageKind::Text);
        }

        let bodies: Vec<String> = router.history().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["msg 2", "msg 3", "msg 4"]);
    }
}
