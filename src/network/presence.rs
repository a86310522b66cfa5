//! Live peer set
//!
//! Pure set operations keyed by peer id. A transition is reported exactly
//! once: `join` returns true only when the peer was absent, `leave` only when
//! it was present. A peer that rejoins after leaving is a new join.

use std::collections::BTreeSet;

/// Tracks which remote peers are currently connected (self excluded)
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    peers: BTreeSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer; returns true if this is a new join
    pub fn join(&mut self, peer_id: &str) -> bool {
        self.peers.insert(peer_id.to_string())
    }

    /// Remove a peer; returns true if the peer was present
    pub fn leave(&mut self, peer_id: &str) -> bool {
        self.peers.remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Connected peers in ascending id order
    pub fn peers(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }

    /// Remove everyone, returning the peers that were present
    pub fn clear(&mut self) -> Vec<String> {
        std::mem::take(&mut self.peers).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn test_join_leave_fire_once() {
        let mut presence = PresenceTracker::new();
        assert!(presence.join("p1"));
        assert!(!presence.join("p1"));
        assert_eq!(presence.len(), 1);

        assert!(presence.leave("p1"));
        assert!(!presence.leave("p1"));
        assert!(presence.is_empty());
    }

    #[test]
    fn test_rejoin_is_new_join() {
        let mut presence = PresenceTracker::new();
        presence.join("p1");
        presence.leave("p1");
        assert!(presence.join("p1"));
        assert!(presence.contains("p1"));
    }

    #[test]
    fn test_leave_unknown_peer() {
        let mut presence = PresenceTracker::new();
        assert!(!presence.leave("ghost"));
        assert_eq!(presence.len(), 0);
    }

    #[test]
    fn test_size_matches_transitions_for_random_sequences() {
        let ids = ["a", "b", "c", "d", "e"];

        for seed in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut presence = PresenceTracker::new();
            let mut model: HashSet<&str> = HashSet::new();
            let mut joins = 0usize;
            let mut leaves = 0usize;

            for _ in 0..200 {
                let id = ids[rng.gen_range(0..ids.len())];
                if rng.gen_bool(0.5) {
                    if presence.join(id) {
                        joins += 1;
                    }
                    model.insert(id);
                } else {
                    if presence.leave(id) {
                        leaves += 1;
                    }
                    model.remove(id);
                }

                assert_eq!(presence.len(), joins - leaves);
                assert_eq!(presence.len(), model.len());
            }

            let peers = presence.peers();
            let unique: HashSet<&String> = peers.iter().collect();
            assert_eq!(unique.len(), peers.len(), "no duplicates");
        }
    }

    #[test]
    fn test_clear_returns_members() {
        let mut presence = PresenceTracker::new();
        presence.join("b");
        presence.join("a");
        assert_eq!(presence.clear(), vec!["a".to_string(), "b".to_string()]);
        assert!(presence.is_empty());
    }
}
