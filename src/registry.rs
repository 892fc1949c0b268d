//! Per-endpoint session registry.
//!
//! A `SessionRegistry` maps session ids to session handles. It is owned outright by a
//! single control-session task (spec §5: "each endpoint's session registry is mutated
//! only by its own event loop"), so no internal locking is needed — the analogue of
//! `cli/src/relay/stream_mux.rs`'s `streams: HashMap<u16, StreamHandle>`, generalized to
//! 32-bit, cryptographically-random session ids per spec §4.2.

use std::collections::HashMap;

use rand::RngCore;

/// Maps session ids to session handles of type `T`.
///
/// `T` is `ListenerHandle` on the Server, `RepeaterHandle` on the Client (spec §4.3/4.4).
#[derive(Debug, Default)]
pub struct SessionRegistry<T> {
    sessions: HashMap<u32, T>,
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Generate a session id via 4 cryptographically-random bytes, rejecting collisions
    /// against ids currently live in this registry (spec §4.2). Session id 0 is reserved
    /// for control-level `INIT` (spec §3) and is never returned.
    pub fn generate_id(&self) -> u32 {
        let mut rng = rand::rng();
        loop {
            let candidate = rng.next_u32();
            if candidate != 0 && !self.sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn insert(&mut self, sid: u32, handle: T) {
        self.sessions.insert(sid, handle);
    }

    pub fn get(&self, sid: u32) -> Option<&T> {
        self.sessions.get(&sid)
    }

    pub fn contains(&self, sid: u32) -> bool {
        self.sessions.contains_key(&sid)
    }

    /// Remove a session. Idempotent: removing an absent sid is not an error, and simply
    /// returns `None` (spec §4.2).
    pub fn remove(&mut self, sid: u32) -> Option<T> {
        self.sessions.remove(&sid)
    }

    /// Drain every live session, e.g. on transport loss (spec §4.5/§4.6: "close every
    /// owned session").
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.sessions.drain()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_nonzero() {
        let mut registry: SessionRegistry<()> = SessionRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            let id = registry.generate_id();
            assert_ne!(id, 0, "sid 0 is reserved for control-level INIT");
            assert!(seen.insert(id), "duplicate sid {id} generated while live");
            registry.insert(id, ());
        }
        assert_eq!(registry.len(), 2000);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = SessionRegistry::new();
        registry.insert(5, "handle");
        assert_eq!(registry.remove(5), Some("handle"));
        assert_eq!(registry.remove(5), None);
        assert_eq!(registry.remove(5), None);
    }

    #[test]
    fn remove_absent_sid_is_not_an_error() {
        let mut registry: SessionRegistry<()> = SessionRegistry::new();
        assert_eq!(registry.remove(999), None);
    }

    #[test]
    fn get_and_contains_reflect_live_state() {
        let mut registry = SessionRegistry::new();
        assert!(!registry.contains(1));
        registry.insert(1, 100u32);
        assert!(registry.contains(1));
        assert_eq!(registry.get(1), Some(&100));
        registry.remove(1);
        assert!(!registry.contains(1));
        assert_eq!(registry.get(1), None);
    }

    #[test]
    fn drain_empties_the_registry() {
        let mut registry = SessionRegistry::new();
        registry.insert(1, "a");
        registry.insert(2, "b");
        let drained: std::collections::HashMap<_, _> = registry.drain().collect();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
