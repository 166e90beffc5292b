//! Peer session registry
//!
//! At most one session per remote participant. Removal always closes the
//! session first so its transport is released before the entry goes away.

use std::collections::HashMap;

use tracing::debug;

use super::session::{NegotiationRole, PeerSession};
use crate::webrtc::signaling::ParticipantId;

#[derive(Default)]
pub struct PeerSessionRegistry {
    sessions: HashMap<ParticipantId, PeerSession>,
}

impl PeerSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for `peer`, or a new one in `role`
    pub fn get_or_create(&mut self, peer: &ParticipantId, role: NegotiationRole) -> &mut PeerSession {
        self.sessions.entry(peer.clone()).or_insert_with(|| {
            debug!("Creating {:?} session for {}", role, peer);
            PeerSession::new(peer.clone(), role)
        })
    }

    pub fn get(&self, peer: &ParticipantId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &ParticipantId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Known peers, sorted
    pub fn peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<ParticipantId> = self.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Close and drop the session; false if there was none
    pub async fn remove(&mut self, peer: &ParticipantId) -> bool {
        match self.sessions.remove(peer) {
            Some(mut session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every session and empty the registry, returning the removed peers
    pub async fn close_all(&mut self) -> Vec<ParticipantId> {
        let mut removed = Vec::with_capacity(self.sessions.len());
        for (peer, mut session) in self.sessions.drain() {
            session.close().await;
            removed.push(peer);
        }
        removed.sort();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::session::NegotiationPhase;

    #[test]
    fn test_get_or_create_keeps_existing() {
        let mut registry = PeerSessionRegistry::new();
        let peer = ParticipantId::from("peer-b");

        registry.get_or_create(&peer, NegotiationRole::Offerer);
        let session = registry.get_or_create(&peer, NegotiationRole::Answerer);

        assert_eq!(session.role(), NegotiationRole::Offerer);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let mut registry = PeerSessionRegistry::new();
        let peer = ParticipantId::from("peer-b");
        registry.get_or_create(&peer, NegotiationRole::Answerer);

        assert!(registry.remove(&peer).await);
        assert!(!registry.contains(&peer));
        assert!(!registry.remove(&peer).await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let mut registry = PeerSessionRegistry::new();
        for id in ["peer-c", "peer-b", "peer-d"] {
            registry.get_or_create(&id.into(), NegotiationRole::Offerer);
        }
        assert_eq!(
            registry.peers(),
            vec![
                ParticipantId::from("peer-b"),
                ParticipantId::from("peer-c"),
                ParticipantId::from("peer-d")
            ]
        );
        assert_eq!(
            registry.get(&"peer-c".into()).map(|s| s.phase()),
            Some(NegotiationPhase::New)
        );

        let removed = registry.close_all().await;
        assert_eq!(removed.len(), 3);
        assert!(registry.is_empty());
    }
}
