//! Per-peer transport seam
//!
//! A `PeerTransport` is the one underlying connection a peer session
//! drives. Callbacks from it never touch session state directly; they are
//! posted to the orchestrator's event queue through a `TransportEventSink`
//! stamped with the transport's generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::signaling::{IceCandidate, ParticipantId, SessionDescription};
use crate::error::Result;
use crate::media::{LocalStream, RemoteStream};
use crate::mesh::events::MeshEvent;

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that end the peer link
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Something the transport reported
#[derive(Debug, Clone)]
pub enum TransportEventKind {
    /// Newly gathered local candidate, to be trickled to the peer
    LocalCandidate(IceCandidate),
    /// Remote media arrived
    RemoteTrack(RemoteStream),
    /// Connection state changed
    StateChanged(ConnectionState),
}

/// Transport callback routed back into the event loop
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub peer: ParticipantId,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Handle given to a transport for reporting callbacks
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl TransportEventSink {
    pub fn new(peer: ParticipantId, generation: u64, tx: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Post an event; dropped silently once the event loop is gone
    pub fn emit(&self, kind: TransportEventKind) {
        let _ = self.tx.send(MeshEvent::Transport(TransportEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind,
        }));
    }
}

/// One underlying connection to a remote participant
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Add every local track for sending
    async fn attach_stream(&self, stream: &LocalStream) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Failure is `MeshError::CandidateApply`
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates transports for new peer sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Transport from `local` toward `peer`
    async fn create(
        &self,
        local: &ParticipantId,
        peer: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_states() {
        assert!(ConnectionState::Failed.is_fatal());
        assert!(ConnectionState::Disconnected.is_fatal());
        assert!(ConnectionState::Closed.is_fatal());
        assert!(!ConnectionState::Connecting.is_fatal());
        assert!(!ConnectionState::Connected.is_fatal());
    }

    #[tokio::test]
    async fn test_sink_stamps_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TransportEventSink::new("peer-b".into(), 7, tx);
        sink.emit(TransportEventKind::StateChanged(ConnectionState::Connected));

        let MeshEvent::Transport(event) = rx.recv().await.unwrap() else {
            panic!("expected transport event");
        };
        assert_eq!(event.peer.as_str(), "peer-b");
        assert_eq!(event.generation, 7);
        assert!(matches!(
            event.kind,
            TransportEventKind::StateChanged(ConnectionState::Connected)
        ));
    }

    #[test]
    fn test_emit_after_loop_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = TransportEventSink::new("peer-b".into(), 1, tx);
        sink.emit(TransportEventKind::StateChanged(ConnectionState::Closed));
    }
}
