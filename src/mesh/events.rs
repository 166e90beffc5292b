//! Event loop messages and the UI collaborator

use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::media::RemoteStream;
use crate::webrtc::channel::RelayEvent;
use crate::webrtc::signaling::ParticipantId;
use crate::webrtc::transport::TransportEvent;

/// Everything the orchestrator reacts to
#[derive(Debug)]
pub enum MeshEvent {
    /// Relay lifecycle or inbound envelope
    Relay(RelayEvent),
    /// Callback from a peer transport
    Transport(TransportEvent),
    /// Local UI action
    Command(Command),
}

/// Local UI actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Explicitly initiate negotiation toward a participant
    Call(ParticipantId),
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    Leave,
}

/// Cloneable handle for posting commands to a running orchestrator
#[derive(Debug, Clone)]
pub struct MeshHandle {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl MeshHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self { tx }
    }

    /// Post a command; returns false once the orchestrator is gone
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(MeshEvent::Command(command)).is_ok()
    }

    pub fn call(&self, peer: ParticipantId) -> bool {
        self.send(Command::Call(peer))
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.send(Command::SetAudioEnabled(enabled))
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.send(Command::SetVideoEnabled(enabled))
    }

    pub fn leave(&self) -> bool {
        self.send(Command::Leave)
    }
}

/// UI render collaborator; called by the orchestrator only
pub trait MeshObserver: Send + Sync {
    fn on_remote_stream_available(&self, peer: &ParticipantId, stream: RemoteStream);

    fn on_peer_removed(&self, peer: &ParticipantId);

    /// Session-global failure the user should hear about
    fn on_session_failed(&self, _error: &MeshError) {}

    /// Local track enablement changed
    fn on_local_media_changed(&self, _audio: Option<bool>, _video: Option<bool>) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl MeshObserver for NullObserver {
    fn on_remote_stream_available(&self, _peer: &ParticipantId, _stream: RemoteStream) {}

    fn on_peer_removed(&self, _peer: &ParticipantId) {}
}
