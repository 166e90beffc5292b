//! In-memory collaborators for negotiation tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{MeshError, Result};
use crate::media::{LocalStream, MediaConstraints, MediaSource, RemoteStream};
use crate::mesh::events::{MeshEvent, MeshObserver};
use crate::webrtc::channel::{RelayEvent, SignalChannel, SignalConnector};
use crate::webrtc::signaling::{IceCandidate, ParticipantId, SessionDescription, SignalEnvelope};
use crate::webrtc::transport::{PeerTransport, TransportEventSink, TransportFactory};

/// Call recorded by a fake transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    AttachStream(usize),
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Default)]
struct FactoryState {
    calls: HashMap<ParticipantId, Vec<TransportCall>>,
    sinks: HashMap<ParticipantId, TransportEventSink>,
    reject_pattern: Option<String>,
}

/// Transport factory whose transports only record what they are asked to do
#[derive(Clone, Default)]
pub struct FakeFactory {
    state: Arc<Mutex<FactoryState>>,
    created: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, peer: &str) -> Vec<TransportCall> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .get(&ParticipantId::from(peer))
            .cloned()
            .unwrap_or_default()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sink of the most recent transport created toward `peer`
    pub fn sink(&self, peer: &str) -> Option<TransportEventSink> {
        let state = self.state.lock().unwrap();
        state.sinks.get(&ParticipantId::from(peer)).cloned()
    }

    /// `add_ice_candidate` fails for candidates containing `pattern`
    pub fn reject_candidates_containing(&self, pattern: &str) {
        self.state.lock().unwrap().reject_pattern = Some(pattern.to_string());
    }

    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        local: &ParticipantId,
        peer: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(MeshError::NegotiationTransport(
                "fake transport refused".to_string(),
            ));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let generation = events.generation();
        self.state
            .lock()
            .unwrap()
            .sinks
            .insert(peer.clone(), events);

        Ok(Box::new(FakeTransport {
            label: format!("{} to {} gen {}", local, peer, generation),
            peer: peer.clone(),
            factory: self.clone(),
        }))
    }
}

struct FakeTransport {
    label: String,
    peer: ParticipantId,
    factory: FakeFactory,
}

impl FakeTransport {
    fn record(&self, call: TransportCall) {
        let mut state = self.factory.state.lock().unwrap();
        state.calls.entry(self.peer.clone()).or_default().push(call);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn attach_stream(&self, stream: &LocalStream) -> Result<()> {
        self.record(TransportCall::AttachStream(stream.tracks().len()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(TransportCall::CreateOffer);
        Ok(SessionDescription::offer(format!("offer {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(TransportCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer {}", self.label)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(TransportCall::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(TransportCall::SetRemote(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let rejected = {
            let state = self.factory.state.lock().unwrap();
            state
                .reject_pattern
                .as_deref()
                .is_some_and(|p| candidate.candidate.contains(p))
        };
        self.record(TransportCall::AddCandidate(candidate));
        if rejected {
            return Err(MeshError::CandidateApply(format!("{} rejected", self.peer)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(TransportCall::Close);
        self.factory.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Member {
    room_id: String,
    events: mpsc::UnboundedSender<MeshEvent>,
}

#[derive(Default)]
struct RelayState {
    members: HashMap<ParticipantId, Member>,
    sent: Vec<SignalEnvelope>,
    closed: Vec<ParticipantId>,
    refuse: bool,
}

/// Relay that delivers envelopes between in-process participants.
///
/// Targeted envelopes reach only their target; broadcasts reach every
/// member of the room, the sender included.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(&self) {
        self.state.lock().unwrap().refuse = true;
    }

    /// Every envelope sent through the relay, in order
    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Participants that closed their channel
    pub fn closed(&self) -> Vec<ParticipantId> {
        self.state.lock().unwrap().closed.clone()
    }

    /// Deliver a raw envelope to `participant` as if the relay forwarded it
    pub fn inject(&self, participant: &ParticipantId, envelope: SignalEnvelope) {
        let state = self.state.lock().unwrap();
        if let Some(member) = state.members.get(participant) {
            let _ = member
                .events
                .send(MeshEvent::Relay(RelayEvent::Envelope(envelope)));
        }
    }

    /// Drop `participant`'s connection from the relay side
    pub fn disconnect(&self, participant: &ParticipantId) {
        let mut state = self.state.lock().unwrap();
        if let Some(member) = state.members.remove(participant) {
            let _ = member.events.send(MeshEvent::Relay(RelayEvent::Closed {
                reason: "relay went away".to_string(),
            }));
        }
    }
}

#[async_trait]
impl SignalConnector for MemoryRelay {
    async fn connect(
        &self,
        room_id: &str,
        participant: &ParticipantId,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Box<dyn SignalChannel>> {
        let mut state = self.state.lock().unwrap();
        if state.refuse {
            return Err(MeshError::RelayConnection("connection refused".to_string()));
        }
        let _ = events.send(MeshEvent::Relay(RelayEvent::Opened));
        state.members.insert(
            participant.clone(),
            Member {
                room_id: room_id.to_string(),
                events,
            },
        );
        Ok(Box::new(MemoryChannel {
            participant: participant.clone(),
            relay: self.clone(),
            open: true,
        }))
    }
}

struct MemoryChannel {
    participant: ParticipantId,
    relay: MemoryRelay,
    open: bool,
}

#[async_trait]
impl SignalChannel for MemoryChannel {
    async fn send(&mut self, envelope: &SignalEnvelope) -> Result<()> {
        let mut state = self.relay.state.lock().unwrap();
        let Some(room_id) = state
            .members
            .get(&self.participant)
            .filter(|_| self.open)
            .map(|m| m.room_id.clone())
        else {
            return Err(MeshError::RelayConnection("not connected".to_string()));
        };
        state.sent.push(envelope.clone());

        for (id, member) in &state.members {
            if member.room_id != room_id {
                continue;
            }
            let wanted = match &envelope.target {
                Some(target) => target == id,
                None => true,
            };
            if wanted {
                let event = MeshEvent::Relay(RelayEvent::Envelope(envelope.clone()));
                let _ = member.events.send(event);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let mut state = self.relay.state.lock().unwrap();
        state.members.remove(&self.participant);
        state.closed.push(self.participant.clone());
        Ok(())
    }
}

/// What a `RecordingObserver` saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    RemoteStream(ParticipantId, String),
    PeerRemoved(ParticipantId),
    SessionFailed(String),
    LocalMedia(Option<bool>, Option<bool>),
}

#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<Observed> {
        self.seen.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<ParticipantId> {
        self.seen()
            .into_iter()
            .filter_map(|o| match o {
                Observed::PeerRemoved(peer) => Some(peer),
                _ => None,
            })
            .collect()
    }

    fn push(&self, observed: Observed) {
        self.seen.lock().unwrap().push(observed);
    }
}

impl MeshObserver for RecordingObserver {
    fn on_remote_stream_available(&self, peer: &ParticipantId, stream: RemoteStream) {
        self.push(Observed::RemoteStream(peer.clone(), stream.track_id));
    }

    fn on_peer_removed(&self, peer: &ParticipantId) {
        self.push(Observed::PeerRemoved(peer.clone()));
    }

    fn on_session_failed(&self, error: &MeshError) {
        self.push(Observed::SessionFailed(error.to_string()));
    }

    fn on_local_media_changed(&self, audio: Option<bool>, video: Option<bool>) {
        self.push(Observed::LocalMedia(audio, video));
    }
}

/// Media source that never touches a device
#[derive(Default)]
pub struct FakeMediaSource {
    fail: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl FakeMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let source = Self::default();
        source.fail.store(true, Ordering::SeqCst);
        Arc::new(source)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalStream>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MeshError::MediaAcquisition("camera busy".to_string()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LocalStream::from_constraints(
            format!("stream-{n}"),
            constraints,
        )))
    }

    async fn release(&self, _stream: &LocalStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
