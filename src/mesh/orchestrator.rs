//! Session orchestrator
//!
//! Owns room membership, the relay channel, local media and the peer
//! session registry. Every mutation happens inside `handle_event`, which
//! the event loop (`run` or `drain`) awaits to completion one event at a
//! time.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::events::{Command, MeshEvent, MeshHandle, MeshObserver};
use super::registry::PeerSessionRegistry;
use super::session::{NegotiationContext, NegotiationPhase, NegotiationRole, PeerSession};
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::media::{LocalStream, MediaSource, SampleMediaSource, TrackKind};
use crate::webrtc::channel::{RelayEvent, SignalChannel, SignalConnector, WsSignalConnector};
use crate::webrtc::peer::RtcTransportFactory;
use crate::webrtc::signaling::{
    IceCandidate, ParticipantId, SessionDescription, SignalBody, SignalEnvelope,
};
use crate::webrtc::transport::{TransportEvent, TransportEventKind, TransportFactory};

/// State held while joined to a room
struct Joined {
    room_id: String,
    local_id: ParticipantId,
    stream: Arc<LocalStream>,
    channel: Box<dyn SignalChannel>,
}

/// What the loop does after an event
enum Flow {
    Continue,
    Left,
    RelayLost(MeshError),
}

/// Borrowed pieces for one negotiation step. Envelopes the step emits are
/// sent on `flush`.
struct Step<'a> {
    ctx: NegotiationContext<'a>,
    registry: &'a mut PeerSessionRegistry,
    channel: &'a mut Box<dyn SignalChannel>,
}

impl Step<'_> {
    async fn flush(self) {
        let Step { ctx, channel, .. } = self;
        for envelope in ctx.into_outbox() {
            trace!(
                "Sending {} to {}",
                envelope.kind(),
                envelope
                    .target
                    .as_ref()
                    .map(|t| t.as_str())
                    .unwrap_or("room")
            );
            if let Err(e) = channel.send(&envelope).await {
                warn!("Failed to send {} envelope: {}", envelope.kind(), e);
            }
        }
    }
}

/// Full-mesh negotiation coordinator for one local participant
pub struct SessionOrchestrator {
    config: MeshConfig,
    media: Arc<dyn MediaSource>,
    connector: Arc<dyn SignalConnector>,
    factory: Arc<dyn TransportFactory>,
    observer: Arc<dyn MeshObserver>,
    registry: PeerSessionRegistry,
    /// Peers that announced their departure; their late candidates are dropped
    departed: HashSet<ParticipantId>,
    generations: AtomicU64,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    events_rx: mpsc::UnboundedReceiver<MeshEvent>,
    joined: Option<Joined>,
}

impl SessionOrchestrator {
    pub fn new(
        config: MeshConfig,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn SignalConnector>,
        factory: Arc<dyn TransportFactory>,
        observer: Arc<dyn MeshObserver>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            media,
            connector,
            factory,
            observer,
            registry: PeerSessionRegistry::new(),
            departed: HashSet::new(),
            generations: AtomicU64::new(0),
            events_tx,
            events_rx,
            joined: None,
        }
    }

    /// WebSocket relay, webrtc-rs transports and sample-fed local tracks
    pub fn with_defaults(config: MeshConfig, observer: Arc<dyn MeshObserver>) -> Self {
        let connector = Arc::new(WsSignalConnector::new(config.clone()));
        let factory = Arc::new(RtcTransportFactory::new(config.clone()));
        Self::new(
            config,
            Arc::new(SampleMediaSource),
            connector,
            factory,
            observer,
        )
    }

    /// Handle for posting commands from the UI side
    pub fn handle(&self) -> MeshHandle {
        MeshHandle::new(self.events_tx.clone())
    }

    pub fn is_joined(&self) -> bool {
        self.joined.is_some()
    }

    pub fn local_id(&self) -> Option<&ParticipantId> {
        self.joined.as_ref().map(|j| &j.local_id)
    }

    pub fn room_id(&self) -> Option<&str> {
        self.joined.as_ref().map(|j| j.room_id.as_str())
    }

    pub fn local_stream(&self) -> Option<&Arc<LocalStream>> {
        self.joined.as_ref().map(|j| &j.stream)
    }

    pub fn registry(&self) -> &PeerSessionRegistry {
        &self.registry
    }

    pub fn session(&self, peer: &ParticipantId) -> Option<&PeerSession> {
        self.registry.get(peer)
    }

    /// Join `room_id` under a freshly generated participant id
    pub async fn join(&mut self, room_id: &str) -> Result<ParticipantId> {
        self.join_as(room_id, ParticipantId::generate()).await
    }

    /// Join `room_id` as `local_id`.
    ///
    /// Acquires local media, connects to the relay and announces the
    /// arrival. Peers already in the room answer the announcement with
    /// offers.
    pub async fn join_as(&mut self, room_id: &str, local_id: ParticipantId) -> Result<ParticipantId> {
        if let Some(joined) = &self.joined {
            return Err(MeshError::AlreadyJoined(joined.room_id.clone()));
        }
        self.config.validate()?;
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(MeshError::Config("room id must not be empty".to_string()));
        }

        info!("Joining room {} as {}", room_id, local_id);

        let stream = match self.media.acquire(self.config.media).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Local media unavailable: {}", e);
                self.observer.on_session_failed(&e);
                return Err(e);
            }
        };

        let mut channel = match self
            .connector
            .connect(room_id, &local_id, self.events_tx.clone())
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                error!("Relay unreachable: {}", e);
                self.media.release(&stream).await;
                self.observer.on_session_failed(&e);
                return Err(e);
            }
        };

        if let Err(e) = channel
            .send(&SignalEnvelope::joined(local_id.clone(), room_id))
            .await
        {
            error!("Failed to announce arrival: {}", e);
            let _ = channel.close().await;
            self.media.release(&stream).await;
            self.observer.on_session_failed(&e);
            return Err(e);
        }

        self.departed.clear();
        self.joined = Some(Joined {
            room_id: room_id.to_string(),
            local_id: local_id.clone(),
            stream,
            channel,
        });
        info!("Joined room {}", room_id);
        Ok(local_id)
    }

    /// Announce departure, close every session, the relay and local media
    pub async fn leave(&mut self) -> Result<()> {
        let Some(mut joined) = self.joined.take() else {
            return Err(MeshError::NotJoined);
        };

        info!("Leaving room {}", joined.room_id);
        let left = SignalEnvelope::left(joined.local_id.clone(), joined.room_id.as_str());
        if let Err(e) = joined.channel.send(&left).await {
            warn!("Failed to announce departure: {}", e);
        }

        for peer in self.registry.close_all().await {
            self.observer.on_peer_removed(&peer);
        }
        self.departed.clear();

        if let Err(e) = joined.channel.close().await {
            warn!("Failed to close relay channel: {}", e);
        }
        self.media.release(&joined.stream).await;
        Ok(())
    }

    /// Process events until the local side leaves or the relay is lost
    pub async fn run(&mut self) -> Result<()> {
        if self.joined.is_none() {
            return Err(MeshError::NotJoined);
        }

        while let Some(event) = self.events_rx.recv().await {
            match self.handle_event(event).await {
                Flow::Continue => {}
                Flow::Left => return Ok(()),
                Flow::RelayLost(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Process the events queued right now; returns how many were handled
    pub async fn drain(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            handled += 1;
            if let Flow::RelayLost(e) = self.handle_event(event).await {
                return Err(e);
            }
        }
        Ok(handled)
    }

    async fn handle_event(&mut self, event: MeshEvent) -> Flow {
        match event {
            MeshEvent::Relay(RelayEvent::Opened) => {
                debug!("Relay channel open");
                Flow::Continue
            }
            MeshEvent::Relay(RelayEvent::Closed { reason }) => match self.relay_lost(&reason).await {
                Some(e) => Flow::RelayLost(e),
                None => Flow::Continue,
            },
            MeshEvent::Relay(RelayEvent::Envelope(envelope)) => {
                self.route(envelope).await;
                Flow::Continue
            }
            MeshEvent::Transport(event) => {
                self.on_transport_event(event).await;
                Flow::Continue
            }
            MeshEvent::Command(command) => self.on_command(command).await,
        }
    }

    fn step(&mut self) -> Option<Step<'_>> {
        let joined = self.joined.as_mut()?;
        Some(Step {
            ctx: NegotiationContext::new(
                &joined.local_id,
                self.factory.as_ref(),
                Some(joined.stream.as_ref()),
                &self.events_tx,
                &self.generations,
            ),
            registry: &mut self.registry,
            channel: &mut joined.channel,
        })
    }

    async fn route(&mut self, envelope: SignalEnvelope) {
        let Some(joined) = &self.joined else {
            debug!("Dropping {} envelope: not joined", envelope.kind());
            return;
        };

        if envelope.sender == joined.local_id {
            trace!("Ignoring reflected {} envelope", envelope.kind());
            return;
        }
        if let Some(room_id) = &envelope.room_id {
            if room_id != &joined.room_id {
                warn!(
                    "Dropping {} from {}: room {} is not {}",
                    envelope.kind(),
                    envelope.sender,
                    room_id,
                    joined.room_id
                );
                return;
            }
        }
        if !envelope.body.is_membership() {
            if let Some(target) = &envelope.target {
                if target != &joined.local_id {
                    debug!(
                        "Dropping {} from {} addressed to {}",
                        envelope.kind(),
                        envelope.sender,
                        target
                    );
                    return;
                }
            }
        }

        debug!("Received {} from {}", envelope.kind(), envelope.sender);
        let peer = envelope.sender;
        match envelope.body {
            SignalBody::ParticipantJoined => self.on_participant_joined(peer).await,
            SignalBody::ParticipantLeft => self.on_participant_left(peer).await,
            SignalBody::Offer(offer) => self.on_offer(peer, offer).await,
            SignalBody::Answer(answer) => self.on_answer(peer, answer).await,
            SignalBody::Candidate(candidate) => self.on_candidate(peer, candidate).await,
        }
    }

    async fn on_participant_joined(&mut self, peer: ParticipantId) {
        self.departed.remove(&peer);
        if self.registry.get(&peer).is_some_and(|s| !s.is_idle()) {
            debug!("{} announced again; session already exists", peer);
            return;
        }
        info!("Participant {} joined", peer);
        self.initiate(peer).await;
    }

    async fn on_participant_left(&mut self, peer: ParticipantId) {
        self.departed.insert(peer.clone());
        if self.registry.remove(&peer).await {
            info!("Participant {} left", peer);
            self.observer.on_peer_removed(&peer);
        } else {
            debug!("Participant {} left without a session", peer);
        }
    }

    /// Offer to `peer`, creating its session if needed
    async fn initiate(&mut self, peer: ParticipantId) {
        let observer = self.observer.clone();
        let Some(mut step) = self.step() else { return };

        let session = step.registry.get_or_create(&peer, NegotiationRole::Offerer);
        if let Err(e) = session.start_offer(&mut step.ctx).await {
            warn!("Failed to offer to {}: {}", peer, e);
            step.registry.remove(&peer).await;
            observer.on_peer_removed(&peer);
        }
        step.flush().await;
    }

    async fn on_offer(&mut self, peer: ParticipantId, offer: SessionDescription) {
        self.departed.remove(&peer);
        let observer = self.observer.clone();
        let Some(mut step) = self.step() else { return };

        let session = step.registry.get_or_create(&peer, NegotiationRole::Answerer);
        let result = match session.apply_offer(offer.clone(), &mut step.ctx).await {
            Err(e @ MeshError::InvalidNegotiationState { .. }) => {
                warn!("{}; renegotiating", e);
                session.reset().await;
                session.apply_offer(offer, &mut step.ctx).await
            }
            other => other,
        };

        match result {
            Ok(outcome) => debug!("Offer from {}: {:?}", peer, outcome),
            Err(e) => {
                warn!("Negotiation with {} failed: {}", peer, e);
                step.registry.remove(&peer).await;
                observer.on_peer_removed(&peer);
            }
        }
        step.flush().await;
    }

    async fn on_answer(&mut self, peer: ParticipantId, answer: SessionDescription) {
        let observer = self.observer.clone();
        let Some(mut step) = self.step() else { return };

        let Some(session) = step.registry.get_mut(&peer) else {
            let e = MeshError::InvalidNegotiationState {
                peer: peer.to_string(),
                phase: NegotiationPhase::New,
                reason: "answer from a peer without a session".to_string(),
            };
            warn!("Dropping answer: {}", e);
            return;
        };

        let mut failed = None;
        match session.apply_answer(answer).await {
            Ok(outcome) => debug!("Answer from {}: {:?}", peer, outcome),
            Err(e @ MeshError::InvalidNegotiationState { .. }) if session.is_idle() => {
                warn!("Dropping answer: {}", e);
            }
            Err(e @ MeshError::InvalidNegotiationState { .. }) => {
                // the peer still considers the old link established
                warn!("{}; resetting session and offering again", e);
                session.reset().await;
                if let Err(e) = session.start_offer(&mut step.ctx).await {
                    failed = Some(e);
                }
            }
            Err(e) => failed = Some(e),
        }

        if let Some(e) = failed {
            warn!("Negotiation with {} failed: {}", peer, e);
            step.registry.remove(&peer).await;
            observer.on_peer_removed(&peer);
        }
        step.flush().await;
    }

    async fn on_candidate(&mut self, peer: ParticipantId, candidate: IceCandidate) {
        if self.joined.is_none() {
            return;
        }
        if self.departed.contains(&peer) {
            debug!("Dropping candidate from departed {}", peer);
            return;
        }

        let session = self.registry.get_or_create(&peer, NegotiationRole::Answerer);
        match session.apply_candidate(candidate).await {
            Ok(outcome) => trace!("Candidate from {}: {:?}", peer, outcome),
            Err(e) => warn!("Dropping candidate from {}: {}", peer, e),
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent {
            peer,
            generation,
            kind,
        } = event;

        let live = self
            .registry
            .get(&peer)
            .is_some_and(|s| s.accepts(generation));
        if !live {
            trace!("Ignoring stale transport event for {} (gen {})", peer, generation);
            return;
        }

        match kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let Some(mut step) = self.step() else { return };
                if let Some(session) = step.registry.get(&peer) {
                    session.emit_local_candidate(candidate, &mut step.ctx);
                }
                step.flush().await;
            }
            TransportEventKind::RemoteTrack(stream) => {
                info!("Remote {} stream from {}", stream.kind, peer);
                self.observer.on_remote_stream_available(&peer, stream);
            }
            TransportEventKind::StateChanged(state) if state.is_fatal() => {
                let e = MeshError::NegotiationTransport(format!("connection to {} {}", peer, state));
                warn!("{}; closing session", e);
                self.registry.remove(&peer).await;
                self.observer.on_peer_removed(&peer);
            }
            TransportEventKind::StateChanged(state) => {
                info!("Connection to {} {}", peer, state);
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Call(peer) => {
                let is_self = match self.local_id() {
                    Some(local_id) => local_id == &peer,
                    None => {
                        warn!("Cannot call {}: not joined", peer);
                        return Flow::Continue;
                    }
                };
                if is_self {
                    debug!("Not calling ourselves");
                } else {
                    self.initiate(peer).await;
                }
                Flow::Continue
            }
            Command::SetAudioEnabled(enabled) => {
                self.set_track_enabled(TrackKind::Audio, enabled);
                Flow::Continue
            }
            Command::SetVideoEnabled(enabled) => {
                self.set_track_enabled(TrackKind::Video, enabled);
                Flow::Continue
            }
            Command::Leave => {
                if let Err(e) = self.leave().await {
                    debug!("Leave ignored: {}", e);
                }
                Flow::Left
            }
        }
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        let Some(joined) = &self.joined else {
            warn!("Cannot toggle {}: not joined", kind);
            return;
        };
        if !joined.stream.set_enabled(kind, enabled) {
            debug!("No local {} track to toggle", kind);
            return;
        }
        info!("Local {} {}", kind, if enabled { "enabled" } else { "disabled" });
        self.observer.on_local_media_changed(
            joined.stream.is_enabled(TrackKind::Audio),
            joined.stream.is_enabled(TrackKind::Video),
        );
    }

    /// Tear down after the relay went away; None if we were not joined
    async fn relay_lost(&mut self, reason: &str) -> Option<MeshError> {
        let Some(mut joined) = self.joined.take() else {
            debug!("Relay closed while not joined: {}", reason);
            return None;
        };

        let e = MeshError::RelayConnection(format!("relay connection lost: {}", reason));
        error!("{}", e);

        for peer in self.registry.close_all().await {
            self.observer.on_peer_removed(&peer);
        }
        self.departed.clear();
        let _ = joined.channel.close().await;
        self.media.release(&joined.stream).await;
        self.observer.on_session_failed(&e);
        Some(e)
    }
}
