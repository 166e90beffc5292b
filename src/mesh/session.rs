//! Per-peer negotiation state machine
//!
//! ```text
//!            start_offer                     answer
//!   New ─────────────────> OfferSent ─────────────────> Stable
//!    │                        │ glare, we lose              ^
//!    │ offer                  v                             │
//!    └──────> OfferReceived ──> AnswerSent ─────────────────┘
//!
//!   any ── close ──> Closed (absorbing)
//! ```
//!
//! Remote candidates that arrive before a remote description is applied
//! are buffered and flushed in receipt order right after it is applied.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::MeshEvent;
use crate::error::{MeshError, Result};
use crate::media::LocalStream;
use crate::webrtc::signaling::{
    IceCandidate, ParticipantId, SessionDescription, SignalBody, SignalEnvelope,
};
use crate::webrtc::transport::{PeerTransport, TransportEventSink, TransportFactory};

/// Which side proposed the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    New,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Stable,
    Closed,
}

impl NegotiationPhase {
    /// Whether a remote description is in effect
    fn has_remote_description(self) -> bool {
        matches!(
            self,
            NegotiationPhase::OfferReceived | NegotiationPhase::AnswerSent | NegotiationPhase::Stable
        )
    }
}

impl std::fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationPhase::New => write!(f, "new"),
            NegotiationPhase::OfferSent => write!(f, "offer_sent"),
            NegotiationPhase::OfferReceived => write!(f, "offer_received"),
            NegotiationPhase::AnswerSent => write!(f, "answer_sent"),
            NegotiationPhase::Stable => write!(f, "stable"),
            NegotiationPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Result of applying an inbound offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Answer emitted
    Answered,
    /// Glare: our own offer wins, the incoming one is ignored
    GlareIgnored,
    /// Glare: our offer was discarded and the incoming one answered
    GlareYielded,
    /// Same offer as already applied
    Duplicate,
    /// Session closed
    Ignored,
}

/// Result of applying an inbound answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// Same answer as already applied
    Duplicate,
    Ignored,
}

/// Result of receiving a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// Held until a remote description is applied
    Buffered,
    /// End-of-candidates marker
    Skipped,
    Ignored,
}

/// What a session needs from the orchestrator for one negotiation step
pub struct NegotiationContext<'a> {
    pub local_id: &'a ParticipantId,
    pub factory: &'a dyn TransportFactory,
    pub local_stream: Option<&'a LocalStream>,
    pub events: &'a mpsc::UnboundedSender<MeshEvent>,
    pub generations: &'a AtomicU64,
    outbox: Vec<SignalEnvelope>,
}

impl<'a> NegotiationContext<'a> {
    pub fn new(
        local_id: &'a ParticipantId,
        factory: &'a dyn TransportFactory,
        local_stream: Option<&'a LocalStream>,
        events: &'a mpsc::UnboundedSender<MeshEvent>,
        generations: &'a AtomicU64,
    ) -> Self {
        Self {
            local_id,
            factory,
            local_stream,
            events,
            generations,
            outbox: Vec::new(),
        }
    }

    fn emit(&mut self, body: SignalBody, target: &ParticipantId) {
        self.outbox.push(SignalEnvelope::to_peer(
            body,
            self.local_id.clone(),
            target.clone(),
        ));
    }

    /// Envelopes queued by the step, in emission order
    pub fn into_outbox(self) -> Vec<SignalEnvelope> {
        self.outbox
    }
}

/// Negotiation state for one remote participant
pub struct PeerSession {
    peer_id: ParticipantId,
    role: NegotiationRole,
    phase: NegotiationPhase,
    transport: Option<Box<dyn PeerTransport>>,
    generation: u64,
    pending_candidates: Vec<IceCandidate>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
}

impl PeerSession {
    pub fn new(peer_id: ParticipantId, role: NegotiationRole) -> Self {
        Self {
            peer_id,
            role,
            phase: NegotiationPhase::New,
            transport: None,
            generation: 0,
            pending_candidates: Vec::new(),
            local_description: None,
            remote_description: None,
        }
    }

    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == NegotiationPhase::Closed
    }

    /// No negotiation started yet; at most buffered remote candidates
    pub fn is_idle(&self) -> bool {
        self.phase == NegotiationPhase::New && self.transport.is_none()
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Whether a callback stamped with `generation` belongs to the live transport
    pub fn accepts(&self, generation: u64) -> bool {
        !self.is_closed() && self.transport.is_some() && self.generation == generation
    }

    fn set_phase(&mut self, phase: NegotiationPhase) {
        debug!("Peer {} phase {} -> {}", self.peer_id, self.phase, phase);
        self.phase = phase;
    }

    async fn ensure_transport(&mut self, ctx: &NegotiationContext<'_>) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }

        let generation = ctx.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let sink = TransportEventSink::new(self.peer_id.clone(), generation, ctx.events.clone());
        let transport = ctx.factory.create(ctx.local_id, &self.peer_id, sink).await?;

        if let Some(stream) = ctx.local_stream {
            if let Err(e) = transport.attach_stream(stream).await {
                let _ = transport.close().await;
                return Err(e);
            }
        }

        self.transport = Some(transport);
        self.generation = generation;
        Ok(())
    }

    fn transport(&self) -> Result<&dyn PeerTransport> {
        self.transport.as_deref().ok_or_else(|| {
            MeshError::NegotiationTransport(format!("no transport for {}", self.peer_id))
        })
    }

    async fn release_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Transport close for {} failed: {}", self.peer_id, e);
            }
        }
    }

    /// New -> OfferSent
    pub async fn start_offer(&mut self, ctx: &mut NegotiationContext<'_>) -> Result<()> {
        if self.phase != NegotiationPhase::New {
            debug!(
                "Not offering to {}: already in {}",
                self.peer_id, self.phase
            );
            return Ok(());
        }

        self.role = NegotiationRole::Offerer;
        self.ensure_transport(ctx).await?;

        let transport = self.transport()?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        self.local_description = Some(offer.clone());
        self.set_phase(NegotiationPhase::OfferSent);
        ctx.emit(SignalBody::Offer(offer), &self.peer_id);
        info!("Sent offer to {}", self.peer_id);
        Ok(())
    }

    /// Apply an inbound offer, resolving glare by id comparison
    pub async fn apply_offer(
        &mut self,
        offer: SessionDescription,
        ctx: &mut NegotiationContext<'_>,
    ) -> Result<OfferOutcome> {
        match self.phase {
            NegotiationPhase::Closed => {
                debug!("Ignoring offer from {}: session closed", self.peer_id);
                Ok(OfferOutcome::Ignored)
            }
            NegotiationPhase::New => {
                self.answer(offer, ctx).await?;
                Ok(OfferOutcome::Answered)
            }
            NegotiationPhase::OfferSent => {
                if ctx.local_id < &self.peer_id {
                    info!(
                        "Glare with {}: keeping our offer ({} < {})",
                        self.peer_id, ctx.local_id, self.peer_id
                    );
                    return Ok(OfferOutcome::GlareIgnored);
                }

                info!(
                    "Glare with {}: discarding our offer and answering",
                    self.peer_id
                );
                // Remote candidates buffered so far belong to the offer we now answer
                self.release_transport().await;
                self.local_description = None;
                self.set_phase(NegotiationPhase::New);
                self.answer(offer, ctx).await?;
                Ok(OfferOutcome::GlareYielded)
            }
            NegotiationPhase::OfferReceived
            | NegotiationPhase::AnswerSent
            | NegotiationPhase::Stable => {
                if self.remote_description.as_ref().map(|d| &d.sdp) == Some(&offer.sdp) {
                    debug!("Duplicate offer from {} absorbed", self.peer_id);
                    return Ok(OfferOutcome::Duplicate);
                }
                Err(self.invalid_state("conflicting offer for an established session"))
            }
        }
    }

    /// New -> OfferReceived -> AnswerSent -> Stable
    async fn answer(
        &mut self,
        offer: SessionDescription,
        ctx: &mut NegotiationContext<'_>,
    ) -> Result<()> {
        self.role = NegotiationRole::Answerer;
        self.ensure_transport(ctx).await?;

        self.transport()?
            .set_remote_description(offer.clone())
            .await?;
        self.remote_description = Some(offer);
        self.set_phase(NegotiationPhase::OfferReceived);
        self.flush_pending_candidates().await;

        let transport = self.transport()?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.local_description = Some(answer.clone());

        self.set_phase(NegotiationPhase::AnswerSent);
        ctx.emit(SignalBody::Answer(answer), &self.peer_id);
        info!("Sent answer to {}", self.peer_id);

        self.set_phase(NegotiationPhase::Stable);
        Ok(())
    }

    /// OfferSent -> Stable
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<AnswerOutcome> {
        match self.phase {
            NegotiationPhase::Closed => {
                debug!("Ignoring answer from {}: session closed", self.peer_id);
                Ok(AnswerOutcome::Ignored)
            }
            NegotiationPhase::OfferSent => {
                self.transport()?
                    .set_remote_description(answer.clone())
                    .await?;
                self.remote_description = Some(answer);
                self.flush_pending_candidates().await;
                self.set_phase(NegotiationPhase::Stable);
                info!("Negotiation with {} complete", self.peer_id);
                Ok(AnswerOutcome::Applied)
            }
            NegotiationPhase::Stable
                if self.role == NegotiationRole::Offerer
                    && self.remote_description.as_ref().map(|d| &d.sdp) == Some(&answer.sdp) =>
            {
                debug!("Duplicate answer from {} absorbed", self.peer_id);
                Ok(AnswerOutcome::Duplicate)
            }
            NegotiationPhase::Stable => {
                Err(self.invalid_state("conflicting answer for an established session"))
            }
            NegotiationPhase::New
            | NegotiationPhase::OfferReceived
            | NegotiationPhase::AnswerSent => {
                Err(self.invalid_state("answer without a pending offer"))
            }
        }
    }

    /// Apply or buffer a remote candidate
    pub async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<CandidateOutcome> {
        if self.is_closed() {
            debug!("Ignoring candidate from {}: session closed", self.peer_id);
            return Ok(CandidateOutcome::Ignored);
        }
        if candidate.is_end_of_candidates() {
            return Ok(CandidateOutcome::Skipped);
        }
        if !self.phase.has_remote_description() {
            debug!(
                "Buffering candidate from {} ({} pending)",
                self.peer_id,
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push(candidate);
            return Ok(CandidateOutcome::Buffered);
        }

        self.transport()?.add_ice_candidate(candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        let Some(transport) = self.transport.as_deref() else {
            return;
        };

        debug!(
            "Applying {} buffered candidates from {}",
            pending.len(),
            self.peer_id
        );
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Dropping buffered candidate from {}: {}", self.peer_id, e);
            }
        }
    }

    /// Queue a locally gathered candidate for the peer; no-op once closed
    pub fn emit_local_candidate(&self, candidate: IceCandidate, ctx: &mut NegotiationContext<'_>) {
        if self.is_closed() {
            return;
        }
        ctx.emit(SignalBody::Candidate(candidate), &self.peer_id);
    }

    /// Back to New after a conflict: transport, buffer and descriptions dropped
    pub async fn reset(&mut self) {
        if self.is_closed() {
            return;
        }
        self.release_transport().await;
        self.pending_candidates.clear();
        self.local_description = None;
        self.remote_description = None;
        self.set_phase(NegotiationPhase::New);
    }

    /// Any -> Closed; releases the transport and drops buffered candidates
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.release_transport().await;
        self.pending_candidates.clear();
        self.set_phase(NegotiationPhase::Closed);
        info!("Session with {} closed", self.peer_id);
    }

    fn invalid_state(&self, reason: &str) -> MeshError {
        MeshError::InvalidNegotiationState {
            peer: self.peer_id.to_string(),
            phase: self.phase,
            reason: reason.to_string(),
        }
    }
}
