//! Full-mesh negotiation
//!
//! One `PeerSession` per remote participant, owned by the registry and
//! driven by the orchestrator's single event loop.

pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod session;

pub use events::{Command, MeshEvent, MeshHandle, MeshObserver, NullObserver};
pub use orchestrator::SessionOrchestrator;
pub use registry::PeerSessionRegistry;
pub use session::{
    AnswerOutcome, CandidateOutcome, NegotiationPhase, NegotiationRole, OfferOutcome, PeerSession,
};
