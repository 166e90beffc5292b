use thiserror::Error;

use crate::mesh::session::NegotiationPhase;

/// Crate-wide error type
///
/// `MediaAcquisition` and `RelayConnection` are session-global: they end
/// the whole room session. Every other variant is local to one peer link
/// and never propagates past the orchestrator.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("Relay connection error: {0}")]
    RelayConnection(String),

    #[error("Invalid negotiation state for {peer} in {phase}: {reason}")]
    InvalidNegotiationState {
        peer: String,
        phase: NegotiationPhase,
        reason: String,
    },

    #[error("Candidate rejected: {0}")]
    CandidateApply(String),

    #[error("Negotiation transport error: {0}")]
    NegotiationTransport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Already joined room {0}")]
    AlreadyJoined(String),

    #[error("Not joined to a room")]
    NotJoined,
}

impl MeshError {
    /// Whether this error ends the whole room session rather than one peer link
    pub fn is_session_global(&self) -> bool {
        matches!(
            self,
            MeshError::MediaAcquisition(_) | MeshError::RelayConnection(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_classification() {
        assert!(MeshError::MediaAcquisition("denied".into()).is_session_global());
        assert!(MeshError::RelayConnection("reset".into()).is_session_global());
        assert!(!MeshError::CandidateApply("bad".into()).is_session_global());
        assert!(!MeshError::NegotiationTransport("ice failed".into()).is_session_global());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = MeshError::InvalidNegotiationState {
            peer: "peer-b".to_string(),
            phase: NegotiationPhase::New,
            reason: "answer without a pending offer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid negotiation state for peer-b in new: answer without a pending offer"
        );
    }
}
