//! Signaling envelopes and their relay wire format

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Participant identity within a room
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh local id: `peer-` followed by 7 lowercase alphanumerics
    pub fn generate() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("peer-{}", &simple[..7]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// SDP type carried with a description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }

    /// Empty candidate line signals the end of gathering
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Kind-specific envelope content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    ParticipantJoined,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    ParticipantLeft,
}

impl SignalBody {
    /// Wire name of this kind
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::ParticipantJoined => "new-peer",
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::Candidate(_) => "candidate",
            SignalBody::ParticipantLeft => "peer-left",
        }
    }

    /// Membership notifications are broadcast and never target-filtered
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            SignalBody::ParticipantJoined | SignalBody::ParticipantLeft
        )
    }
}

/// Signaling envelope routed by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct SignalEnvelope {
    pub body: SignalBody,
    pub sender: ParticipantId,
    pub target: Option<ParticipantId>,
    pub room_id: Option<String>,
}

impl SignalEnvelope {
    /// Broadcast join announcement
    pub fn joined(sender: ParticipantId, room_id: impl Into<String>) -> Self {
        Self {
            body: SignalBody::ParticipantJoined,
            sender,
            target: None,
            room_id: Some(room_id.into()),
        }
    }

    /// Broadcast departure
    pub fn left(sender: ParticipantId, room_id: impl Into<String>) -> Self {
        Self {
            body: SignalBody::ParticipantLeft,
            sender,
            target: None,
            room_id: Some(room_id.into()),
        }
    }

    /// Envelope addressed to one participant
    pub fn to_peer(body: SignalBody, sender: ParticipantId, target: ParticipantId) -> Self {
        Self {
            body,
            sender,
            target: Some(target),
            room_id: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Loose frame as it travels through the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
    room_id: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    payload: Option<Value>,
) -> std::result::Result<T, String> {
    let value = payload
        .filter(|v| !v.is_null())
        .ok_or_else(|| format!("{} without payload", kind))?;
    serde_json::from_value(value).map_err(|e| format!("malformed {} payload: {}", kind, e))
}

impl TryFrom<WireEnvelope> for SignalEnvelope {
    type Error = String;

    fn try_from(wire: WireEnvelope) -> std::result::Result<Self, Self::Error> {
        let sender = wire
            .sender
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{} without sender", wire.kind))?;

        let body = match wire.kind.as_str() {
            "new-peer" => SignalBody::ParticipantJoined,
            "peer-left" => SignalBody::ParticipantLeft,
            "offer" => SignalBody::Offer(payload("offer", wire.payload)?),
            "answer" => SignalBody::Answer(payload("answer", wire.payload)?),
            "candidate" => SignalBody::Candidate(payload("candidate", wire.payload)?),
            other => return Err(format!("unknown message type: {}", other)),
        };

        Ok(Self {
            body,
            sender: ParticipantId::new(sender),
            target: wire.target.filter(|t| !t.is_empty()).map(ParticipantId::new),
            room_id: wire.room_id,
        })
    }
}

impl From<SignalEnvelope> for WireEnvelope {
    fn from(envelope: SignalEnvelope) -> Self {
        let kind = envelope.kind().to_string();
        // Serializing these plain structs into a Value cannot fail
        let payload = match envelope.body {
            SignalBody::Offer(desc) | SignalBody::Answer(desc) => serde_json::to_value(desc).ok(),
            SignalBody::Candidate(candidate) => serde_json::to_value(candidate).ok(),
            SignalBody::ParticipantJoined | SignalBody::ParticipantLeft => None,
        };
        Self {
            kind,
            payload,
            sender: Some(envelope.sender.0),
            target: envelope.target.map(|t| t.0),
            room_id: envelope.room_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_id_shape() {
        let id = ParticipantId::generate();
        let suffix = id.as_str().strip_prefix("peer-").unwrap();
        assert_eq!(suffix.len(), 7);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, ParticipantId::generate());
    }

    #[test]
    fn test_decode_offer_from_relay() {
        let text = json!({
            "type": "offer",
            "payload": {"type": "offer", "sdp": "v=0\r\n"},
            "target": "peer-b",
            "sender": "peer-a"
        })
        .to_string();

        let envelope = SignalEnvelope::from_json(&text).unwrap();
        assert_eq!(envelope.sender, ParticipantId::from("peer-a"));
        assert_eq!(envelope.target, Some(ParticipantId::from("peer-b")));
        assert_eq!(
            envelope.body,
            SignalBody::Offer(SessionDescription::offer("v=0\r\n"))
        );
    }

    #[test]
    fn test_decode_candidate_browser_shape() {
        let text = json!({
            "type": "candidate",
            "payload": {
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            },
            "target": "peer-b",
            "sender": "peer-a"
        })
        .to_string();

        let SignalBody::Candidate(candidate) = SignalEnvelope::from_json(&text).unwrap().body else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
        assert!(!candidate.is_end_of_candidates());
    }

    #[test]
    fn test_joined_has_no_target_or_payload() {
        let envelope = SignalEnvelope::joined("peer-a".into(), "r1");
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "new-peer", "sender": "peer-a", "roomId": "r1"})
        );
    }

    #[test]
    fn test_null_payload_tolerated_for_membership() {
        let envelope =
            SignalEnvelope::from_json(r#"{"type":"peer-left","sender":"peer-x","payload":null}"#).unwrap();
        assert_eq!(envelope.body, SignalBody::ParticipantLeft);
        assert!(envelope.body.is_membership());
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = SignalEnvelope::from_json(r#"{"type":"renegotiate","sender":"peer-a"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown message type"));
    }

    #[test]
    fn test_rejects_missing_sender() {
        assert!(SignalEnvelope::from_json(r#"{"type":"new-peer"}"#).is_err());
        assert!(SignalEnvelope::from_json(r#"{"type":"new-peer","sender":""}"#).is_err());
    }

    #[test]
    fn test_rejects_offer_without_payload() {
        let err = SignalEnvelope::from_json(r#"{"type":"offer","sender":"peer-a"}"#).unwrap_err();
        assert!(err.to_string().contains("offer without payload"));
    }

    #[test]
    fn test_encode_answer() {
        let envelope = SignalEnvelope::to_peer(
            SignalBody::Answer(SessionDescription::answer("v=0")),
            "peer-b".into(),
            "peer-a".into(),
        );
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["payload"], json!({"type": "answer", "sdp": "v=0"}));
        assert_eq!(value["target"], "peer-a");
        assert!(value.get("roomId").is_none());
    }
}
