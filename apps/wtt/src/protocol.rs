use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Maximum encoded size of a single signaling envelope. Connections sending
/// anything larger are closed by the relay.
pub const MAX_ENVELOPE_BYTES: usize = 10 * 1024;

/// Discriminator for a signaling envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A host claiming its identity on the relay.
    Register,
    /// An SDP offer from a client to a host.
    Offer,
    /// An SDP answer from a host back to a client.
    Answer,
    /// A trickled ICE candidate, either direction.
    Candidate,
    /// A human-readable failure report.
    Error,
}

/// One signaling message. The relay reads `kind`, `sender_id` and
/// `target_id` only; `payload` is forwarded untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub payload: Value,
    /// Optional correlation identifier, echoed back on error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Payload carried by `offer` and `answer` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: RTCSessionDescription,
}

/// Payload carried by `candidate` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: RTCIceCandidateInit,
}

impl Envelope {
    pub fn register(sender_id: &str) -> Self {
        Self {
            kind: EnvelopeKind::Register,
            sender_id: sender_id.to_string(),
            target_id: String::new(),
            payload: Value::Null,
            message_id: None,
        }
    }

    pub fn offer(sender_id: &str, target_id: &str, sdp: RTCSessionDescription) -> Self {
        Self::described(EnvelopeKind::Offer, sender_id, target_id, sdp)
    }

    pub fn answer(sender_id: &str, target_id: &str, sdp: RTCSessionDescription) -> Self {
        Self::described(EnvelopeKind::Answer, sender_id, target_id, sdp)
    }

    pub fn candidate(sender_id: &str, target_id: &str, candidate: RTCIceCandidateInit) -> Self {
        Self {
            kind: EnvelopeKind::Candidate,
            sender_id: sender_id.to_string(),
            target_id: target_id.to_string(),
            payload: serde_json::to_value(CandidatePayload { candidate })
                .unwrap_or(Value::Null),
            message_id: None,
        }
    }

    /// Build an error reply addressed to `target_id`. `message_id` carries
    /// the correlation id of the envelope that failed, when present.
    pub fn error(target_id: &str, message: &str, message_id: Option<String>) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            sender_id: String::new(),
            target_id: target_id.to_string(),
            payload: Value::String(message.to_string()),
            message_id,
        }
    }

    fn described(
        kind: EnvelopeKind,
        sender_id: &str,
        target_id: &str,
        sdp: RTCSessionDescription,
    ) -> Self {
        Self {
            kind,
            sender_id: sender_id.to_string(),
            target_id: target_id.to_string(),
            payload: serde_json::to_value(SdpPayload { sdp }).unwrap_or(Value::Null),
            message_id: None,
        }
    }

    /// Decode the payload of an `offer` or `answer` envelope.
    pub fn session_description(&self) -> Result<RTCSessionDescription, serde_json::Error> {
        serde_json::from_value::<SdpPayload>(self.payload.clone()).map(|p| p.sdp)
    }

    /// Decode the payload of a `candidate` envelope.
    pub fn ice_candidate(&self) -> Result<RTCIceCandidateInit, serde_json::Error> {
        serde_json::from_value::<CandidatePayload>(self.payload.clone()).map(|p| p.candidate)
    }

    /// The human-readable message of an `error` envelope.
    pub fn error_message(&self) -> String {
        match &self.payload {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        }
    }
}
