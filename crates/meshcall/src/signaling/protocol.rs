//! Signaling wire protocol
//!
//! Every frame on the room socket is a JSON object with a `type` field. Peer
//! negotiation frames decode into [`SignalingMessage`]; `chat` frames decode
//! into [`ChatMessage`] and never reach the negotiation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frame type carried by a signaling envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    /// SDP offer, unicast via `target_id`
    Offer,
    /// SDP answer, unicast via `target_id`
    Answer,
    /// Trickled ICE candidate, unicast via `target_id`
    IceCandidate,
    /// A participant (possibly ourselves) entered the room
    Joined,
    /// A participant left the room
    Leave,
    /// The server noticed a participant's socket went away
    PeerLeft,
    /// Anything this client does not understand
    #[serde(other)]
    Unknown,
}

/// SDP type as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged in offer/answer frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,

    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate descriptor, field names follow `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the m-line this candidate belongs to
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    /// ICE ufrag the candidate was gathered under
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Signaling envelope
///
/// Exactly one of `sdp`, `candidate` or `payload` is meaningful for a given
/// `type`. A present `error` overrides the type entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    /// Frame type
    #[serde(rename = "type")]
    pub kind: SignalType,

    /// Session description (offer/answer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,

    /// ICE candidate (ice-candidate)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,

    /// Originating peer, stamped by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,

    /// Destination peer; absent means broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    /// Free-form metadata (joined/leave)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,

    /// Server-reported error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignalingMessage {
    fn bare(kind: SignalType) -> Self {
        Self {
            kind,
            sdp: None,
            candidate: None,
            sender_id: None,
            target_id: None,
            payload: None,
            error: None,
        }
    }

    /// Offer addressed to `target`
    pub fn offer(target: &str, sdp: impl Into<String>) -> Self {
        Self {
            sdp: Some(SessionDescription::offer(sdp)),
            target_id: Some(target.to_string()),
            ..Self::bare(SignalType::Offer)
        }
    }

    /// Answer addressed to `target`
    pub fn answer(target: &str, sdp: impl Into<String>) -> Self {
        Self {
            sdp: Some(SessionDescription::answer(sdp)),
            target_id: Some(target.to_string()),
            ..Self::bare(SignalType::Answer)
        }
    }

    /// Local ICE candidate addressed to `target`
    pub fn ice_candidate(target: &str, candidate: IceCandidate) -> Self {
        Self {
            candidate: Some(candidate),
            target_id: Some(target.to_string()),
            ..Self::bare(SignalType::IceCandidate)
        }
    }

    /// Leave notification, broadcast unless a target is given
    pub fn leave(target: Option<&str>) -> Self {
        Self {
            target_id: target.map(str::to_string),
            ..Self::bare(SignalType::Leave)
        }
    }

    /// String field from the payload map
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get(key))
            .and_then(Value::as_str)
    }

    /// Serialize message to JSON value
    pub fn to_value(&self) -> crate::Result<Value> {
        serde_json::to_value(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    /// Serialize message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    /// Parse message from JSON value
    pub fn from_value(value: Value) -> crate::Result<Self> {
        serde_json::from_value(value).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }
}

/// Frame type used for room chat
pub const CHAT_FRAME_TYPE: &str = "chat";

/// Sender shown when a chat frame carries none
pub const DEFAULT_CHAT_SENDER: &str = "Participant";

/// Room chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique id used for de-duplication
    pub id: String,

    /// Display name of the author
    pub sender: String,

    /// Message text, trimmed
    pub message: String,

    /// When the author sent it
    pub timestamp: DateTime<Utc>,
}

/// Lenient inbound form of a chat payload
#[derive(Debug, Deserialize)]
struct ChatPayload {
    id: Option<String>,
    sender: Option<String>,
    message: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// New outgoing message, or `None` if the text is blank
    pub fn compose(sender: &str, text: &str) -> Option<Self> {
        let message = text.trim();
        if message.is_empty() {
            return None;
        }

        let sender = if sender.trim().is_empty() {
            DEFAULT_CHAT_SENDER
        } else {
            sender
        };

        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Wire frame: `{"type": "chat", "payload": {...}}`
    pub fn to_frame(&self) -> crate::Result<Value> {
        let payload = serde_json::to_value(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize chat message: {}", e))
        })?;

        Ok(serde_json::json!({ "type": CHAT_FRAME_TYPE, "payload": payload }))
    }

    fn from_payload(payload: ChatPayload) -> crate::Result<Self> {
        let message = payload
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                crate::Error::SerializationError("Chat frame has no message text".to_string())
            })?
            .to_string();

        Ok(Self {
            id: payload
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            sender: payload
                .sender
                .unwrap_or_else(|| DEFAULT_CHAT_SENDER.to_string()),
            message,
            timestamp: payload.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Peer negotiation or roster envelope
    Signal(SignalingMessage),
    /// Room chat
    Chat(ChatMessage),
}

impl InboundFrame {
    /// Split a raw frame into chat or signaling
    pub fn from_value(mut value: Value) -> crate::Result<Self> {
        let is_chat = value.get("type").and_then(Value::as_str) == Some(CHAT_FRAME_TYPE);
        if !is_chat {
            return SignalingMessage::from_value(value).map(InboundFrame::Signal);
        }

        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .ok_or_else(|| {
                crate::Error::SerializationError("Chat frame has no payload".to_string())
            })?;

        let payload: ChatPayload = serde_json::from_value(payload).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to deserialize chat payload: {}", e))
        })?;

        ChatMessage::from_payload(payload).map(InboundFrame::Chat)
    }
}
