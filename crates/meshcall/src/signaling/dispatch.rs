//! Routing of decoded signaling envelopes to typed handlers

use super::protocol::{IceCandidate, SessionDescription, SignalType, SignalingMessage};
use crate::Result;
use async_trait::async_trait;
use tracing::warn;

/// A participant announcement decoded from a `joined` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedPayload {
    /// Routing id of the participant
    pub peer_id: String,
    /// Stable identity across reconnects, if the server knows one
    pub user_id: Option<String>,
    /// Display name
    pub name: Option<String>,
    /// True when this announces our own session
    pub is_self: bool,
}

/// Interpreted signaling event
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Offer {
        from: String,
        sdp: SessionDescription,
    },
    Answer {
        from: String,
        sdp: SessionDescription,
    },
    IceCandidate {
        from: String,
        candidate: IceCandidate,
    },
    UserJoined(JoinedPayload),
    UserLeft {
        peer_id: String,
    },
    Error(String),
}

/// Receiver of interpreted signaling events
#[async_trait]
pub trait SignalingHandler: Send {
    async fn on_offer(&mut self, from: String, sdp: SessionDescription) -> Result<()>;

    async fn on_answer(&mut self, from: String, sdp: SessionDescription) -> Result<()>;

    async fn on_ice_candidate(&mut self, from: String, candidate: IceCandidate) -> Result<()>;

    async fn on_user_joined(&mut self, joined: JoinedPayload) -> Result<()>;

    async fn on_user_leave(&mut self, peer_id: String) -> Result<()>;

    async fn on_error(&mut self, error: String) -> Result<()>;
}

/// Interpret an envelope
///
/// Returns `None` for frames that cannot be routed (unknown type, missing
/// sender or body); those are logged and dropped.
pub fn interpret(mut msg: SignalingMessage) -> Option<SignalingEvent> {
    if let Some(error) = msg.error.take() {
        return Some(SignalingEvent::Error(error));
    }

    match msg.kind {
        SignalType::Offer | SignalType::Answer => {
            let (Some(from), Some(sdp)) = (msg.sender_id, msg.sdp) else {
                warn!("Dropping {:?} without sender_id or sdp", msg.kind);
                return None;
            };
            if msg.kind == SignalType::Offer {
                Some(SignalingEvent::Offer { from, sdp })
            } else {
                Some(SignalingEvent::Answer { from, sdp })
            }
        }
        SignalType::IceCandidate => {
            let (Some(from), Some(candidate)) = (msg.sender_id, msg.candidate) else {
                warn!("Dropping ice-candidate without sender_id or candidate");
                return None;
            };
            Some(SignalingEvent::IceCandidate { from, candidate })
        }
        SignalType::Joined => {
            let payload_peer = msg.payload_str("peer_id").map(str::to_string);
            let user_id = msg.payload_str("user_id").map(str::to_string);
            let name = msg
                .payload_str("display_name")
                .or_else(|| msg.payload_str("name"))
                .map(str::to_string);
            let is_self = payload_peer.is_none();

            let Some(peer_id) = payload_peer.or(msg.sender_id) else {
                warn!("Dropping joined frame without peer_id or sender_id");
                return None;
            };

            Some(SignalingEvent::UserJoined(JoinedPayload {
                peer_id,
                user_id,
                name,
                is_self,
            }))
        }
        SignalType::Leave | SignalType::PeerLeft => {
            let peer_id = msg
                .payload_str("peer_id")
                .map(str::to_string)
                .or(msg.sender_id);
            let Some(peer_id) = peer_id else {
                warn!("Dropping {:?} frame without peer id", msg.kind);
                return None;
            };
            Some(SignalingEvent::UserLeft { peer_id })
        }
        SignalType::Unknown => {
            warn!("Ignoring signaling frame of unknown type");
            None
        }
    }
}

/// Route an envelope to exactly one handler method
pub async fn dispatch<H>(msg: SignalingMessage, handler: &mut H) -> Result<()>
where
    H: SignalingHandler + ?Sized,
{
    let Some(event) = interpret(msg) else {
        return Ok(());
    };

    match event {
        SignalingEvent::Offer { from, sdp } => handler.on_offer(from, sdp).await,
        SignalingEvent::Answer { from, sdp } => handler.on_answer(from, sdp).await,
        SignalingEvent::IceCandidate { from, candidate } => {
            handler.on_ice_candidate(from, candidate).await
        }
        SignalingEvent::UserJoined(joined) => handler.on_user_joined(joined).await,
        SignalingEvent::UserLeft { peer_id } => handler.on_user_leave(peer_id).await,
        SignalingEvent::Error(error) => handler.on_error(error).await,
    }
}
