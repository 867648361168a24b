//! Read-only projections of the mesh for the UI layer

use super::connection::PeerConnectionState;
use serde::Serialize;
use std::fmt;

/// Call-wide connection state derived from every peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateState {
    New,
    Connecting,
    Connected,
    Failed,
}

impl AggregateState {
    /// Connected if any peer is connected, else connecting if any is
    /// connecting, else failed if every peer is failed or disconnected,
    /// else new.
    pub fn from_states<'a, I>(states: I) -> Self
    where
        I: IntoIterator<Item = &'a PeerConnectionState>,
    {
        let mut any_connecting = false;
        let mut all_failed = true;
        let mut any = false;

        for state in states {
            any = true;
            match state {
                PeerConnectionState::Connected => return AggregateState::Connected,
                PeerConnectionState::Connecting => any_connecting = true,
                PeerConnectionState::Failed | PeerConnectionState::Disconnected => {}
                _ => all_failed = false,
            }
        }

        if any_connecting {
            AggregateState::Connecting
        } else if any && all_failed {
            AggregateState::Failed
        } else {
            AggregateState::New
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateState::New => "new",
            AggregateState::Connecting => "connecting",
            AggregateState::Connected => "connected",
            AggregateState::Failed => "failed",
        }
    }
}

impl fmt::Display for AggregateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote participant as the UI sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantView {
    pub peer_id: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
    /// Id of the remote stream, `None` until media arrives
    pub stream_id: Option<String>,
    #[serde(serialize_with = "serialize_state")]
    pub connection_state: PeerConnectionState,
}

impl ParticipantView {
    pub fn has_stream(&self) -> bool {
        self.stream_id.is_some()
    }
}

fn serialize_state<S: serde::Serializer>(
    state: &PeerConnectionState,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(state.as_str())
}

/// Everything the UI needs to render the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub call_active: bool,
    pub connection_state: AggregateState,
    pub self_id: Option<String>,
    pub participants: Vec<ParticipantView>,
    /// Last error reported by the signaling server
    pub error: Option<String>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            call_active: false,
            connection_state: AggregateState::New,
            self_id: None,
            participants: Vec::new(),
            error: None,
        }
    }
}
