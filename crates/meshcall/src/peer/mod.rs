//! Mesh peer connection management
//!
//! Handles per-peer negotiation, restart recovery and the participant roster.

pub mod connection;
pub mod lifecycle;
pub mod manager;
pub mod roster;
pub mod snapshot;

pub use connection::{
    PeerConnectionState, PeerEvent, PeerEventSink, PeerFactory, RtcPeer, SignalingState,
    TrackSync, WebRtcPeer, WebRtcPeerFactory,
};
pub use lifecycle::{
    RecoveryAction, RecoveryEvent, RecoveryPhase, RecoveryPolicy, RecoveryState, TimerKind,
};
pub use manager::{initiates, MeshEvent, MeshManager, SessionContext};
pub use roster::{RemoteParticipantInfo, Roster};
pub use snapshot::{AggregateState, CallSnapshot, ParticipantView};
