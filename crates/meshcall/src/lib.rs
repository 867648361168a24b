//! Full-mesh WebRTC call client
//!
//! This crate joins a room on a signaling server and keeps one WebRTC peer
//! connection per remote participant, negotiating them with the "perfect
//! negotiation" pattern so simultaneous offers never deadlock.
//!
//! # Features
//!
//! - **Mesh topology**: one connection context per remote participant
//! - **Deterministic initiation**: the lexicographically smaller peer id offers
//! - **Glare handling**: colliding offers are rolled back on both sides
//! - **Candidate buffering**: trickled ICE candidates wait for a remote description
//! - **Bounded recovery**: failed or silent connections are rebuilt up to 3 times
//! - **Self-healing signaling**: the WebSocket redials and replays queued frames
//! - **Room chat**: de-duplicated chat log carried over the signaling channel
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  CallHandle (UI / CLI)                                 │
//! │  ↓ commands               ↑ CallSnapshot (watch)       │
//! │  CallSession task                                      │
//! │  ├─ SignalingSocket (JSON over WebSocket, reconnects)  │
//! │  ├─ MeshManager                                        │
//! │  │   ├─ Roster (remote participants)                   │
//! │  │   ├─ RtcPeer per participant (webrtc-rs)            │
//! │  │   └─ RecoveryState per participant                  │
//! │  └─ LocalMedia (current stream, audio/video toggles)   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meshcall::MeshCallConfig;
//!
//! let config = MeshCallConfig::new("ws://localhost:8080", "standup", "Alice");
//! assert!(config.validate().is_ok());
//! assert_eq!(
//!     config.room_socket_url().unwrap().as_str(),
//!     "ws://localhost:8080/api/rooms/standup/ws?name=Alice"
//! );
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use meshcall::{CallSession, LocalMedia, MeshCallConfig, SyntheticDevices};
//!
//! # async fn example() -> meshcall::Result<()> {
//! let config = MeshCallConfig::new("ws://localhost:8080", "standup", "Alice");
//!
//! let media = LocalMedia::new();
//! media.acquire(&SyntheticDevices::new("alice"), true, true).await;
//!
//! let call = CallSession::websocket(&config, media.subscribe())?;
//! call.start_call(None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod signaling;

pub use call::{CallHandle, CallSession};
pub use config::{ConfigOptions, MeshCallConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use media::{
    LocalMedia, LocalMediaState, LocalMediaStream, LocalTrack, MediaDevices, MediaError,
    MediaKind, RemoteStream, RemoteTrack, SyntheticDevices,
};
pub use peer::{
    AggregateState, CallSnapshot, MeshEvent, MeshManager, ParticipantView, PeerConnectionState,
    RecoveryPolicy, SessionContext,
};
pub use signaling::{ChatMessage, SignalingMessage, SignalingSocket, SocketStatus};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
