//! Room signaling
//!
//! - `protocol`: JSON envelopes exchanged with the room server
//! - `dispatch`: routes decoded envelopes to a [`SignalingHandler`]
//! - `socket`: self-healing WebSocket with an outbound queue

pub mod dispatch;
pub mod protocol;
pub mod socket;

pub use dispatch::{dispatch, interpret, JoinedPayload, SignalingEvent, SignalingHandler};
pub use protocol::{
    ChatMessage, IceCandidate, InboundFrame, SdpKind, SessionDescription, SignalType,
    SignalingMessage,
};
pub use socket::{
    Connector, FrameSink, FrameStream, SignalingSink, SignalingSocket, SocketStatus,
    WebSocketConnector,
};
