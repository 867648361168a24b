//! Mesh call test harness
//!
//! Provides infrastructure for integration testing without real media or a
//! real room server:
//! - Scripted peer connections behind the `RtcPeer` seam
//! - In-memory signaling transport and a recording signaling sink
//! - A WebSocket echo server on a random port
//! - `MeshNode`, a manager plus its event queue, and a relay that plays the
//!   room server between two nodes
//!
//! Basic usage pattern:
//!
//! 1. Create nodes with `MeshNode::new(id, behavior)`
//! 2. Announce identities with `joined_self` / `joined`
//! 3. Give nodes local media with `MeshNode::start_media`
//! 4. Call `exchange(&mut a, &mut b)` to run negotiation to quiescence

#![allow(dead_code)]

pub mod memory_socket;
pub mod mock_peer;
pub mod test_server;

use meshcall::media::{LocalMediaStream, MediaDevices, MediaKind, SyntheticDevices};
use meshcall::peer::{MeshEvent, MeshManager, RecoveryPolicy, SessionContext};
use meshcall::signaling::{SignalType, SignalingMessage};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub use memory_socket::{accept, MemoryConnector, RecordingSink, ServerEnd};
pub use mock_peer::{candidate, MockBehavior, MockFactory, MockPeer};
pub use test_server::EchoServer;

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,meshcall=debug")
        .with_test_writer()
        .try_init();
}

/// `joined` frame announcing our own session
pub fn joined_self(self_id: &str) -> SignalingMessage {
    serde_json::from_value(json!({ "type": "joined", "sender_id": self_id }))
        .expect("joined frame")
}

/// `joined` frame announcing a remote participant
pub fn joined(peer_id: &str, user_id: Option<&str>, name: &str) -> SignalingMessage {
    let mut payload = json!({ "peer_id": peer_id, "display_name": name });
    if let Some(user_id) = user_id {
        payload["user_id"] = json!(user_id);
    }
    serde_json::from_value(json!({ "type": "joined", "sender_id": peer_id, "payload": payload }))
        .expect("joined frame")
}

/// `peer-left` frame emitted by the server
pub fn peer_left(peer_id: &str) -> SignalingMessage {
    serde_json::from_value(json!({ "type": "peer-left", "payload": { "peer_id": peer_id } }))
        .expect("peer-left frame")
}

/// Local stream backed by synthetic tracks
pub async fn synthetic_stream(audio: bool, video: bool) -> LocalMediaStream {
    let devices = SyntheticDevices::new("local");
    let audio = if audio {
        Some(devices.open(MediaKind::Audio).await.expect("audio track"))
    } else {
        None
    };
    let video = if video {
        Some(devices.open(MediaKind::Video).await.expect("video track"))
    } else {
        None
    };
    LocalMediaStream::new(audio, video)
}

/// One participant: manager, its event queue and its outbound signaling
pub struct MeshNode {
    pub id: String,
    pub manager: MeshManager,
    pub events: tokio::sync::mpsc::UnboundedReceiver<MeshEvent>,
    pub sink: Arc<RecordingSink>,
    pub factory: Arc<MockFactory>,
}

impl MeshNode {
    pub fn new(id: &str, behavior: MockBehavior) -> Self {
        Self::with_policy(id, behavior, RecoveryPolicy::default())
    }

    pub fn with_policy(id: &str, behavior: MockBehavior, policy: RecoveryPolicy) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let factory = Arc::new(MockFactory::new(behavior));
        let (manager, events) = MeshManager::new(
            SessionContext::new("room", id),
            factory.clone(),
            sink.clone(),
            policy,
        );

        Self {
            id: id.to_string(),
            manager,
            events,
            sink,
            factory,
        }
    }

    /// Apply one inbound envelope
    pub async fn receive(&mut self, msg: SignalingMessage) {
        self.manager
            .handle_signaling(msg)
            .await
            .expect("signaling message applied");
    }

    pub async fn start_media(&mut self) {
        let stream = synthetic_stream(true, false).await;
        self.manager.set_local_stream(Some(stream)).await;
    }

    /// Feed every queued event back into the manager
    pub async fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.manager.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Wait for the next event, giving up after 30s of (possibly paused) time
    pub async fn next_event(&mut self) -> Option<MeshEvent> {
        tokio::time::timeout(Duration::from_secs(30), self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Outbound envelopes of one type, without draining
    pub fn sent_of(&self, kind: SignalType) -> Vec<SignalingMessage> {
        self.sink
            .sent()
            .into_iter()
            .filter(|m| m.kind == kind)
            .collect()
    }

    pub fn peer(&self, peer_id: &str) -> Arc<MockPeer> {
        self.factory.peer(peer_id).expect("peer connection created")
    }
}

/// Deliver `msg` from `from` as the room server would: stamp the sender and
/// drop frames addressed to someone else
pub async fn deliver(from: &str, mut msg: SignalingMessage, to: &mut MeshNode) {
    if let Some(target) = &msg.target_id {
        if target != &to.id {
            return;
        }
    }
    msg.sender_id = Some(from.to_string());
    to.receive(msg).await;
}

/// Relay signaling and connection events between two nodes until quiet
pub async fn exchange(a: &mut MeshNode, b: &mut MeshNode) {
    for _ in 0..64 {
        let mut progressed = a.drain_events().await + b.drain_events().await;

        for msg in a.sink.take() {
            progressed += 1;
            deliver(&a.id.clone(), msg, b).await;
        }
        for msg in b.sink.take() {
            progressed += 1;
            deliver(&b.id.clone(), msg, a).await;
        }

        if progressed == 0 {
            return;
        }
    }
    panic!("signaling between {} and {} did not settle", a.id, b.id);
}

/// Two nodes that know each other and both have local media
pub async fn introduced_pair(a_id: &str, b_id: &str, behavior: MockBehavior) -> (MeshNode, MeshNode) {
    let mut a = MeshNode::new(a_id, behavior);
    let mut b = MeshNode::new(b_id, behavior);

    a.start_media().await;
    b.start_media().await;

    a.receive(joined_self(a_id)).await;
    b.receive(joined_self(b_id)).await;
    a.receive(joined(b_id, None, b_id)).await;
    b.receive(joined(a_id, None, a_id)).await;

    (a, b)
}
