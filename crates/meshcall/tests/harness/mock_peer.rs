//! Scripted peer connection for negotiation tests
//!
//! `MockPeer` follows the offer/answer state machine strictly: an operation
//! that a real stack would reject in the current signaling state returns an
//! error here too. Once both descriptions are in place it reports transport
//! progress according to its [`MockBehavior`]. Rollback can be switched off
//! to match stacks that refuse it.

use async_trait::async_trait;
use meshcall::media::{LocalTrack, MediaKind, RemoteTrack};
use meshcall::peer::{
    PeerConnectionState, PeerEvent, PeerEventSink, PeerFactory, RtcPeer, SignalingState,
    TrackSync,
};
use meshcall::signaling::{IceCandidate, SdpKind, SessionDescription};
use meshcall::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// How the transport behaves once negotiation completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Connect and deliver remote media
    Connects,
    /// Connect but never deliver media
    ConnectsSilently,
    /// Report a failed transport
    Fails,
    /// Report nothing
    Stalls,
}

#[derive(Debug)]
struct MockState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    offers: u32,
    answers: u32,
    rollbacks: u32,
    senders: HashMap<MediaKind, Option<String>>,
    syncs: Vec<(MediaKind, TrackSync)>,
    closed: bool,
    gathered: u32,
}

/// Peer connection double
pub struct MockPeer {
    peer_id: String,
    events: PeerEventSink,
    behavior: MockBehavior,
    can_roll_back: bool,
    state: Mutex<MockState>,
}

impl MockPeer {
    pub fn new(peer_id: &str, events: PeerEventSink, behavior: MockBehavior) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            events,
            behavior,
            can_roll_back: true,
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                applied_candidates: Vec::new(),
                offers: 0,
                answers: 0,
                rollbacks: 0,
                senders: HashMap::new(),
                syncs: Vec::new(),
                closed: false,
                gathered: 0,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Raise a connection event as if the stack reported it
    pub fn emit(&self, event: PeerEvent) {
        self.events.emit(event);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn offers(&self) -> u32 {
        self.state.lock().offers
    }

    pub fn answers(&self) -> u32 {
        self.state.lock().answers
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    pub fn has_remote(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Track id carried by the sender of `kind`, if a sender exists
    pub fn sender(&self, kind: MediaKind) -> Option<Option<String>> {
        self.state.lock().senders.get(&kind).cloned()
    }

    /// Sender changes in call order, unchanged syncs left out
    pub fn syncs(&self) -> Vec<(MediaKind, TrackSync)> {
        self.state.lock().syncs.clone()
    }

    fn gather_candidate(&self) {
        let n = {
            let mut state = self.state.lock();
            state.gathered += 1;
            state.gathered
        };
        self.events
            .emit(PeerEvent::LocalCandidate(candidate(&format!(
                "for-{}-{}",
                self.peer_id, n
            ))));
    }

    /// Both descriptions are installed and the state is stable
    fn negotiated(&self) {
        self.events
            .emit(PeerEvent::StateChanged(PeerConnectionState::Connecting));

        match self.behavior {
            MockBehavior::Connects => {
                self.events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                    id: format!("{}-audio", self.peer_id),
                    stream_id: format!("{}-stream", self.peer_id),
                    kind: MediaKind::Audio,
                    remote: None,
                }));
                self.events
                    .emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
            }
            MockBehavior::ConnectsSilently => {
                self.events
                    .emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
            }
            MockBehavior::Fails => {
                self.events
                    .emit(PeerEvent::StateChanged(PeerConnectionState::Failed));
            }
            MockBehavior::Stalls => {}
        }
    }

    fn reject(&self, what: &str, state: SignalingState) -> Error {
        Error::SdpError(format!("{} for {} in state {:?}", what, self.peer_id, state))
    }
}

/// Candidate with a recognisable attribute line
pub fn candidate(tag: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.1 9 typ host", tag),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[async_trait]
impl RtcPeer for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = {
            let mut state = self.state.lock();
            if state.closed || state.signaling != SignalingState::Stable {
                return Err(self.reject("create_offer", state.signaling));
            }
            state.offers += 1;

            let mut sdp = format!("v=0 mock-offer to {} #{}", self.peer_id, state.offers);
            for kind in [MediaKind::Audio, MediaKind::Video] {
                if state.senders.contains_key(&kind) {
                    sdp.push_str(&format!(" m={}", kind));
                }
            }

            let offer = SessionDescription::offer(sdp);
            state.local = Some(offer.clone());
            state.signaling = SignalingState::HaveLocalOffer;
            offer
        };

        self.gather_candidate();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = {
            let mut state = self.state.lock();
            if state.closed || state.signaling != SignalingState::HaveRemoteOffer {
                return Err(self.reject("create_answer", state.signaling));
            }
            state.answers += 1;

            let answer =
                SessionDescription::answer(format!("v=0 mock-answer to {}", self.peer_id));
            state.local = Some(answer.clone());
            state.signaling = SignalingState::Stable;
            answer
        };

        self.gather_candidate();
        self.negotiated();
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let completed = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.reject("set_remote_description", state.signaling));
            }
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.remote = Some(description);
                    false
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.remote = Some(description);
                    true
                }
                (_, current) => return Err(self.reject("set_remote_description", current)),
            }
        };

        if completed {
            self.negotiated();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !self.can_roll_back {
            return Err(self.reject("rollback", state.signaling));
        }
        match state.signaling {
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                state.signaling = SignalingState::Stable;
                state.rollbacks += 1;
                Ok(())
            }
            current => Err(self.reject("rollback", current)),
        }
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::IceCandidateError(format!(
                "candidate for {} before remote description",
                self.peer_id
            )));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn sync_track(&self, kind: MediaKind, track: Option<&LocalTrack>) -> Result<TrackSync> {
        let mut state = self.state.lock();
        let wanted = track.map(|t| t.id().to_string());

        let sync = match (state.senders.get(&kind), &wanted) {
            (None, None) => return Ok(TrackSync::Unchanged),
            (None, Some(_)) => TrackSync::Added,
            (Some(current), _) if *current == wanted => return Ok(TrackSync::Unchanged),
            (Some(_), Some(_)) => TrackSync::Replaced,
            (Some(_), None) => TrackSync::Detached,
        };

        state.senders.insert(kind, wanted);
        state.syncs.push((kind, sync));
        Ok(sync)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Factory recording every peer it creates
pub struct MockFactory {
    behavior: Mutex<MockBehavior>,
    rollback_supported: Mutex<bool>,
    created: Mutex<Vec<(String, Arc<MockPeer>)>>,
}

impl MockFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            rollback_supported: Mutex::new(true),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Behavior for peers created from now on
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Whether peers created from now on accept a rollback
    pub fn set_rollback_supported(&self, supported: bool) {
        *self.rollback_supported.lock() = supported;
    }

    /// Number of connections created for `peer_id`
    pub fn created(&self, peer_id: &str) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|(id, _)| id == peer_id)
            .count()
    }

    /// Most recent connection for `peer_id`
    pub fn peer(&self, peer_id: &str) -> Option<Arc<MockPeer>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == peer_id)
            .map(|(_, peer)| Arc::clone(peer))
    }

    /// Every connection created for `peer_id`, oldest first
    pub fn history(&self, peer_id: &str) -> Vec<Arc<MockPeer>> {
        self.created
            .lock()
            .iter()
            .filter(|(id, _)| id == peer_id)
            .map(|(_, peer)| Arc::clone(peer))
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<MockPeer>> {
        self.created
            .lock()
            .iter()
            .map(|(_, peer)| Arc::clone(peer))
            .collect()
    }
}

#[async_trait]
impl PeerFactory for MockFactory {
    async fn create(&self, peer_id: &str, events: PeerEventSink) -> Result<Arc<dyn RtcPeer>> {
        let behavior = *self.behavior.lock();
        let mut peer = MockPeer::new(peer_id, events, behavior);
        peer.can_roll_back = *self.rollback_supported.lock();
        let peer = Arc::new(peer);
        self.created
            .lock()
            .push((peer_id.to_string(), Arc::clone(&peer)));
        Ok(peer)
    }
}
