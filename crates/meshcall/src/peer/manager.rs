//! Mesh peer connection management
//!
//! [`MeshManager`] keeps exactly one connection context per remote
//! participant and drives offer/answer, candidate buffering, track
//! reconciliation and restart recovery. It is owned by a single task: every
//! signaling frame, connection event and timer is applied through `&mut self`,
//! so per-peer state is never mutated concurrently.

use super::connection::{
    PeerConnectionState, PeerEvent, PeerEventSink, PeerFactory, RtcPeer, SignalingState,
    TrackSync,
};
use super::lifecycle::{
    PeerRecovery, RecoveryAction, RecoveryEvent, RecoveryPolicy, RecoveryState, Timer, TimerKind,
};
use super::roster::{RemoteParticipantInfo, Roster};
use super::snapshot::{AggregateState, CallSnapshot, ParticipantView};
use crate::media::{LocalMediaStream, MediaKind, RemoteStream};
use crate::signaling::dispatch::{dispatch, JoinedPayload, SignalingHandler};
use crate::signaling::protocol::{IceCandidate, SessionDescription, SignalingMessage};
use crate::signaling::socket::SignalingSink;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event fed back into the manager's loop
#[derive(Debug)]
pub enum MeshEvent {
    /// Callback from a peer connection
    Peer {
        peer_id: String,
        generation: u64,
        event: PeerEvent,
    },
    /// Recovery timer fired
    Timer {
        peer_id: String,
        kind: TimerKind,
        token: u64,
    },
}

/// Per-call identity
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub room_id: String,
    pub display_name: String,
    /// Our own peer id, assigned by the server on join
    pub self_id: Option<String>,
}

impl SessionContext {
    pub fn new(room_id: &str, display_name: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            self_id: None,
        }
    }
}

/// Whether `self_id` sends the initial offer to `peer_id`
///
/// The lexicographically smaller id initiates, so exactly one side of every
/// pair offers.
pub fn initiates(self_id: &str, peer_id: &str) -> bool {
    self_id < peer_id
}

struct PeerEntry {
    generation: u64,
    peer: Arc<dyn RtcPeer>,
    /// A local offer is being created
    making_offer: bool,
    /// A remote answer is being applied; candidates must wait
    setting_remote_answer: bool,
    /// Candidates received before a usable remote description, in receipt order
    pending_candidates: VecDeque<IceCandidate>,
}

/// Full-mesh connection manager and participant roster
pub struct MeshManager {
    session: SessionContext,
    factory: Arc<dyn PeerFactory>,
    signaling: Arc<dyn SignalingSink>,
    policy: RecoveryPolicy,
    events_tx: mpsc::UnboundedSender<MeshEvent>,

    peers: HashMap<String, PeerEntry>,
    roster: Roster,
    remote_streams: HashMap<String, RemoteStream>,
    connection_states: HashMap<String, PeerConnectionState>,
    recovery: HashMap<String, PeerRecovery>,

    local_stream: Option<LocalMediaStream>,
    next_generation: u64,
    next_timer_token: u64,
    last_error: Option<String>,
}

impl MeshManager {
    /// Create a manager
    ///
    /// Returns the manager and the receiver of its [`MeshEvent`]s; the owner
    /// must feed every received event back through
    /// [`handle_event`](Self::handle_event).
    pub fn new(
        session: SessionContext,
        factory: Arc<dyn PeerFactory>,
        signaling: Arc<dyn SignalingSink>,
        policy: RecoveryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = Self {
            session,
            factory,
            signaling,
            policy,
            events_tx,
            peers: HashMap::new(),
            roster: Roster::new(),
            remote_streams: HashMap::new(),
            connection_states: HashMap::new(),
            recovery: HashMap::new(),
            local_stream: None,
            next_generation: 0,
            next_timer_token: 0,
            last_error: None,
        };

        (manager, events_rx)
    }

    // ===== Read-only projections =====

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn self_id(&self) -> Option<&str> {
        self.session.self_id.as_deref()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Whether a connection context exists for `peer_id`
    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connection_state(&self, peer_id: &str) -> Option<PeerConnectionState> {
        self.connection_states.get(peer_id).copied()
    }

    pub fn remote_stream(&self, peer_id: &str) -> Option<&RemoteStream> {
        self.remote_streams.get(peer_id)
    }

    pub fn remote_stream_count(&self) -> usize {
        self.remote_streams.len()
    }

    pub fn recovery_state(&self, peer_id: &str) -> Option<RecoveryState> {
        self.recovery.get(peer_id).map(|r| r.state)
    }

    /// Candidates waiting for a remote description
    pub fn pending_candidates(&self, peer_id: &str) -> usize {
        self.peers
            .get(peer_id)
            .map(|e| e.pending_candidates.len())
            .unwrap_or(0)
    }

    /// Armed recovery timers across all peers
    pub fn pending_timers(&self) -> usize {
        self.recovery.values().map(PeerRecovery::pending_timers).sum()
    }

    pub fn local_stream(&self) -> Option<&LocalMediaStream> {
        self.local_stream.as_ref()
    }

    pub fn aggregate_state(&self) -> AggregateState {
        AggregateState::from_states(self.connection_states.values())
    }

    /// Snapshot for rendering
    pub fn snapshot(&self) -> CallSnapshot {
        let connection_state = self.aggregate_state();

        let participants = self
            .roster
            .iter()
            .map(|info| ParticipantView {
                peer_id: info.peer_id.clone(),
                user_id: info.user_id.clone(),
                name: info.name.clone(),
                stream_id: self.remote_streams.get(&info.peer_id).map(|s| s.id.clone()),
                connection_state: self
                    .connection_states
                    .get(&info.peer_id)
                    .copied()
                    .unwrap_or(PeerConnectionState::New),
            })
            .collect();

        CallSnapshot {
            call_active: connection_state == AggregateState::Connected,
            connection_state,
            self_id: self.session.self_id.clone(),
            participants,
            error: self.last_error.clone(),
        }
    }

    // ===== Inputs =====

    /// Apply one decoded signaling envelope
    pub async fn handle_signaling(&mut self, msg: SignalingMessage) -> Result<()> {
        dispatch(msg, self).await
    }

    /// Apply one connection or timer event
    pub async fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Peer {
                peer_id,
                generation,
                event,
            } => {
                let current = self.peers.get(&peer_id).map(|e| e.generation);
                if current != Some(generation) {
                    debug!("Ignoring event from replaced connection to {}", peer_id);
                    return;
                }
                self.apply_peer_event(&peer_id, event).await;
            }
            MeshEvent::Timer {
                peer_id,
                kind,
                token,
            } => {
                let Some(recovery) = self.recovery.get_mut(&peer_id) else {
                    return;
                };
                let slot = recovery.slot(kind);
                if slot.as_ref().map(|t| t.token) != Some(token) {
                    debug!("Ignoring cancelled {:?} timer for {}", kind, peer_id);
                    return;
                }
                // Already fired, nothing to abort
                slot.take();

                let event = match kind {
                    TimerKind::Watchdog => {
                        info!("No remote media from {} before the watchdog expired", peer_id);
                        RecoveryEvent::WatchdogExpired
                    }
                    TimerKind::Restart => RecoveryEvent::RestartTimerFired,
                };
                self.drive_recovery(&peer_id, event).await;
            }
        }
    }

    /// Replace the local stream and reconcile every peer's senders
    ///
    /// Existing connections are kept; senders are swapped in place. A sender
    /// added to an established connection is renegotiated from this side,
    /// whichever side initiated the pair.
    pub async fn set_local_stream(&mut self, stream: Option<LocalMediaStream>) {
        self.local_stream = stream;

        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in &peer_ids {
            if self.sync_peer_tracks(peer_id).await {
                if let Err(e) = self.renegotiate(peer_id).await {
                    warn!("Renegotiation with {} failed: {}", peer_id, e);
                }
            }
        }

        for peer_id in self.known_peer_ids() {
            if let Err(e) = self.maybe_initiate(&peer_id).await {
                warn!("Failed to start negotiation with {}: {}", peer_id, e);
            }
        }
    }

    /// Start negotiating with one peer, or every roster peer
    ///
    /// Only pairs where we are the initiating side send an offer; the other
    /// side waits for the remote offer.
    pub async fn start_call(&mut self, target: Option<&str>) -> Result<()> {
        if self.local_stream.is_none() {
            return Err(Error::NoLocalMedia(
                "start local media before starting the call".to_string(),
            ));
        }

        let targets = match target {
            Some(peer_id) => vec![peer_id.to_string()],
            None => self.roster.peer_ids(),
        };

        for peer_id in targets {
            if self.is_self(&peer_id) {
                continue;
            }
            self.ensure_peer(&peer_id).await?;
            self.maybe_initiate(&peer_id).await?;
        }

        Ok(())
    }

    /// Leave the call and tear everything down
    ///
    /// Sends a leave frame, closes every connection, cancels every timer and
    /// empties the roster and all per-peer maps. Safe to call repeatedly.
    pub async fn end_call(&mut self) {
        if !self.signaling.send_signal(&SignalingMessage::leave(None)) {
            debug!("Leave frame queued until signaling reconnects");
        }

        let peers: Vec<(String, PeerEntry)> = self.peers.drain().collect();
        for (peer_id, entry) in peers {
            if let Err(e) = entry.peer.close().await {
                warn!("Error closing peer {}: {}", peer_id, e);
            }
        }

        for (_, mut recovery) in self.recovery.drain() {
            recovery.cancel_all();
        }

        self.remote_streams.clear();
        self.connection_states.clear();
        self.roster.clear();
        self.session.self_id = None;
        self.last_error = None;

        info!("Call in room {} ended", self.session.room_id);
    }

    // ===== Negotiation =====

    fn is_self(&self, peer_id: &str) -> bool {
        self.session.self_id.as_deref() == Some(peer_id)
    }

    fn known_peer_ids(&self) -> Vec<String> {
        let mut ids = self.roster.peer_ids();
        for peer_id in self.peers.keys() {
            if !ids.contains(peer_id) {
                ids.push(peer_id.clone());
            }
        }
        ids
    }

    fn peer(&self, peer_id: &str) -> Result<Arc<dyn RtcPeer>> {
        self.peers
            .get(peer_id)
            .map(|e| Arc::clone(&e.peer))
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))
    }

    fn entry_mut(&mut self, peer_id: &str, generation: u64) -> Option<&mut PeerEntry> {
        self.peers
            .get_mut(peer_id)
            .filter(|entry| entry.generation == generation)
    }

    async fn ensure_peer(&mut self, peer_id: &str) -> Result<()> {
        if self.peers.contains_key(peer_id) {
            return Ok(());
        }
        self.create_context(peer_id).await
    }

    async fn create_context(&mut self, peer_id: &str) -> Result<()> {
        self.next_generation += 1;
        let generation = self.next_generation;

        let events = PeerEventSink::new(peer_id, generation, self.events_tx.clone());
        let peer = self.factory.create(peer_id, events).await?;

        if let Some(stream) = &self.local_stream {
            for track in stream.tracks() {
                if let Err(e) = peer.sync_track(track.kind, Some(track)).await {
                    warn!("Failed to attach {} track for {}: {}", track.kind, peer_id, e);
                }
            }
        }

        self.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                generation,
                peer,
                making_offer: false,
                setting_remote_answer: false,
                pending_candidates: VecDeque::new(),
            },
        );
        self.connection_states
            .insert(peer_id.to_string(), PeerConnectionState::New);
        self.recovery.entry(peer_id.to_string()).or_default();

        debug!(
            "Created connection context for {} (generation {})",
            peer_id, generation
        );
        Ok(())
    }

    /// Close the current context and create a fresh one in its place
    async fn replace_context(&mut self, peer_id: &str, keep_candidates: bool) -> Result<()> {
        let mut pending = VecDeque::new();
        if let Some(old) = self.peers.remove(peer_id) {
            if let Err(e) = old.peer.close().await {
                warn!("Error closing peer {}: {}", peer_id, e);
            }
            if keep_candidates {
                pending = old.pending_candidates;
            }
        }
        self.remote_streams.remove(peer_id);

        self.create_context(peer_id).await?;
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.pending_candidates = pending;
        }
        Ok(())
    }

    /// Send an offer if we are the initiator and the pair has not negotiated yet
    async fn maybe_initiate(&mut self, peer_id: &str) -> Result<()> {
        let Some(self_id) = self.session.self_id.clone() else {
            return Ok(());
        };
        if !initiates(&self_id, peer_id) {
            return Ok(());
        }
        if self.local_stream.is_none() {
            debug!("Waiting for local media before offering to {}", peer_id);
            return Ok(());
        }

        self.ensure_peer(peer_id).await?;

        let Some(entry) = self.peers.get(peer_id) else {
            return Ok(());
        };
        if entry.making_offer || entry.peer.signaling_state() != SignalingState::Stable {
            return Ok(());
        }
        if entry.peer.has_remote_description().await {
            return Ok(());
        }

        self.send_offer(peer_id).await
    }

    /// Offer again on an established connection after a sender was added
    ///
    /// Either side may renegotiate; if both offer at once the collision path
    /// in [`apply_offer`](Self::apply_offer) settles it.
    async fn renegotiate(&mut self, peer_id: &str) -> Result<()> {
        let Some(entry) = self.peers.get(peer_id) else {
            return Ok(());
        };
        if entry.making_offer
            || entry.peer.signaling_state() != SignalingState::Stable
            || !entry.peer.has_remote_description().await
        {
            return Ok(());
        }

        info!("Renegotiating with {} for added track", peer_id);
        self.send_offer(peer_id).await
    }

    async fn send_offer(&mut self, peer_id: &str) -> Result<()> {
        let (peer, generation) = match self.peers.get_mut(peer_id) {
            Some(entry) => {
                entry.making_offer = true;
                (Arc::clone(&entry.peer), entry.generation)
            }
            None => return Err(Error::PeerNotFound(peer_id.to_string())),
        };

        let offer = peer.create_offer().await;
        if let Some(entry) = self.entry_mut(peer_id, generation) {
            entry.making_offer = false;
        }
        let offer = offer?;

        info!("Sending offer to {}", peer_id);
        if !self
            .signaling
            .send_signal(&SignalingMessage::offer(peer_id, offer.sdp))
        {
            info!("Offer to {} queued until signaling reconnects", peer_id);
        }
        Ok(())
    }

    /// Returns true if a sender was added
    async fn sync_peer_tracks(&mut self, peer_id: &str) -> bool {
        let Some(peer) = self.peers.get(peer_id).map(|e| Arc::clone(&e.peer)) else {
            return false;
        };

        let mut added = false;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let track = self.local_stream.as_ref().and_then(|s| s.track(kind));
            match peer.sync_track(kind, track).await {
                Ok(TrackSync::Added) => added = true,
                Ok(sync) => debug!("{} track for {}: {:?}", kind, peer_id, sync),
                Err(e) => warn!("Failed to sync {} track for {}: {}", kind, peer_id, e),
            }
        }
        added
    }

    async fn flush_candidates(&mut self, peer_id: &str) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if entry.setting_remote_answer || entry.pending_candidates.is_empty() {
            return;
        }

        let queued = std::mem::take(&mut entry.pending_candidates);
        let peer = Arc::clone(&entry.peer);

        debug!("Applying {} queued ICE candidates for {}", queued.len(), peer_id);
        for candidate in queued {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Failed to apply queued ICE candidate for {}: {}", peer_id, e);
            }
        }
    }

    async fn apply_offer(&mut self, from: String, sdp: SessionDescription) -> Result<()> {
        if self.is_self(&from) {
            warn!("Ignoring offer addressed from our own peer id");
            return Ok(());
        }

        self.ensure_peer(&from).await?;

        let collision = self
            .peers
            .get(&from)
            .map(|e| e.making_offer || e.peer.signaling_state() != SignalingState::Stable)
            .unwrap_or(false);

        if collision {
            info!("Offer collision with {}, discarding local offer", from);
            let peer = self.peer(&from)?;
            if let Err(e) = peer.rollback().await {
                info!("Rebuilding connection to {} ({})", from, e);
                self.replace_context(&from, true).await?;
            }
            if let Some(entry) = self.peers.get_mut(&from) {
                entry.making_offer = false;
            }
        }

        let peer = self.peer(&from)?;
        peer.set_remote_description(sdp).await?;
        self.flush_candidates(&from).await;

        let answer = peer.create_answer().await?;
        info!("Sending answer to {}", from);
        if !self
            .signaling
            .send_signal(&SignalingMessage::answer(&from, answer.sdp))
        {
            info!("Answer to {} queued until signaling reconnects", from);
        }
        Ok(())
    }

    async fn apply_answer(&mut self, from: String, sdp: SessionDescription) -> Result<()> {
        let Some(entry) = self.peers.get_mut(&from) else {
            warn!("Ignoring answer from unknown peer {}", from);
            return Ok(());
        };

        let state = entry.peer.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            warn!("Ignoring answer from {} in signaling state {:?}", from, state);
            return Ok(());
        }

        entry.setting_remote_answer = true;
        let peer = Arc::clone(&entry.peer);
        let generation = entry.generation;

        let result = peer.set_remote_description(sdp).await;
        if let Some(entry) = self.entry_mut(&from, generation) {
            entry.setting_remote_answer = false;
        }
        result?;

        debug!("Applied answer from {}", from);
        self.flush_candidates(&from).await;
        Ok(())
    }

    async fn apply_candidate(&mut self, from: String, candidate: IceCandidate) -> Result<()> {
        if self.is_self(&from) {
            return Ok(());
        }

        self.ensure_peer(&from).await?;

        let Some(entry) = self.peers.get(&from) else {
            return Ok(());
        };
        let ready = !entry.setting_remote_answer && entry.peer.has_remote_description().await;

        if !ready {
            if let Some(entry) = self.peers.get_mut(&from) {
                entry.pending_candidates.push_back(candidate);
                debug!(
                    "Queued ICE candidate from {} ({} pending)",
                    from,
                    entry.pending_candidates.len()
                );
            }
            return Ok(());
        }

        // Anything still queued goes first
        self.flush_candidates(&from).await;

        let peer = self.peer(&from)?;
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate from {}: {}", from, e);
        }
        Ok(())
    }

    async fn apply_joined(&mut self, joined: JoinedPayload) -> Result<()> {
        if joined.is_self {
            return self.apply_self_joined(joined.peer_id).await;
        }

        if self.is_self(&joined.peer_id) {
            debug!("Ignoring joined echo for our own session");
            return Ok(());
        }

        let info = RemoteParticipantInfo {
            peer_id: joined.peer_id.clone(),
            user_id: joined.user_id,
            name: joined.name,
        };

        for stale in self.roster.stale_sessions_of(&info) {
            info!(
                "Participant {} reconnected as {}, dropping stale session",
                stale, info.peer_id
            );
            self.remove_peer(&stale).await;
        }

        if self.roster.upsert(info) {
            info!("Participant joined: {}", joined.peer_id);
        }

        self.ensure_peer(&joined.peer_id).await?;
        self.maybe_initiate(&joined.peer_id).await
    }

    async fn apply_self_joined(&mut self, self_id: String) -> Result<()> {
        let previous = self.session.self_id.replace(self_id.clone());
        info!("Joined room {} as {}", self.session.room_id, self_id);

        // Never keep a context or roster entry for ourselves
        if self.peers.contains_key(&self_id) || self.roster.contains(&self_id) {
            self.remove_peer(&self_id).await;
        }

        if let Some(previous) = previous {
            if previous != self_id && !self.peers.is_empty() {
                info!(
                    "Signaling identity changed from {} to {}, rebuilding connections",
                    previous, self_id
                );
                let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
                for peer_id in peer_ids {
                    if let Some(recovery) = self.recovery.get_mut(&peer_id) {
                        recovery.cancel_all();
                        recovery.state = RecoveryState::default();
                    }
                    self.replace_context(&peer_id, false).await?;
                }
            }
        }

        for peer_id in self.known_peer_ids() {
            if let Err(e) = self.maybe_initiate(&peer_id).await {
                warn!("Failed to start negotiation with {}: {}", peer_id, e);
            }
        }
        Ok(())
    }

    /// Drop every trace of a peer. Returns false if nothing was known.
    async fn remove_peer(&mut self, peer_id: &str) -> bool {
        let in_roster = self.roster.remove(peer_id).is_some();

        let had_context = match self.peers.remove(peer_id) {
            Some(entry) => {
                if let Err(e) = entry.peer.close().await {
                    warn!("Error closing peer {}: {}", peer_id, e);
                }
                true
            }
            None => false,
        };

        if let Some(mut recovery) = self.recovery.remove(peer_id) {
            recovery.cancel_all();
        }
        self.remote_streams.remove(peer_id);
        self.connection_states.remove(peer_id);

        in_roster || had_context
    }

    // ===== Connection events and recovery =====

    async fn apply_peer_event(&mut self, peer_id: &str, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if !self
                    .signaling
                    .send_signal(&SignalingMessage::ice_candidate(peer_id, candidate))
                {
                    info!("ICE candidate for {} queued until signaling reconnects", peer_id);
                }
            }
            PeerEvent::StateChanged(state) => {
                let previous = self.connection_states.insert(peer_id.to_string(), state);
                if previous != Some(state) {
                    info!("Peer {} connection state: {}", peer_id, state);
                }

                if state == PeerConnectionState::Connected {
                    let has_stream = self.remote_streams.contains_key(peer_id);
                    self.drive_recovery(peer_id, RecoveryEvent::Connected { has_stream })
                        .await;
                } else if state.needs_recovery() {
                    self.drive_recovery(peer_id, RecoveryEvent::ConnectionLost)
                        .await;
                }
            }
            PeerEvent::RemoteTrack(track) => {
                info!("Remote {} stream from {}", track.kind, peer_id);
                match self.remote_streams.get_mut(peer_id) {
                    Some(stream) => stream.insert(track),
                    None => {
                        self.remote_streams
                            .insert(peer_id.to_string(), RemoteStream::new(track));
                    }
                }
                self.drive_recovery(peer_id, RecoveryEvent::StreamObserved)
                    .await;
            }
        }
    }

    async fn drive_recovery(&mut self, peer_id: &str, event: RecoveryEvent) {
        let Some(recovery) = self.recovery.get_mut(peer_id) else {
            return;
        };
        let actions = recovery.state.apply(event, &self.policy);

        for action in actions {
            self.run_recovery_action(peer_id, action).await;
        }
    }

    async fn run_recovery_action(&mut self, peer_id: &str, action: RecoveryAction) {
        match action {
            RecoveryAction::ArmWatchdog => {
                self.arm_timer(peer_id, TimerKind::Watchdog, self.policy.stream_timeout)
            }
            RecoveryAction::CancelWatchdog => self.cancel_timer(peer_id, TimerKind::Watchdog),
            RecoveryAction::ScheduleRestart => {
                info!(
                    "Scheduling restart of connection to {} in {:?}",
                    peer_id, self.policy.restart_delay
                );
                self.arm_timer(peer_id, TimerKind::Restart, self.policy.restart_delay)
            }
            RecoveryAction::CancelRestart => self.cancel_timer(peer_id, TimerKind::Restart),
            RecoveryAction::Restart => {
                let attempts = self
                    .recovery
                    .get(peer_id)
                    .map(|r| r.state.attempts)
                    .unwrap_or(0);
                info!(
                    "Restarting connection to {} (attempt {}/{})",
                    peer_id, attempts, self.policy.max_attempts
                );
                if let Err(e) = self.restart_peer(peer_id).await {
                    warn!("Restart of connection to {} failed: {}", peer_id, e);
                }
            }
            RecoveryAction::GiveUp => {
                info!(
                    "Giving up on {} after {} restart attempts",
                    peer_id, self.policy.max_attempts
                );
            }
        }
    }

    async fn restart_peer(&mut self, peer_id: &str) -> Result<()> {
        self.replace_context(peer_id, false).await?;
        self.maybe_initiate(peer_id).await
    }

    fn arm_timer(&mut self, peer_id: &str, kind: TimerKind, delay: std::time::Duration) {
        self.next_timer_token += 1;
        let token = self.next_timer_token;
        let tx = self.events_tx.clone();

        let Some(recovery) = self.recovery.get_mut(peer_id) else {
            return;
        };
        let slot = recovery.slot(kind);
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        *slot = Some(Timer::arm(tx, peer_id, kind, token, delay));
    }

    fn cancel_timer(&mut self, peer_id: &str, kind: TimerKind) {
        if let Some(recovery) = self.recovery.get_mut(peer_id) {
            if let Some(timer) = recovery.slot(kind).take() {
                timer.cancel();
            }
        }
    }
}

#[async_trait]
impl SignalingHandler for MeshManager {
    async fn on_offer(&mut self, from: String, sdp: SessionDescription) -> Result<()> {
        self.apply_offer(from, sdp).await
    }

    async fn on_answer(&mut self, from: String, sdp: SessionDescription) -> Result<()> {
        self.apply_answer(from, sdp).await
    }

    async fn on_ice_candidate(&mut self, from: String, candidate: IceCandidate) -> Result<()> {
        self.apply_candidate(from, candidate).await
    }

    async fn on_user_joined(&mut self, joined: JoinedPayload) -> Result<()> {
        self.apply_joined(joined).await
    }

    async fn on_user_leave(&mut self, peer_id: String) -> Result<()> {
        if self.remove_peer(&peer_id).await {
            info!("Participant left: {}", peer_id);
        } else {
            debug!("Leave for unknown peer {}", peer_id);
        }
        Ok(())
    }

    async fn on_error(&mut self, error: String) -> Result<()> {
        warn!("Signaling server reported an error: {}", error);
        self.last_error = Some(error);
        Ok(())
    }
}
