//! Peer connection seam and its WebRTC implementation
//!
//! The mesh manager drives connections only through [`RtcPeer`], so the
//! negotiation logic can run against the real `webrtc` stack or a scripted
//! stand-in. Connection callbacks are forwarded as [`PeerEvent`]s tagged with
//! the generation of the context that created them.

use super::manager::MeshEvent;
use crate::config::MeshCallConfig;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::signaling::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Offer/answer state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }
}

/// Transport-level state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        }
    }

    /// States that trigger the restart policy
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            _ => PeerConnectionState::New,
        }
    }
}

/// Result of reconciling one outbound track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSync {
    /// Existing sender now carries the given track
    Replaced,
    /// New sender created; the connection needs renegotiation
    Added,
    /// Existing sender no longer carries a track
    Detached,
    /// Nothing to do
    Unchanged,
}

/// Event raised by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate to trickle to the remote side
    LocalCandidate(IceCandidate),
    /// Transport state change
    StateChanged(PeerConnectionState),
    /// Remote media arrived
    RemoteTrack(RemoteTrack),
}

/// Routes connection callbacks back into the manager's event loop
#[derive(Clone)]
pub struct PeerEventSink {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(peer_id: &str, generation: u64, tx: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward an event; silently dropped once the manager is gone
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(MeshEvent::Peer {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEventSink")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// One connection to one remote participant
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer and install it locally
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard a pending local offer, returning to stable
    ///
    /// Implementations that cannot roll back return an error; the manager
    /// then replaces the connection instead.
    async fn rollback(&self) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Make the sender for `kind` carry `track`
    ///
    /// Reuses an existing sender of the same kind via track replacement and
    /// only adds a sender when none exists.
    async fn sync_track(&self, kind: MediaKind, track: Option<&LocalTrack>) -> Result<TrackSync>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections for the manager
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, peer_id: &str, events: PeerEventSink) -> Result<Arc<dyn RtcPeer>>;
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return Err(Error::SdpError(
                "Rollback cannot be applied as a remote description".to_string(),
            ))
        }
    };

    parsed.map_err(|e| Error::SdpError(format!("Failed to parse session description: {}", e)))
}

/// Peer connection backed by the `webrtc` crate
pub struct WebRtcPeer {
    peer_id: String,
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    /// Senders whose track was removed, reused when media comes back
    detached: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
}

impl WebRtcPeer {
    /// Create a new peer connection
    ///
    /// # Arguments
    ///
    /// * `config` - STUN/TURN servers and ICE pool size
    /// * `events` - Sink receiving candidates, state changes and remote tracks
    #[instrument(skip(config, events), fields(peer_id = %events.peer_id()))]
    pub async fn new(config: &MeshCallConfig, events: PeerEventSink) -> Result<Self> {
        let peer_id = events.peer_id().to_string();
        let connection_id = uuid::Uuid::new_v4().to_string();

        info!(
            "Creating peer connection: peer_id={}, connection_id={}",
            peer_id, connection_id
        );

        // Opus for audio, VP8/VP9/H.264 for video
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(PeerEvent::LocalCandidate(init.into())),
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    if state == RTCPeerConnectionState::Unspecified {
                        return;
                    }
                    debug!("Peer {} transport state: {}", sink.peer_id(), state);
                    sink.emit(PeerEvent::StateChanged(state.into()));
                })
            },
        ));

        let sink = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(kind) = MediaKind::from_codec_type(track.kind()) else {
                        return;
                    };
                    info!("Remote {} track from peer {}", kind, sink.peer_id());
                    sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        remote: Some(track),
                    }));
                })
            },
        ));

        Ok(Self {
            peer_id,
            connection_id,
            peer_connection,
            detached: Mutex::new(HashMap::new()),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Underlying connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    async fn local_sdp(&self) -> Result<String> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::SdpError("No local description after setting it".to_string()))
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP offer for peer {}", self.peer_id);
        Ok(SessionDescription::offer(self.local_sdp().await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP answer for peer {}", self.peer_id);
        Ok(SessionDescription::answer(self.local_sdp().await?))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        debug!(
            "Setting remote {:?} for peer {}",
            description.kind, self.peer_id
        );

        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        // webrtc-rs rejects a local rollback from have-local-offer, and
        // attempting one leaves the pending offer in place
        debug!(
            "Rollback requested for peer {} in state {:?}",
            self.peer_id,
            self.signaling_state()
        );
        Err(Error::SdpError(
            "Local offer rollback is not supported by the webrtc stack".to_string(),
        ))
    }

    fn signaling_state(&self) -> SignalingState {
        self.peer_connection.signaling_state().into()
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!(
            "Adding ICE candidate for peer {}: {}",
            self.peer_id, candidate.candidate
        );

        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn sync_track(&self, kind: MediaKind, track: Option<&LocalTrack>) -> Result<TrackSync> {
        for sender in self.peer_connection.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if MediaKind::from_codec_type(current.kind()) != Some(kind) {
                continue;
            }

            return match track {
                Some(track) if track.id() == current.id() => Ok(TrackSync::Unchanged),
                Some(track) => {
                    sender
                        .replace_track(Some(Arc::clone(&track.track)))
                        .await
                        .map_err(|e| {
                            Error::MediaTrackError(format!("Failed to replace {} track: {}", kind, e))
                        })?;
                    Ok(TrackSync::Replaced)
                }
                None => {
                    sender.replace_track(None).await.map_err(|e| {
                        Error::MediaTrackError(format!("Failed to detach {} track: {}", kind, e))
                    })?;
                    self.detached.lock().insert(kind, sender);
                    Ok(TrackSync::Detached)
                }
            };
        }

        let Some(track) = track else {
            return Ok(TrackSync::Unchanged);
        };

        let detached = self.detached.lock().remove(&kind);
        if let Some(sender) = detached {
            sender
                .replace_track(Some(Arc::clone(&track.track)))
                .await
                .map_err(|e| {
                    Error::MediaTrackError(format!("Failed to reattach {} track: {}", kind, e))
                })?;
            return Ok(TrackSync::Replaced);
        }

        info!("Adding {} track to peer {}", kind, self.peer_id);
        self.peer_connection
            .add_track(Arc::clone(&track.track))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add {} track: {}", kind, e)))?;

        Ok(TrackSync::Added)
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.peer_id);

        self.peer_connection.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

/// Factory producing [`WebRtcPeer`]s from a call configuration
pub struct WebRtcPeerFactory {
    config: MeshCallConfig,
}

impl WebRtcPeerFactory {
    pub fn new(config: MeshCallConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, _peer_id: &str, events: PeerEventSink) -> Result<Arc<dyn RtcPeer>> {
        let peer = WebRtcPeer::new(&self.config, events).await?;
        Ok(Arc::new(peer))
    }
}
