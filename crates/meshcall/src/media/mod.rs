//! Local and remote media types
//!
//! The mesh core only reads the current [`LocalMediaStream`]; acquisition and
//! toggling live in [`LocalMedia`].

pub mod local;
pub mod tracks;

pub use local::{AcquireReport, LocalMedia, LocalMediaState, MediaDevices};
pub use tracks::{published_sample_track, spawn_sample_pump, SyntheticDevices};

use std::fmt;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Map from the RTP codec type; `None` for unspecified
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound track shared by every peer connection
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<dyn TrackLocal + Send + Sync>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self { kind, track }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .finish()
    }
}

/// The local stream: at most one track per kind
#[derive(Debug, Clone, Default)]
pub struct LocalMediaStream {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalMediaStream {
    pub fn new(audio: Option<LocalTrack>, video: Option<LocalTrack>) -> Self {
        Self { audio, video }
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub(crate) fn set_track(&mut self, kind: MediaKind, track: Option<LocalTrack>) {
        match kind {
            MediaKind::Audio => self.audio = track,
            MediaKind::Video => self.video = track,
        }
    }

    /// Tracks in audio, video order
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Inbound track announced by a peer connection
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Underlying RTP track; absent for tracks not backed by a real connection
    pub remote: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Media received from one remote participant
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(first: RemoteTrack) -> Self {
        Self {
            id: first.stream_id.clone(),
            tracks: vec![first],
        }
    }

    /// Add a track, replacing any previous track of the same kind
    pub fn insert(&mut self, track: RemoteTrack) {
        self.id = track.stream_id.clone();
        self.tracks.retain(|existing| existing.kind != track.kind);
        self.tracks.push(track);
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|track| track.kind == kind)
    }
}

/// Local media acquisition failure
///
/// Display strings are meant to be shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("Access to the {0} was denied. Allow it in your system or browser settings and try again.")]
    PermissionDenied(MediaKind),

    #[error("No {0} device was found. Connect one and try again.")]
    NotFound(MediaKind),

    #[error("The {0} device is in use by another application. Close it and try again.")]
    Busy(MediaKind),

    #[error("The {0} device does not support the requested settings.")]
    Unsupported(MediaKind),

    #[error("Could not start the {kind} device: {reason}")]
    Other { kind: MediaKind, reason: String },
}

impl MediaError {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaError::PermissionDenied(kind)
            | MediaError::NotFound(kind)
            | MediaError::Busy(kind)
            | MediaError::Unsupported(kind)
            | MediaError::Other { kind, .. } => *kind,
        }
    }
}

impl From<MediaError> for crate::Error {
    fn from(err: MediaError) -> Self {
        crate::Error::MediaTrackError(err.to_string())
    }
}
