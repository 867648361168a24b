//! Synthetic capture tracks
//!
//! Headless participants (CLI, soak runs) have no camera, microphone or
//! display. These tracks use the codecs registered by default with the media
//! engine, and the sample pumps keep RTP flowing so remote peers observe a
//! live stream.

use super::local::{LocalMediaState, MediaDevices};
use super::{LocalTrack, MediaError, MediaKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// One 20 ms Opus frame of silence
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

const OPUS_FRAME: Duration = Duration::from_millis(20);

/// Key frame header of a 16x16 VP8 frame with an empty first partition
const VP8_PLACEHOLDER: [u8; 10] = [0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

const VIDEO_FRAME: Duration = Duration::from_millis(100);

/// Devices backed by in-memory sample tracks
pub struct SyntheticDevices {
    stream_id: String,
}

impl SyntheticDevices {
    pub fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
        }
    }

    fn capability(kind: MediaKind) -> RTCRtpCodecCapability {
        match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }

    fn track(&self, kind: MediaKind, label: &str) -> LocalTrack {
        let track = Arc::new(TrackLocalStaticSample::new(
            Self::capability(kind),
            format!("{}-{}", label, uuid::Uuid::new_v4()),
            self.stream_id.clone(),
        ));
        LocalTrack::new(kind, track)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(&self, kind: MediaKind) -> std::result::Result<LocalTrack, MediaError> {
        Ok(self.track(kind, kind.as_str()))
    }

    async fn open_display(&self) -> std::result::Result<LocalTrack, MediaError> {
        Ok(self.track(MediaKind::Video, "screen"))
    }
}

/// Sample track currently published for `kind`, if enabled
pub fn published_sample_track(
    state: &LocalMediaState,
    kind: MediaKind,
) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
    if !state.enabled(kind) {
        return None;
    }
    let track = state.stream.as_ref()?.track(kind)?;
    track
        .track
        .as_any()
        .is::<TrackLocalStaticSample>()
        .then(|| Arc::clone(&track.track))
}

/// Keep writing placeholder samples to whatever `kind` track is published
///
/// Follows the local state, so toggles, device switches and screen sharing
/// are picked up on the next frame. Audio gets Opus silence, video a VP8 key
/// frame header.
pub fn spawn_sample_pump(
    kind: MediaKind,
    state: watch::Receiver<LocalMediaState>,
) -> JoinHandle<()> {
    let (payload, frame): (&'static [u8], Duration) = match kind {
        MediaKind::Audio => (&OPUS_SILENCE[..], OPUS_FRAME),
        MediaKind::Video => (&VP8_PLACEHOLDER[..], VIDEO_FRAME),
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame);
        loop {
            ticker.tick().await;

            let Some(track) = published_sample_track(&state.borrow(), kind) else {
                continue;
            };
            let Some(track) = track.as_any().downcast_ref::<TrackLocalStaticSample>() else {
                continue;
            };

            let sample = Sample {
                data: Bytes::from_static(payload),
                duration: frame,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("{} pump write failed: {}", kind, e);
            }
        }
    })
}
