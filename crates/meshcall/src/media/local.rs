//! Local media source
//!
//! Owns the current local stream and the per-kind enabled flags. Every change
//! is published on a watch channel; the call session forwards the effective
//! stream to the mesh manager, which reconciles senders on every peer.
//! Screen sharing swaps the video track in place, so peers replace the track
//! on their existing video sender.

use super::{LocalMediaStream, LocalTrack, MediaError, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

/// Capture device provider
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open a track of the given kind
    async fn open(&self, kind: MediaKind) -> std::result::Result<LocalTrack, MediaError>;

    /// Open a display capture as a video track
    async fn open_display(&self) -> std::result::Result<LocalTrack, MediaError> {
        Err(MediaError::Unsupported(MediaKind::Video))
    }
}

/// Published local media state
#[derive(Debug, Clone)]
pub struct LocalMediaState {
    /// Acquired stream, `None` until media has been started
    pub stream: Option<LocalMediaStream>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    /// The video slot carries a display capture
    pub screen_sharing: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            stream: None,
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

impl LocalMediaState {
    /// Stream as peers should carry it: disabled kinds are left out
    pub fn effective_stream(&self) -> Option<LocalMediaStream> {
        self.stream.as_ref().map(|stream| {
            LocalMediaStream::new(
                stream.audio().filter(|_| self.audio_enabled).cloned(),
                stream.video().filter(|_| self.video_enabled).cloned(),
            )
        })
    }

    pub fn enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }
}

/// Outcome of [`LocalMedia::acquire`]
#[derive(Debug, Default)]
pub struct AcquireReport {
    pub acquired: Vec<MediaKind>,
    pub errors: Vec<MediaError>,
}

impl AcquireReport {
    /// At least one device opened
    pub fn is_usable(&self) -> bool {
        !self.acquired.is_empty()
    }
}

/// Camera video set aside while the screen is shared
struct SavedCamera {
    track: Option<LocalTrack>,
    enabled: bool,
}

/// Local media source
pub struct LocalMedia {
    tx: watch::Sender<LocalMediaState>,
    camera: Mutex<Option<SavedCamera>>,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMedia {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LocalMediaState::default());
        Self {
            tx,
            camera: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LocalMediaState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> LocalMediaState {
        self.tx.borrow().clone()
    }

    /// Open the requested devices
    ///
    /// Failures are collected per device; the stream is published with
    /// whatever could be opened so the call degrades to audio-only or
    /// video-only instead of failing.
    pub async fn acquire(
        &self,
        devices: &dyn MediaDevices,
        audio: bool,
        video: bool,
    ) -> AcquireReport {
        let mut report = AcquireReport::default();
        let mut stream = LocalMediaStream::default();

        let wanted = [(MediaKind::Audio, audio), (MediaKind::Video, video)];
        for (kind, requested) in wanted {
            if !requested {
                continue;
            }
            match devices.open(kind).await {
                Ok(track) => {
                    stream.set_track(kind, Some(track));
                    report.acquired.push(kind);
                }
                Err(e) => {
                    warn!("Failed to open {} device: {}", kind, e);
                    report.errors.push(e);
                }
            }
        }

        if report.is_usable() {
            info!("Local media started: {:?}", report.acquired);
            self.tx.send_modify(|state| state.stream = Some(stream));
        }

        report
    }

    /// Install or replace the track for one kind (device switch)
    pub fn set_track(&self, kind: MediaKind, track: Option<LocalTrack>) {
        self.tx.send_modify(|state| {
            let stream = state.stream.get_or_insert_with(LocalMediaStream::default);
            stream.set_track(kind, track);
        });
    }

    /// Flip the audio flag, returning the new value
    pub fn toggle_audio(&self) -> bool {
        self.toggle(MediaKind::Audio)
    }

    /// Flip the video flag, returning the new value
    pub fn toggle_video(&self) -> bool {
        self.toggle(MediaKind::Video)
    }

    fn toggle(&self, kind: MediaKind) -> bool {
        let mut enabled = false;
        self.tx.send_modify(|state| {
            let flag = match kind {
                MediaKind::Audio => &mut state.audio_enabled,
                MediaKind::Video => &mut state.video_enabled,
            };
            *flag = !*flag;
            enabled = *flag;
        });
        info!("Local {} {}", kind, if enabled { "enabled" } else { "disabled" });
        enabled
    }

    /// Share the screen in place of the camera
    ///
    /// The display track takes the video slot and video is enabled; the camera
    /// track and its flag come back on
    /// [`stop_screen_share`](Self::stop_screen_share). Does nothing while a
    /// share is already running.
    pub async fn start_screen_share(
        &self,
        devices: &dyn MediaDevices,
    ) -> std::result::Result<(), MediaError> {
        if self.tx.borrow().screen_sharing {
            return Ok(());
        }

        let screen = devices.open_display().await?;
        let screen_id = screen.id().to_string();

        let started = self.tx.send_if_modified(|state| {
            if state.screen_sharing {
                return false;
            }
            let stream = state.stream.get_or_insert_with(LocalMediaStream::default);
            *self.camera.lock() = Some(SavedCamera {
                track: stream.video().cloned(),
                enabled: state.video_enabled,
            });
            stream.set_track(MediaKind::Video, Some(screen));
            state.video_enabled = true;
            state.screen_sharing = true;
            true
        });

        if started {
            info!("Screen share started ({})", screen_id);
        }
        Ok(())
    }

    /// Put the camera back in the video slot. Returns false if no share was
    /// running.
    pub fn stop_screen_share(&self) -> bool {
        let saved = self.camera.lock().take();

        let stopped = self.tx.send_if_modified(|state| {
            if !state.screen_sharing {
                return false;
            }
            let SavedCamera { track, enabled } = saved.unwrap_or(SavedCamera {
                track: None,
                enabled: state.video_enabled,
            });
            if let Some(stream) = state.stream.as_mut() {
                stream.set_track(MediaKind::Video, track);
            }
            state.video_enabled = enabled;
            state.screen_sharing = false;
            true
        });

        if stopped {
            info!("Screen share stopped");
        }
        stopped
    }

    /// Drop the stream, ending any screen share
    pub fn stop(&self) {
        self.camera.lock().take();
        self.tx.send_modify(|state| {
            state.stream = None;
            state.screen_sharing = false;
        });
    }
}
