//! Local media: capture seam, track handles, and the controller that
//! owns the microphone/camera/screen state for the call's duration.
//!
//! The controller never talks to peer connections itself. Every mutation
//! returns an explicit [`TrackMutation`] the coordinator applies to each
//! peer synchronously, so renegotiation ordering is deterministic.

pub mod mock;
pub mod rtc;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Camera,
    Screen,
}

impl TrackKind {
    pub fn is_video(self) -> bool {
        matches!(self, TrackKind::Camera | TrackKind::Screen)
    }
}

/// What actually produces the media. Scripted devices carry no backing;
/// production devices carry a `webrtc` local track the capture pump
/// writes samples into.
#[derive(Clone)]
pub enum TrackBacking {
    Rtc(Arc<dyn TrackLocal + Send + Sync>),
    Null,
}

impl fmt::Debug for TrackBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackBacking::Rtc(_) => f.write_str("Rtc"),
            TrackBacking::Null => f.write_str("Null"),
        }
    }
}

/// A live local capture track.
///
/// `enabled` is the mute bit: the capture feeder consults it and stops
/// writing samples while it is false, so flipping it never renegotiates.
/// `ended` fires when the device goes away underneath us (for example the
/// OS revoking a screen capture); the coordinator treats that as an
/// implicit stop.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    backing: TrackBacking,
    ended: watch::Receiver<bool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, backing: TrackBacking, ended: watch::Receiver<bool>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            backing,
            ended,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn backing(&self) -> &TrackBacking {
        &self.backing
    }

    pub fn has_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Watch handle for the track's end-of-life signal.
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended.clone()
    }
}

/// What an inbound track hangs off. Scripted endpoints carry no backing;
/// production endpoints hand out the `webrtc` remote track for the
/// embedder to read samples from (the engine never consumes it).
#[derive(Clone)]
pub enum RemoteTrackBacking {
    Rtc(Arc<TrackRemote>),
    Null,
}

impl fmt::Debug for RemoteTrackBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteTrackBacking::Rtc(_) => f.write_str("Rtc"),
            RemoteTrackBacking::Null => f.write_str("Null"),
        }
    }
}

/// A remote participant's media track as surfaced to the embedder, who
/// plays it out (audio) or renders it (video). Playback is the app
/// shell's job; the engine only routes the handle.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub backing: RemoteTrackBacking,
}

// Track ids are unique per peer connection; identity is enough for the
// state diffing the watch channel does.
impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

impl Eq for RemoteTrack {}

#[derive(Debug, Error)]
pub enum MediaAccessError {
    #[error("device access denied: {0}")]
    Denied(String),
    #[error("no usable device: {0}")]
    Unavailable(String),
}

/// Capture hardware seam. Each acquire call may prompt the user, so all
/// of them are suspension points.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_audio(&self) -> Result<LocalTrack, MediaAccessError>;
    async fn acquire_camera(&self) -> Result<LocalTrack, MediaAccessError>;
    async fn acquire_screen(&self) -> Result<LocalTrack, MediaAccessError>;
}

/// How a mutation must be reflected on the peer connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMutation {
    /// New sender; every peer renegotiates.
    SenderAdded,
    /// Track swapped in place on the existing sender; no renegotiation.
    SenderReplaced,
    /// Sender removed; every peer renegotiates.
    SenderRemoved,
    None,
}

/// Owns the local capture state: one audio track, one outgoing video
/// slot shared by camera and screen capture.
pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            audio: None,
            video: None,
        }
    }

    /// Acquire the microphone. Failure here is fatal to call setup.
    pub async fn start_audio(&mut self) -> Result<LocalTrack, MediaAccessError> {
        let track = self.devices.acquire_audio().await?;
        self.audio = Some(track.clone());
        Ok(track)
    }

    /// Flip the mute bit. Returns the new muted state; no-op without an
    /// audio track.
    pub fn toggle_mute(&mut self) -> bool {
        match &self.audio {
            Some(track) => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                !enabled
            }
            None => false,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.audio
            .as_ref()
            .map(|track| !track.is_enabled())
            .unwrap_or(false)
    }

    pub fn is_video_enabled(&self) -> bool {
        matches!(&self.video, Some(track) if track.kind() == TrackKind::Camera)
    }

    pub fn is_screen_sharing(&self) -> bool {
        matches!(&self.video, Some(track) if track.kind() == TrackKind::Screen)
    }

    pub async fn start_camera(&mut self) -> Result<(TrackMutation, LocalTrack), MediaAccessError> {
        let track = self.devices.acquire_camera().await?;
        Ok((self.fill_video_slot(track.clone()), track))
    }

    pub async fn start_screen(&mut self) -> Result<(TrackMutation, LocalTrack), MediaAccessError> {
        let track = self.devices.acquire_screen().await?;
        Ok((self.fill_video_slot(track.clone()), track))
    }

    fn fill_video_slot(&mut self, track: LocalTrack) -> TrackMutation {
        let mutation = if self.video.is_some() {
            TrackMutation::SenderReplaced
        } else {
            TrackMutation::SenderAdded
        };
        self.video = Some(track);
        mutation
    }

    /// Vacate the video slot, whatever occupies it. The returned track is
    /// handed back so the coordinator can remove the senders from every
    /// peer connection before the track is discarded.
    pub fn stop_video_slot(&mut self) -> (TrackMutation, Option<LocalTrack>) {
        match self.video.take() {
            Some(track) => {
                track.set_enabled(false);
                (TrackMutation::SenderRemoved, Some(track))
            }
            None => (TrackMutation::None, None),
        }
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    /// Stop everything for leave. Tracks are returned still-alive so the
    /// caller can detach them from peers before dropping.
    pub fn stop_all(&mut self) -> Vec<LocalTrack> {
        let mut stopped = Vec::new();
        if let Some(track) = self.audio.take() {
            track.set_enabled(false);
            stopped.push(track);
        }
        if let Some(track) = self.video.take() {
            track.set_enabled(false);
            stopped.push(track);
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDevices;
    use super::*;

    fn controller() -> LocalMediaController {
        LocalMediaController::new(Arc::new(MockDevices::new()))
    }

    #[tokio::test]
    async fn mute_flips_enabled_without_touching_the_slot() {
        let mut media = controller();
        media.start_audio().await.expect("audio");
        assert!(!media.is_muted());
        assert!(media.toggle_mute());
        assert!(media.is_muted());
        assert!(!media.audio_track().expect("track").is_enabled());
        assert!(!media.toggle_mute());
        assert!(media.audio_track().expect("track").is_enabled());
    }

    #[tokio::test]
    async fn camera_then_screen_shares_one_video_slot() {
        let mut media = controller();
        let (first, _) = media.start_camera().await.expect("camera");
        assert_eq!(first, TrackMutation::SenderAdded);
        assert!(media.is_video_enabled());

        let (second, _) = media.start_screen().await.expect("screen");
        assert_eq!(second, TrackMutation::SenderReplaced);
        assert!(media.is_screen_sharing());
        assert!(!media.is_video_enabled());

        let (third, stopped) = media.stop_video_slot();
        assert_eq!(third, TrackMutation::SenderRemoved);
        assert!(!stopped.expect("stopped track").is_enabled());
        assert_eq!(media.stop_video_slot().0, TrackMutation::None);
    }

    #[tokio::test]
    async fn denied_microphone_surfaces_access_error() {
        let devices = Arc::new(MockDevices::new());
        devices.deny(TrackKind::Audio);
        let mut media = LocalMediaController::new(devices);
        let err = media.start_audio().await.expect_err("denied");
        assert!(matches!(err, MediaAccessError::Denied(_)));
    }

    #[tokio::test]
    async fn stop_all_disables_every_track() {
        let mut media = controller();
        media.start_audio().await.expect("audio");
        media.start_camera().await.expect("camera");
        let stopped = media.stop_all();
        assert_eq!(stopped.len(), 2);
        assert!(stopped.iter().all(|t| !t.is_enabled()));
        assert!(media.audio_track().is_none());
        assert!(media.video_track().is_none());
    }
}
