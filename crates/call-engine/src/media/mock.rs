//! Scripted capture devices for tests: no hardware, no `webrtc` backing,
//! full control over denial and mid-call device loss.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{LocalTrack, MediaAccessError, MediaDevices, TrackBacking, TrackKind};

#[derive(Default)]
pub struct MockDevices {
    denied: Mutex<HashSet<&'static str>>,
    live: Mutex<Vec<(TrackKind, watch::Sender<bool>)>>,
}

impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next (and every later) acquire of this kind fail the way
    /// a user denying the permission prompt would.
    pub fn deny(&self, kind: TrackKind) {
        self.denied.lock().insert(kind_key(kind));
    }

    pub fn allow(&self, kind: TrackKind) {
        self.denied.lock().remove(kind_key(kind));
    }

    /// Kill every live track of the given kind, as the OS revoking a
    /// capture session would.
    pub fn end_tracks(&self, kind: TrackKind) {
        self.live.lock().retain(|(track_kind, ended)| {
            if *track_kind == kind {
                let _ = ended.send(true);
                false
            } else {
                true
            }
        });
    }

    fn acquire(&self, kind: TrackKind) -> Result<LocalTrack, MediaAccessError> {
        if self.denied.lock().contains(kind_key(kind)) {
            return Err(MediaAccessError::Denied(kind_key(kind).to_string()));
        }
        let (ended_tx, ended_rx) = watch::channel(false);
        let track = LocalTrack::new(kind, TrackBacking::Null, ended_rx);
        self.live.lock().push((kind, ended_tx));
        Ok(track)
    }
}

fn kind_key(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Camera => "camera",
        TrackKind::Screen => "screen",
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn acquire_audio(&self) -> Result<LocalTrack, MediaAccessError> {
        self.acquire(TrackKind::Audio)
    }

    async fn acquire_camera(&self) -> Result<LocalTrack, MediaAccessError> {
        self.acquire(TrackKind::Camera)
    }

    async fn acquire_screen(&self) -> Result<LocalTrack, MediaAccessError> {
        self.acquire(TrackKind::Screen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revocation_fires_the_ended_watch() {
        let devices = MockDevices::new();
        let track = devices.acquire_screen().await.expect("screen");
        assert!(!track.has_ended());
        devices.end_tracks(TrackKind::Screen);
        assert!(track.has_ended());
    }
}
