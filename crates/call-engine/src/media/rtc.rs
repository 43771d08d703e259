//! Production capture devices backed by `webrtc` sample tracks.
//!
//! Actual frame capture is platform work that lives in the app shell;
//! this module hands the shell a [`TrackFeed`] per acquired device whose
//! `TrackLocalStaticSample` it pumps encoded samples into, while the
//! engine owns the matching [`LocalTrack`] handle. The feeder must stop
//! writing while the handle's enabled bit is off (that is what mute
//! means), and the shell reports device loss through [`RtcMediaDevices::end_tracks`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{LocalTrack, MediaAccessError, MediaDevices, TrackBacking, TrackKind};

/// One acquired device: the engine-side handle plus the sample track the
/// capture pump writes into.
#[derive(Clone)]
pub struct TrackFeed {
    pub track_id: String,
    pub kind: TrackKind,
    pub sample_track: Arc<TrackLocalStaticSample>,
}

pub struct RtcMediaDevices {
    stream_id: String,
    feeds: Mutex<Vec<(TrackFeed, watch::Sender<bool>)>>,
}

impl RtcMediaDevices {
    /// `stream_id` groups the outgoing tracks on the remote side the way
    /// a browser `MediaStream` id would.
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            feeds: Mutex::new(Vec::new()),
        }
    }

    /// Feeds acquired so far, newest last. The capture pump drains this
    /// after each toggle to pick up new sample tracks.
    pub fn feeds(&self) -> Vec<TrackFeed> {
        self.feeds.lock().iter().map(|(feed, _)| feed.clone()).collect()
    }

    /// Report device loss (screen-capture revocation, camera unplugged).
    /// The engine observes the ended signal and detaches the senders.
    /// Ended feeds are dropped here; the capture pump stops seeing them.
    pub fn end_tracks(&self, kind: TrackKind) {
        self.feeds.lock().retain(|(feed, ended)| {
            if feed.kind == kind {
                let _ = ended.send(true);
                false
            } else {
                true
            }
        });
    }

    fn acquire(&self, kind: TrackKind) -> LocalTrack {
        // Feeds whose engine-side handle is gone are dead weight.
        self.feeds.lock().retain(|(_, ended)| !ended.is_closed());
        let (label, mime) = match kind {
            TrackKind::Audio => ("audio", MIME_TYPE_OPUS),
            TrackKind::Camera => ("camera", MIME_TYPE_VP8),
            TrackKind::Screen => ("screen", MIME_TYPE_VP8),
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            label.to_owned(),
            self.stream_id.clone(),
        ));
        let backing = TrackBacking::Rtc(
            Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>
        );
        let (ended_tx, ended_rx) = watch::channel(false);
        let track = LocalTrack::new(kind, backing, ended_rx);
        self.feeds.lock().push((
            TrackFeed {
                track_id: track.id().to_string(),
                kind,
                sample_track,
            },
            ended_tx,
        ));
        track
    }
}

#[async_trait]
impl MediaDevices for RtcMediaDevices {
    async fn acquire_audio(&self) -> Result<LocalTrack, MediaAccessError> {
        Ok(self.acquire(TrackKind::Audio))
    }

    async fn acquire_camera(&self) -> Result<LocalTrack, MediaAccessError> {
        Ok(self.acquire(TrackKind::Camera))
    }

    async fn acquire_screen(&self) -> Result<LocalTrack, MediaAccessError> {
        Ok(self.acquire(TrackKind::Screen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ended_feeds_are_pruned() {
        let devices = RtcMediaDevices::new("local-stream");
        let screen = devices.acquire_screen().await.expect("screen");
        let _audio = devices.acquire_audio().await.expect("audio");
        assert_eq!(devices.feeds().len(), 2);

        devices.end_tracks(TrackKind::Screen);
        assert!(screen.has_ended());
        let remaining = devices.feeds();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, TrackKind::Audio);
    }

    #[tokio::test]
    async fn dropped_handles_are_pruned_on_the_next_acquire() {
        let devices = RtcMediaDevices::new("local-stream");
        let camera = devices.acquire_camera().await.expect("camera");
        drop(camera);
        let _screen = devices.acquire_screen().await.expect("screen");
        let feeds = devices.feeds();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].kind, TrackKind::Screen);
    }
}
