//! `webrtc`-backed peer endpoints.
//!
//! One [`RtcConnector`] per call builds a shared API (media engine plus
//! default interceptors) and mints an [`RtcEndpoint`] per remote. All
//! transport callbacks forward into the session's event channel; nothing
//! here touches negotiation state.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::{EndpointEvent, EndpointEventKind, IceConnState, NegotiationError, PeerConnector, PeerEndpoint};
use crate::config::CallConfig;
use crate::media::{LocalTrack, RemoteTrack, RemoteTrackBacking, TrackBacking, TrackKind};
use crate::signaling::{CandidateInit, SdpKind, SessionDescription};

pub struct RtcConnector {
    api: API,
    config: CallConfig,
}

impl RtcConnector {
    pub fn new(config: CallConfig) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| NegotiationError::Setup(err.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| NegotiationError::Setup(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Result<Arc<dyn PeerEndpoint>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|err| NegotiationError::Setup(err.to_string()))?,
        );
        wire_callbacks(&pc, peer_id, events);
        Ok(Arc::new(RtcEndpoint {
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

fn wire_callbacks(
    pc: &Arc<RTCPeerConnection>,
    peer_id: &str,
    events: mpsc::UnboundedSender<EndpointEvent>,
) {
    let candidate_events = events.clone();
    let candidate_peer = peer_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let events = candidate_events.clone();
        let peer_id = candidate_peer.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                // End-of-gathering marker.
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(EndpointEvent {
                        peer_id,
                        kind: EndpointEventKind::Candidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                    });
                }
                Err(err) => {
                    tracing::warn!(target = "call", peer = %peer_id, %err, "candidate serialization failed");
                }
            }
        })
    }));

    let ice_events = events.clone();
    let ice_peer = peer_id.to_string();
    pc.on_ice_connection_state_change(Box::new(move |state| {
        let _ = ice_events.send(EndpointEvent {
            peer_id: ice_peer.clone(),
            kind: EndpointEventKind::IceState(map_ice_state(state)),
        });
        Box::pin(async {})
    }));

    let track_peer = peer_id.to_string();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = events.clone();
        let peer_id = track_peer.clone();
        Box::pin(async move {
            // The handle goes straight to the embedder for playback; the
            // engine must not read from it or packets are lost.
            let kind = if track.kind() == RTPCodecType::Video {
                TrackKind::Camera
            } else {
                TrackKind::Audio
            };
            let _ = events.send(EndpointEvent {
                peer_id,
                kind: EndpointEventKind::RemoteTrackAdded(RemoteTrack {
                    id: track.id(),
                    kind,
                    backing: RemoteTrackBacking::Rtc(track),
                }),
            });
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnState {
    match state {
        RTCIceConnectionState::Checking => IceConnState::Checking,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            IceConnState::Connected
        }
        RTCIceConnectionState::Disconnected => IceConnState::Disconnected,
        RTCIceConnectionState::Failed => IceConnState::Failed,
        RTCIceConnectionState::Closed => IceConnState::Closed,
        RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => IceConnState::New,
    }
}

pub struct RtcEndpoint {
    pc: Arc<RTCPeerConnection>,
    // Only the video sender is kept: it is the one that gets replaced or
    // removed mid-call. The audio sender lives for the whole connection.
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcEndpoint {
    fn rtc_track(track: &LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, NegotiationError> {
        match track.backing() {
            TrackBacking::Rtc(rtc) => Ok(rtc.clone()),
            TrackBacking::Null => Err(NegotiationError::Sender(
                "track has no transport backing".into(),
            )),
        }
    }

    fn to_rtc_description(sdp: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        let result = match sdp.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp.clone()),
        };
        result.map_err(|err| NegotiationError::Description(err.to_string()))
    }
}

#[async_trait]
impl PeerEndpoint for RtcEndpoint {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        sdp: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(Self::to_rtc_description(sdp)?)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        sdp: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(Self::to_rtc_description(sdp)?)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))
    }

    async fn rollback_local(&self) -> Result<(), NegotiationError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &CandidateInit) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| NegotiationError::Candidate(err.to_string()))
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let rtc_track = Self::rtc_track(track)?;
        let sender = self
            .pc
            .add_track(rtc_track)
            .await
            .map_err(|err| NegotiationError::Sender(err.to_string()))?;
        if track.kind().is_video() {
            *self.video_sender.lock() = Some(sender);
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let rtc_track = Self::rtc_track(track)?;
        let sender = self.video_sender.lock().clone();
        let Some(sender) = sender else {
            return Err(NegotiationError::Sender("no video sender to replace".into()));
        };
        sender
            .replace_track(Some(rtc_track))
            .await
            .map_err(|err| NegotiationError::Sender(err.to_string()))
    }

    async fn remove_video_track(&self) -> Result<(), NegotiationError> {
        let sender = self.video_sender.lock().take();
        let Some(sender) = sender else {
            return Err(NegotiationError::Sender("no video sender to remove".into()));
        };
        self.pc
            .remove_track(&sender)
            .await
            .map_err(|err| NegotiationError::Sender(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::warn!(target = "call", %err, "peer connection close failed");
        }
    }
}
