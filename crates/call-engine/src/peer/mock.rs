//! Scripted peer endpoints: fabricated SDP, recorded calls, and test
//! hooks to inject endpoint events, so negotiation and the full session
//! loop run without a real peer connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    EndpointEvent, EndpointEventKind, IceConnState, NegotiationError, PeerConnector, PeerEndpoint,
};
use crate::media::{LocalTrack, RemoteTrack, RemoteTrackBacking, TrackKind};
use crate::signaling::{CandidateInit, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    Rollback,
    AddCandidate(String),
    AttachTrack(TrackKind),
    ReplaceVideoTrack(TrackKind),
    RemoveVideoTrack,
    Close,
}

pub struct MockEndpoint {
    peer_id: String,
    label: String,
    counter: AtomicU64,
    calls: Mutex<Vec<EndpointCall>>,
    last_offer: Mutex<String>,
    events: mpsc::UnboundedSender<EndpointEvent>,
}

impl MockEndpoint {
    pub fn new(
        peer_id: impl Into<String>,
        label: impl Into<String>,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            label: label.into(),
            counter: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            last_offer: Mutex::new(String::new()),
            events,
        }
    }

    pub fn calls(&self) -> Vec<EndpointCall> {
        self.calls.lock().clone()
    }

    pub fn count_offers(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, EndpointCall::CreateOffer { .. }))
            .count()
    }

    pub fn count_restart_offers(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, EndpointCall::CreateOffer { ice_restart: true }))
            .count()
    }

    pub fn count_answers(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, EndpointCall::CreateAnswer))
            .count()
    }

    pub fn count_candidates(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, EndpointCall::AddCandidate(_)))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.calls.lock().iter().any(|c| matches!(c, EndpointCall::Close))
    }

    pub fn last_offer_sdp(&self) -> String {
        self.last_offer.lock().clone()
    }

    /// Inject an ICE connectivity transition as the transport would.
    pub fn emit_ice(&self, state: IceConnState) {
        let _ = self.events.send(EndpointEvent {
            peer_id: self.peer_id.clone(),
            kind: EndpointEventKind::IceState(state),
        });
    }

    /// Inject a locally gathered trickle candidate.
    pub fn emit_candidate(&self, candidate: CandidateInit) {
        let _ = self.events.send(EndpointEvent {
            peer_id: self.peer_id.clone(),
            kind: EndpointEventKind::Candidate(candidate),
        });
    }

    /// Inject an inbound track, as `on_track` would surface one. Returns
    /// the generated track id so tests can end it later.
    pub fn emit_remote_track(&self, kind: TrackKind) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-track-{n}", self.label);
        let _ = self.events.send(EndpointEvent {
            peer_id: self.peer_id.clone(),
            kind: EndpointEventKind::RemoteTrackAdded(RemoteTrack {
                id: id.clone(),
                kind,
                backing: RemoteTrackBacking::Null,
            }),
        });
        id
    }

    /// Inject the end of a previously emitted inbound track.
    pub fn emit_remote_track_ended(&self, track_id: impl Into<String>) {
        let _ = self.events.send(EndpointEvent {
            peer_id: self.peer_id.clone(),
            kind: EndpointEventKind::RemoteTrackEnded {
                track_id: track_id.into(),
            },
        });
    }

    fn record(&self, call: EndpointCall) {
        self.calls.lock().push(call);
    }

    fn fabricate_sdp(&self, kind: &str, ice_restart: bool) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let restart = if ice_restart { " ice-restart" } else { "" };
        format!("v=0 {kind} {}->{} #{n}{restart}", self.label, self.peer_id)
    }
}

#[async_trait]
impl PeerEndpoint for MockEndpoint {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        self.record(EndpointCall::CreateOffer { ice_restart });
        let sdp = self.fabricate_sdp("offer", ice_restart);
        *self.last_offer.lock() = sdp.clone();
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(EndpointCall::CreateAnswer);
        Ok(SessionDescription::answer(self.fabricate_sdp("answer", false)))
    }

    async fn set_local_description(
        &self,
        sdp: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(EndpointCall::SetLocal(sdp.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        sdp: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        if sdp.sdp.contains("malformed") {
            return Err(NegotiationError::Description(format!(
                "unparseable sdp: {}",
                sdp.sdp
            )));
        }
        self.record(EndpointCall::SetRemote(sdp.kind));
        Ok(())
    }

    async fn rollback_local(&self) -> Result<(), NegotiationError> {
        self.record(EndpointCall::Rollback);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &CandidateInit) -> Result<(), NegotiationError> {
        self.record(EndpointCall::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.record(EndpointCall::AttachTrack(track.kind()));
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.record(EndpointCall::ReplaceVideoTrack(track.kind()));
        Ok(())
    }

    async fn remove_video_track(&self) -> Result<(), NegotiationError> {
        self.record(EndpointCall::RemoveVideoTrack);
        Ok(())
    }

    async fn close(&self) {
        self.record(EndpointCall::Close);
    }
}

/// Hands out one [`MockEndpoint`] per remote id and keeps them reachable
/// for assertions and event injection.
pub struct MockConnector {
    label: String,
    endpoints: Mutex<HashMap<String, Arc<MockEndpoint>>>,
}

impl MockConnector {
    /// `label` names the local side in fabricated SDP, which makes bus
    /// traces readable when several connectors share a room.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// The most recent endpoint created for this remote, if any.
    pub fn endpoint(&self, peer_id: &str) -> Option<Arc<MockEndpoint>> {
        self.endpoints.lock().get(peer_id).cloned()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Result<Arc<dyn PeerEndpoint>, NegotiationError> {
        let endpoint = Arc::new(MockEndpoint::new(peer_id, self.label.clone(), events));
        self.endpoints
            .lock()
            .insert(peer_id.to_string(), endpoint.clone());
        Ok(endpoint)
    }
}
