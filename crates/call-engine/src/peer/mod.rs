//! Per-remote-participant negotiation: an explicit state machine over an
//! abstract [`PeerEndpoint`], so the offer/answer/ICE logic and the glare
//! tie-break are testable without a real peer connection.

pub mod mock;
pub mod rtc;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::{CandidateInit, Envelope, RoomChannel, SdpKind, SessionDescription, SignalError};

/// How long an offer may wait for its answer. A peer that leaves before
/// answering produces no ICE activity at all (no remote description means
/// ICE never starts), so negotiation needs its own deadline.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

/// ICE connectivity as the engine cares about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("media sender update failed: {0}")]
    Sender(String),
    #[error("peer connection setup failed: {0}")]
    Setup(String),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Asynchronous notification from an endpoint, posted into the session
/// loop rather than handled in the callback. Endpoint callbacks never
/// touch coordinator state directly.
#[derive(Debug, Clone)]
pub struct EndpointEvent {
    pub peer_id: String,
    pub kind: EndpointEventKind,
}

#[derive(Debug, Clone)]
pub enum EndpointEventKind {
    /// A locally gathered trickle candidate ready to be signaled.
    Candidate(CandidateInit),
    IceState(IceConnState),
    /// An inbound media track arrived; the handle is surfaced to the
    /// embedder through the roster.
    RemoteTrackAdded(RemoteTrack),
    RemoteTrackEnded { track_id: String },
    /// The offer armed under this epoch never got its answer.
    NegotiationDeadline(u64),
}

/// The slice of a peer connection the negotiation machine needs.
///
/// One production implementation wraps `webrtc` ([`rtc`]); the scripted
/// one ([`mock`]) drives the machine deterministically in tests.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, sdp: &SessionDescription)
    -> Result<(), NegotiationError>;
    async fn set_remote_description(&self, sdp: &SessionDescription)
    -> Result<(), NegotiationError>;
    /// Discard the pending local offer (glare loser path).
    async fn rollback_local(&self) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: &CandidateInit) -> Result<(), NegotiationError>;
    /// Attach a new outgoing sender for this track.
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;
    /// Swap the video sender's track in place; no new sender.
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;
    /// Drop the video sender entirely.
    async fn remove_video_track(&self) -> Result<(), NegotiationError>;
    async fn close(&self);
}

/// Creates endpoints on demand as participants appear.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Result<Arc<dyn PeerEndpoint>, NegotiationError>;
}

/// Negotiation state machine for one remote participant.
///
/// Owned exclusively by the call coordinator; there is at most one per
/// remote id at any time. All envelope emission goes straight out the
/// room channel, addressed to the remote.
pub struct PeerController {
    local_id: String,
    remote_id: String,
    endpoint: Arc<dyn PeerEndpoint>,
    channel: RoomChannel,
    events: mpsc::UnboundedSender<EndpointEvent>,
    state: NegotiationState,
    initiator: bool,
    remote_description_set: bool,
    last_remote_offer: Option<String>,
    queued_candidates: Vec<CandidateInit>,
    seen_candidates: HashSet<String>,
    needs_renegotiation: bool,
    restart_in_flight: bool,
    offer_epoch: u64,
    remote_tracks: Vec<RemoteTrack>,
}

impl PeerController {
    pub fn new(
        local_id: &str,
        remote_id: &str,
        endpoint: Arc<dyn PeerEndpoint>,
        channel: RoomChannel,
        events: mpsc::UnboundedSender<EndpointEvent>,
        initiator: bool,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            endpoint,
            channel,
            events,
            state: NegotiationState::New,
            initiator,
            remote_description_set: false,
            last_remote_offer: None,
            queued_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            needs_renegotiation: false,
            restart_in_flight: false,
            offer_epoch: 0,
            remote_tracks: Vec::new(),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn has_remote_video(&self) -> bool {
        self.remote_tracks.iter().any(|track| track.kind.is_video())
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn add_remote_track(&mut self, track: RemoteTrack) {
        // Idempotent against the transport firing twice for one track.
        if !self.remote_tracks.iter().any(|t| t.id == track.id) {
            self.remote_tracks.push(track);
        }
    }

    pub fn remove_remote_track(&mut self, track_id: &str) {
        self.remote_tracks.retain(|track| track.id != track_id);
    }

    /// Glare tie-break: deterministic by participant-id comparison, so
    /// both sides agree who yields even when both are mid-offer. The
    /// lexicographically smaller id is polite and rolls back.
    fn is_polite(&self) -> bool {
        self.local_id < self.remote_id
    }

    /// Build, store, and send an offer. Legal from `new`/`stable`; an
    /// ICE restart is also allowed to stomp a pending local offer, since
    /// the previous one is dead on the wire anyway.
    pub async fn start_offer(&mut self, ice_restart: bool) -> Result<(), PeerError> {
        match self.state {
            NegotiationState::New | NegotiationState::Stable => {}
            NegotiationState::HaveLocalOffer if ice_restart => {}
            NegotiationState::HaveLocalOffer | NegotiationState::HaveRemoteOffer => {
                // Mid-negotiation; single-flight. Picked up by drive()
                // once the current round settles.
                self.needs_renegotiation = true;
                return Ok(());
            }
            NegotiationState::Failed | NegotiationState::Closed => return Ok(()),
        }
        let offer = self.endpoint.create_offer(ice_restart).await?;
        self.endpoint.set_local_description(&offer).await?;
        self.state = NegotiationState::HaveLocalOffer;
        self.offer_epoch += 1;
        self.arm_deadline();
        tracing::debug!(
            target = "call",
            peer = %self.remote_id,
            ice_restart,
            "offer sent"
        );
        self.channel.send(&Envelope::Offer {
            from: self.local_id.clone(),
            to: self.remote_id.clone(),
            sdp: offer,
        })?;
        Ok(())
    }

    /// Schedule a wake-up for the offer just sent. The event loops back
    /// through the session so the check runs on coordinator state, not in
    /// a detached task.
    fn arm_deadline(&self) {
        let events = self.events.clone();
        let peer_id = self.remote_id.clone();
        let epoch = self.offer_epoch;
        tokio::spawn(async move {
            tokio::time::sleep(NEGOTIATION_TIMEOUT).await;
            let _ = events.send(EndpointEvent {
                peer_id,
                kind: EndpointEventKind::NegotiationDeadline(epoch),
            });
        });
    }

    /// The deadline armed with `epoch` fired. Stale if negotiation moved
    /// on since; fatal for the peer if its offer is still unanswered.
    pub fn on_negotiation_deadline(&mut self, epoch: u64) {
        if self.state == NegotiationState::HaveLocalOffer && epoch == self.offer_epoch {
            tracing::warn!(
                target = "call",
                peer = %self.remote_id,
                "offer unanswered past deadline; giving up on peer"
            );
            self.state = NegotiationState::Failed;
        }
    }

    pub async fn handle_offer(&mut self, sdp: SessionDescription) -> Result<(), PeerError> {
        if sdp.kind != SdpKind::Offer {
            return Err(NegotiationError::Description("offer envelope without offer sdp".into()).into());
        }
        // At-least-once delivery can replay an old offer after a newer
        // round already settled; re-applying it would revert that round.
        if self.last_remote_offer.as_deref() == Some(sdp.sdp.as_str()) {
            tracing::debug!(target = "call", peer = %self.remote_id, "stale offer replay ignored");
            return Ok(());
        }
        match self.state {
            NegotiationState::New | NegotiationState::Stable => self.accept_offer(sdp).await,
            NegotiationState::HaveLocalOffer => {
                if self.is_polite() {
                    tracing::debug!(
                        target = "call",
                        peer = %self.remote_id,
                        "glare: rolling back local offer"
                    );
                    self.endpoint.rollback_local().await?;
                    self.state = NegotiationState::Stable;
                    self.accept_offer(sdp).await
                } else {
                    // The remote is the polite side; it will roll back
                    // and answer the offer we already sent.
                    tracing::debug!(
                        target = "call",
                        peer = %self.remote_id,
                        "glare: discarding colliding remote offer"
                    );
                    Ok(())
                }
            }
            NegotiationState::HaveRemoteOffer => {
                // At-least-once redelivery of the offer we are answering.
                tracing::debug!(target = "call", peer = %self.remote_id, "duplicate offer ignored");
                Ok(())
            }
            NegotiationState::Failed | NegotiationState::Closed => Ok(()),
        }
    }

    async fn accept_offer(&mut self, sdp: SessionDescription) -> Result<(), PeerError> {
        self.endpoint.set_remote_description(&sdp).await?;
        self.remote_description_set = true;
        self.last_remote_offer = Some(sdp.sdp.clone());
        self.state = NegotiationState::HaveRemoteOffer;
        self.flush_candidates().await;
        let answer = self.endpoint.create_answer().await?;
        self.endpoint.set_local_description(&answer).await?;
        self.state = NegotiationState::Stable;
        tracing::debug!(target = "call", peer = %self.remote_id, "answer sent");
        self.channel.send(&Envelope::Answer {
            from: self.local_id.clone(),
            to: self.remote_id.clone(),
            sdp: answer,
        })?;
        Ok(())
    }

    pub async fn handle_answer(&mut self, sdp: SessionDescription) -> Result<(), PeerError> {
        if self.state != NegotiationState::HaveLocalOffer {
            // Stray or redelivered answer; harmless.
            tracing::debug!(
                target = "call",
                peer = %self.remote_id,
                state = ?self.state,
                "answer ignored outside have-local-offer"
            );
            return Ok(());
        }
        if sdp.kind != SdpKind::Answer {
            return Err(
                NegotiationError::Description("answer envelope without answer sdp".into()).into(),
            );
        }
        self.endpoint.set_remote_description(&sdp).await?;
        self.remote_description_set = true;
        self.state = NegotiationState::Stable;
        self.flush_candidates().await;
        tracing::debug!(target = "call", peer = %self.remote_id, "negotiation stable");
        Ok(())
    }

    /// Candidates are queued unconditionally until a remote description
    /// lands: with no cross-sender ordering guarantee they routinely
    /// arrive before the offer they belong to.
    pub async fn handle_candidate(&mut self, candidate: CandidateInit) {
        if self.state.is_terminal() {
            return;
        }
        if !self.seen_candidates.insert(candidate.candidate.clone()) {
            tracing::trace!(target = "call", peer = %self.remote_id, "duplicate candidate");
            return;
        }
        if self.remote_description_set {
            self.apply_candidate(&candidate).await;
        } else {
            self.queued_candidates.push(candidate);
        }
    }

    async fn flush_candidates(&mut self) {
        let queued = std::mem::take(&mut self.queued_candidates);
        for candidate in &queued {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: &CandidateInit) {
        // A bad candidate is not fatal to the peer; connectivity can
        // still establish through the others.
        if let Err(err) = self.endpoint.add_ice_candidate(candidate).await {
            tracing::warn!(target = "call", peer = %self.remote_id, %err, "candidate rejected");
        }
    }

    /// ICE connectivity changed. The original initiator gets one restart
    /// attempt per outage; the responder waits for the restart offer.
    pub async fn on_ice_state(&mut self, ice: IceConnState) -> Result<(), PeerError> {
        match ice {
            IceConnState::Connected => {
                self.restart_in_flight = false;
                Ok(())
            }
            IceConnState::Failed | IceConnState::Disconnected => {
                if self.state.is_terminal() {
                    return Ok(());
                }
                if self.restart_in_flight {
                    if ice == IceConnState::Failed {
                        tracing::warn!(
                            target = "call",
                            peer = %self.remote_id,
                            "ice failed after restart attempt; giving up on peer"
                        );
                        self.state = NegotiationState::Failed;
                    }
                    return Ok(());
                }
                if self.initiator {
                    tracing::info!(target = "call", peer = %self.remote_id, "attempting ice restart");
                    self.restart_in_flight = true;
                    self.start_offer(true).await
                } else {
                    // Non-initiators wait for the initiator's restart
                    // offer rather than racing it.
                    tracing::debug!(target = "call", peer = %self.remote_id, ?ice, "awaiting ice restart");
                    if ice == IceConnState::Failed {
                        self.restart_in_flight = true;
                    }
                    Ok(())
                }
            }
            IceConnState::Closed => {
                self.state = NegotiationState::Closed;
                Ok(())
            }
            IceConnState::New | IceConnState::Checking => Ok(()),
        }
    }

    /// Mark that the local track set changed; `drive` re-offers once the
    /// machine is out of any in-flight round.
    pub fn mark_track_change(&mut self) {
        self.needs_renegotiation = true;
    }

    pub async fn attach_track(&mut self, track: &LocalTrack) -> Result<(), PeerError> {
        self.endpoint.attach_track(track).await?;
        Ok(())
    }

    pub async fn replace_video_track(&mut self, track: &LocalTrack) -> Result<(), PeerError> {
        self.endpoint.replace_video_track(track).await?;
        Ok(())
    }

    pub async fn remove_video_track(&mut self) -> Result<(), PeerError> {
        self.endpoint.remove_video_track().await?;
        Ok(())
    }

    /// Kick off a deferred renegotiation if one is due and the machine is
    /// settled. Called by the coordinator after every dispatched event.
    pub async fn drive(&mut self) -> Result<(), PeerError> {
        if self.needs_renegotiation
            && matches!(self.state, NegotiationState::Stable | NegotiationState::New)
        {
            self.needs_renegotiation = false;
            self.start_offer(false).await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.state != NegotiationState::Closed {
            self.endpoint.close().await;
            self.state = NegotiationState::Closed;
            tracing::debug!(target = "call", peer = %self.remote_id, "peer closed");
        }
    }
}
