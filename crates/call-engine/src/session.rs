//! Call lifecycle coordination.
//!
//! [`CallSession::join`] does the fallible setup inline (microphone,
//! room subscription, join announcement) and then hands the call to a
//! spawned task. That task is the single owner of all mutable call
//! state; envelopes, endpoint events, device events, and user commands
//! all funnel into one sequential loop, so no two negotiation steps for
//! the same peer ever interleave.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::identity::{Identity, LocalParticipant};
use crate::media::{LocalMediaController, LocalTrack, MediaAccessError, MediaDevices, TrackMutation};
use crate::peer::{EndpointEvent, EndpointEventKind, PeerConnector, PeerController, PeerError};
use crate::registry::{ParticipantSnapshot, PeerEntry, PeerRegistry};
use crate::signaling::{Envelope, RoomChannel, SignalError};
use signal_bus::{BusError, RoomSubscription, SignalBus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    /// Setup done locally; peers may still be connecting.
    Connecting,
    Connected,
    /// The call died underneath the user; the message is displayable.
    Error(String),
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalMediaSnapshot {
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
}

/// Everything a UI needs to render the call, published through a
/// `watch` channel so consumers only wake on real changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallState {
    pub status: CallStatus,
    pub participants: Vec<ParticipantSnapshot>,
    pub local: LocalMediaSnapshot,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaAccessError),
    #[error(transparent)]
    Transport(#[from] SignalError),
}

#[derive(Debug, Clone, Copy)]
enum CallCommand {
    ToggleMute,
    ToggleVideo,
    ToggleScreenShare,
    Leave,
}

#[derive(Debug)]
enum MediaEvent {
    TrackEnded { track_id: String },
}

/// The UI's grip on a live call. Commands are fire-and-forget; results
/// show up in the observed [`CallState`]. Dropping the handle leaves the
/// call.
#[derive(Debug)]
pub struct CallHandle {
    participant: LocalParticipant,
    commands: mpsc::UnboundedSender<CallCommand>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    pub fn participant(&self) -> &LocalParticipant {
        &self.participant
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// A receiver for awaiting state changes (`watch` semantics: always
    /// holds the latest state, intermediate states may be skipped).
    pub fn watch(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn toggle_mute(&self) {
        let _ = self.commands.send(CallCommand::ToggleMute);
    }

    pub fn toggle_video(&self) {
        let _ = self.commands.send(CallCommand::ToggleVideo);
    }

    pub fn toggle_screen_share(&self) {
        let _ = self.commands.send(CallCommand::ToggleScreenShare);
    }

    pub fn leave(&self) {
        let _ = self.commands.send(CallCommand::Leave);
    }
}

pub struct CallSession;

impl CallSession {
    /// Join the room's call. Fails only on the two setup steps that make
    /// a call impossible: microphone access and the room subscription.
    /// Everything after this is reported through the state watch.
    pub async fn join(
        room_key: &str,
        bus: Arc<dyn SignalBus>,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
        identity: &dyn Identity,
    ) -> Result<CallHandle, CallError> {
        let participant = identity.current_participant();
        let channel = RoomChannel::new(bus, room_key);
        // Subscribe before announcing, so no envelope addressed to us can
        // slip past between the two.
        let subscription = channel.subscribe()?;

        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let mut media = LocalMediaController::new(devices);
        let audio = media.start_audio().await?;
        watch_track_end(&audio, media_tx.clone());

        channel.send(&Envelope::Join {
            from: participant.id.clone(),
            display_name: participant.display_name.clone(),
        })?;
        tracing::info!(
            target = "call",
            room = %channel.topic(),
            participant = %participant.id,
            "joined call room"
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState {
            status: CallStatus::Connecting,
            participants: Vec::new(),
            local: LocalMediaSnapshot::default(),
        });

        let task = SessionTask {
            participant: participant.clone(),
            channel,
            subscription,
            connector,
            media,
            registry: PeerRegistry::new(),
            status: CallStatus::Connecting,
            commands: commands_rx,
            endpoint_tx,
            endpoint_rx,
            media_tx,
            media_rx,
            state: state_tx,
        };
        tokio::spawn(task.run());

        Ok(CallHandle {
            participant,
            commands: commands_tx,
            state: state_rx,
        })
    }
}

fn watch_track_end(track: &LocalTrack, events: mpsc::UnboundedSender<MediaEvent>) {
    let mut ended = track.ended();
    let track_id = track.id().to_string();
    tokio::spawn(async move {
        loop {
            if *ended.borrow_and_update() {
                let _ = events.send(MediaEvent::TrackEnded { track_id });
                return;
            }
            if ended.changed().await.is_err() {
                return;
            }
        }
    });
}

struct SessionTask {
    participant: LocalParticipant,
    channel: RoomChannel,
    subscription: RoomSubscription,
    connector: Arc<dyn PeerConnector>,
    media: LocalMediaController,
    registry: PeerRegistry,
    status: CallStatus,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    endpoint_tx: mpsc::UnboundedSender<EndpointEvent>,
    endpoint_rx: mpsc::UnboundedReceiver<EndpointEvent>,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    state: watch::Sender<CallState>,
}

impl SessionTask {
    async fn run(mut self) {
        self.status = CallStatus::Connected;
        self.publish_state();
        if let Err(err) = self.event_loop().await {
            tracing::error!(target = "call", %err, "call failed");
            self.status = CallStatus::Error(err.to_string());
            let _ = self.media.stop_all();
            self.close_all_peers().await;
            self.publish_state();
        }
    }

    async fn event_loop(&mut self) -> Result<(), CallError> {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        // A dropped handle leaves the call.
                        Some(CallCommand::Leave) | None => {
                            self.shutdown().await;
                            return Ok(());
                        }
                        Some(command) => self.handle_command(command).await?,
                    }
                }
                event = self.endpoint_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_endpoint_event(event).await?;
                    }
                }
                event = self.media_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_media_event(event).await?;
                    }
                }
                message = self.subscription.recv() => {
                    match message {
                        Ok(message) => self.handle_payload(&message.payload).await?,
                        Err(BusError::Lagged(missed)) => {
                            // Peers re-announce and redeliver; dropped
                            // envelopes heal on the next exchange.
                            tracing::warn!(target = "call", missed, "signaling backlog dropped");
                        }
                        Err(err) => return Err(SignalError::from(err).into()),
                    }
                }
            }
            self.sweep_terminal().await;
            self.drive_all().await?;
            self.publish_state();
        }
    }

    async fn handle_payload(&mut self, payload: &[u8]) -> Result<(), CallError> {
        let envelope = match RoomChannel::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // One peer speaking garbage must not end everyone's call.
                tracing::warn!(target = "call", %err, "dropping malformed envelope");
                return Ok(());
            }
        };
        // The bus echoes our own broadcasts back.
        if envelope.sender() == self.participant.id {
            return Ok(());
        }
        if let Some(to) = envelope.recipient() {
            if to != self.participant.id {
                return Ok(());
            }
        }
        match envelope {
            Envelope::Join { from, display_name } => self.handle_join(from, display_name).await,
            Envelope::Offer { from, sdp, .. } => {
                self.ensure_peer(&from).await?;
                let result = match self.registry.get_mut(&from) {
                    Some(entry) => entry.controller.handle_offer(sdp).await,
                    None => return Ok(()),
                };
                self.peer_result(&from, result).await
            }
            Envelope::Answer { from, sdp, .. } => {
                let result = match self.registry.get_mut(&from) {
                    Some(entry) => entry.controller.handle_answer(sdp).await,
                    None => {
                        tracing::warn!(target = "call", peer = %from, "answer from unknown peer dropped");
                        return Ok(());
                    }
                };
                self.peer_result(&from, result).await
            }
            Envelope::Candidate { from, candidate, .. } => {
                // Candidates can outrun the offer they belong to.
                self.ensure_peer(&from).await?;
                if let Some(entry) = self.registry.get_mut(&from) {
                    entry.controller.handle_candidate(candidate).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_join(&mut self, from: String, display_name: String) -> Result<(), CallError> {
        if let Some(entry) = self.registry.get_mut(&from) {
            if entry.controller.state().is_terminal() {
                // The peer came back after a dead connection; start over.
                if let Some(mut stale) = self.registry.remove(&from) {
                    stale.controller.close().await;
                }
            } else {
                // Redelivered announcement.
                entry.display_name = display_name;
                return Ok(());
            }
        }
        tracing::info!(target = "call", peer = %from, "participant joined");
        // The member already in the room initiates toward the newcomer.
        self.create_peer(&from, display_name, true).await
    }

    /// Create a responder-side controller for a peer we only know from an
    /// addressed envelope. Its display name arrives with the join
    /// announcement, which at-least-once delivery guarantees eventually.
    async fn ensure_peer(&mut self, peer_id: &str) -> Result<(), CallError> {
        if self.registry.contains(peer_id) {
            return Ok(());
        }
        self.create_peer(peer_id, String::new(), false).await
    }

    async fn create_peer(
        &mut self,
        peer_id: &str,
        display_name: String,
        initiator: bool,
    ) -> Result<(), CallError> {
        let endpoint = match self.connector.connect(peer_id, self.endpoint_tx.clone()).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                tracing::warn!(target = "call", peer = %peer_id, %err, "peer connection setup failed");
                return Ok(());
            }
        };
        let mut controller = PeerController::new(
            &self.participant.id,
            peer_id,
            endpoint,
            self.channel.clone(),
            self.endpoint_tx.clone(),
            initiator,
        );
        let mut result = Ok(());
        if let Some(track) = self.media.audio_track() {
            result = controller.attach_track(track).await;
        }
        if result.is_ok() {
            if let Some(track) = self.media.video_track() {
                result = controller.attach_track(track).await;
            }
        }
        if result.is_ok() && initiator {
            result = controller.start_offer(false).await;
        }
        self.registry.insert(
            peer_id,
            PeerEntry {
                controller,
                display_name,
            },
        );
        self.peer_result(peer_id, result).await
    }

    async fn handle_endpoint_event(&mut self, event: EndpointEvent) -> Result<(), CallError> {
        match event.kind {
            EndpointEventKind::Candidate(candidate) => {
                self.channel.send(&Envelope::Candidate {
                    from: self.participant.id.clone(),
                    to: event.peer_id,
                    candidate,
                })?;
                Ok(())
            }
            EndpointEventKind::IceState(state) => {
                let result = match self.registry.get_mut(&event.peer_id) {
                    Some(entry) => entry.controller.on_ice_state(state).await,
                    None => return Ok(()),
                };
                self.peer_result(&event.peer_id, result).await
            }
            EndpointEventKind::RemoteTrackAdded(track) => {
                if let Some(entry) = self.registry.get_mut(&event.peer_id) {
                    entry.controller.add_remote_track(track);
                }
                Ok(())
            }
            EndpointEventKind::RemoteTrackEnded { track_id } => {
                if let Some(entry) = self.registry.get_mut(&event.peer_id) {
                    entry.controller.remove_remote_track(&track_id);
                }
                Ok(())
            }
            EndpointEventKind::NegotiationDeadline(epoch) => {
                // Sweeping happens right after this handler returns.
                if let Some(entry) = self.registry.get_mut(&event.peer_id) {
                    entry.controller.on_negotiation_deadline(epoch);
                }
                Ok(())
            }
        }
    }

    async fn handle_media_event(&mut self, event: MediaEvent) -> Result<(), CallError> {
        let MediaEvent::TrackEnded { track_id } = event;
        let video_ended = self
            .media
            .video_track()
            .map(|track| track.id() == track_id)
            .unwrap_or(false);
        if video_ended {
            // Device revoked the capture (screen share stopped from the
            // OS picker, camera unplugged). Same path as the user toggle.
            tracing::info!(target = "call", "video capture ended by device");
            let (mutation, stopped) = self.media.stop_video_slot();
            return self.apply_mutation(mutation, stopped.as_ref()).await;
        }
        let audio_ended = self
            .media
            .audio_track()
            .map(|track| track.id() == track_id)
            .unwrap_or(false);
        if audio_ended {
            tracing::warn!(target = "call", "microphone track ended");
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: CallCommand) -> Result<(), CallError> {
        match command {
            CallCommand::ToggleMute => {
                let muted = self.media.toggle_mute();
                tracing::debug!(target = "call", muted, "mute toggled");
                Ok(())
            }
            CallCommand::ToggleVideo => {
                if self.media.is_video_enabled() {
                    let (mutation, stopped) = self.media.stop_video_slot();
                    self.apply_mutation(mutation, stopped.as_ref()).await
                } else {
                    match self.media.start_camera().await {
                        Ok((mutation, track)) => {
                            watch_track_end(&track, self.media_tx.clone());
                            self.apply_mutation(mutation, Some(&track)).await
                        }
                        Err(err) => {
                            // Feature-fatal only; the voice call goes on.
                            tracing::warn!(target = "call", %err, "camera unavailable");
                            Ok(())
                        }
                    }
                }
            }
            CallCommand::ToggleScreenShare => {
                if self.media.is_screen_sharing() {
                    let (mutation, stopped) = self.media.stop_video_slot();
                    self.apply_mutation(mutation, stopped.as_ref()).await
                } else {
                    match self.media.start_screen().await {
                        Ok((mutation, track)) => {
                            watch_track_end(&track, self.media_tx.clone());
                            self.apply_mutation(mutation, Some(&track)).await
                        }
                        Err(err) => {
                            tracing::warn!(target = "call", %err, "screen capture unavailable");
                            Ok(())
                        }
                    }
                }
            }
            CallCommand::Leave => Ok(()),
        }
    }

    /// Reflect a local track mutation on every peer connection. Replacing
    /// in place needs no renegotiation; adding or removing a sender does.
    async fn apply_mutation(
        &mut self,
        mutation: TrackMutation,
        track: Option<&LocalTrack>,
    ) -> Result<(), CallError> {
        let mut failed = Vec::new();
        for entry in self.registry.entries_mut() {
            let result = match (mutation, track) {
                (TrackMutation::SenderAdded, Some(track)) => {
                    let result = entry.controller.attach_track(track).await;
                    if result.is_ok() {
                        entry.controller.mark_track_change();
                    }
                    result
                }
                (TrackMutation::SenderReplaced, Some(track)) => {
                    entry.controller.replace_video_track(track).await
                }
                (TrackMutation::SenderRemoved, _) => {
                    let result = entry.controller.remove_video_track().await;
                    if result.is_ok() {
                        entry.controller.mark_track_change();
                    }
                    result
                }
                _ => Ok(()),
            };
            if let Err(err) = result {
                match err {
                    PeerError::Signal(err) => return Err(err.into()),
                    PeerError::Negotiation(err) => {
                        tracing::warn!(
                            target = "call",
                            peer = %entry.controller.remote_id(),
                            %err,
                            "sender update failed; dropping peer"
                        );
                        failed.push(entry.controller.remote_id().to_string());
                    }
                }
            }
        }
        for id in failed {
            if let Some(entry) = self.registry.get_mut(&id) {
                entry.controller.close().await;
            }
        }
        Ok(())
    }

    /// Peer-scoped error policy: signaling failures end the call,
    /// negotiation failures end only that peer.
    async fn peer_result(
        &mut self,
        peer_id: &str,
        result: Result<(), PeerError>,
    ) -> Result<(), CallError> {
        match result {
            Ok(()) => Ok(()),
            Err(PeerError::Signal(err)) => Err(err.into()),
            Err(PeerError::Negotiation(err)) => {
                tracing::warn!(target = "call", peer = %peer_id, %err, "negotiation failed; dropping peer");
                if let Some(entry) = self.registry.get_mut(peer_id) {
                    entry.controller.close().await;
                }
                Ok(())
            }
        }
    }

    async fn sweep_terminal(&mut self) {
        for id in self.registry.terminal_ids() {
            if let Some(mut entry) = self.registry.remove(&id) {
                entry.controller.close().await;
                tracing::info!(target = "call", peer = %id, "participant removed");
            }
        }
    }

    async fn drive_all(&mut self) -> Result<(), CallError> {
        let mut failed = Vec::new();
        for entry in self.registry.entries_mut() {
            if let Err(err) = entry.controller.drive().await {
                match err {
                    PeerError::Signal(err) => return Err(err.into()),
                    PeerError::Negotiation(err) => {
                        tracing::warn!(
                            target = "call",
                            peer = %entry.controller.remote_id(),
                            %err,
                            "deferred renegotiation failed"
                        );
                        failed.push(entry.controller.remote_id().to_string());
                    }
                }
            }
        }
        for id in failed {
            if let Some(entry) = self.registry.get_mut(&id) {
                entry.controller.close().await;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        tracing::info!(target = "call", participant = %self.participant.id, "leaving call");
        let _ = self.media.stop_all();
        self.close_all_peers().await;
        self.status = CallStatus::Ended;
        self.publish_state();
    }

    async fn close_all_peers(&mut self) {
        for mut entry in self.registry.drain() {
            entry.controller.close().await;
        }
    }

    fn snapshot_state(&self) -> CallState {
        CallState {
            status: self.status.clone(),
            participants: self.registry.snapshot(),
            local: LocalMediaSnapshot {
                is_muted: self.media.is_muted(),
                is_video_enabled: self.media.is_video_enabled(),
                is_screen_sharing: self.media.is_screen_sharing(),
            },
        }
    }

    fn publish_state(&self) {
        let next = self.snapshot_state();
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
