//! End-to-end session tests: real coordinator loops talking over an
//! in-process signaling bus, with scripted devices and peer endpoints.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use call_engine::media::mock::MockDevices;
use call_engine::media::{MediaDevices, TrackKind};
use call_engine::peer::mock::MockConnector;
use call_engine::peer::{IceConnState, PeerConnector};
use call_engine::signaling::RoomChannel;
use call_engine::{
    CallError, CallHandle, CallSession, CallState, CallStatus, Envelope, StaticIdentity,
};
use signal_bus::LocalSignalBus;

const ROOM: &str = "standup";
const DEADLINE: Duration = Duration::from_secs(5);

struct Member {
    handle: CallHandle,
    connector: Arc<MockConnector>,
    devices: Arc<MockDevices>,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn join(bus: &Arc<LocalSignalBus>, id: &str, name: &str) -> Member {
    init_logging();
    let connector = Arc::new(MockConnector::new(id));
    let devices = Arc::new(MockDevices::new());
    let handle = CallSession::join(
        ROOM,
        bus.clone(),
        connector.clone() as Arc<dyn PeerConnector>,
        devices.clone() as Arc<dyn MediaDevices>,
        &StaticIdentity::new(id, name),
    )
    .await
    .expect("join");
    Member {
        handle,
        connector,
        devices,
    }
}

async fn wait_for(handle: &CallHandle, mut predicate: impl FnMut(&CallState) -> bool) -> CallState {
    let mut watch = handle.watch();
    timeout(DEADLINE, async {
        loop {
            let state = watch.borrow_and_update().clone();
            if predicate(&state) {
                return state;
            }
            watch.changed().await.expect("session task dropped");
        }
    })
    .await
    .expect("state deadline")
}

/// Poll a condition that is not visible through the state watch, such as
/// call counts on a scripted endpoint.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(DEADLINE, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition deadline");
}

#[tokio::test]
async fn lone_joiner_is_connected_with_empty_roster() {
    let bus = Arc::new(LocalSignalBus::new());
    let member = join(&bus, "a", "Ada").await;
    let state = wait_for(&member.handle, |s| s.status == CallStatus::Connected).await;
    assert!(state.participants.is_empty());
    assert!(!state.local.is_muted);
    assert!(!state.local.is_video_enabled);
}

#[tokio::test]
async fn denied_microphone_fails_the_join() {
    let bus = Arc::new(LocalSignalBus::new());
    let devices = Arc::new(MockDevices::new());
    devices.deny(TrackKind::Audio);
    let err = CallSession::join(
        ROOM,
        bus,
        Arc::new(MockConnector::new("a")) as Arc<dyn PeerConnector>,
        devices as Arc<dyn MediaDevices>,
        &StaticIdentity::new("a", "Ada"),
    )
    .await
    .expect_err("denied microphone");
    assert!(matches!(err, CallError::Media(_)));
}

#[tokio::test]
async fn two_joiners_see_each_other() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    let b = join(&bus, "b", "Bram").await;

    let state_a = wait_for(&a.handle, |s| s.participants.len() == 1).await;
    assert_eq!(state_a.participants[0].id, "b");
    assert_eq!(state_a.participants[0].display_name, "Bram");

    let state_b = wait_for(&b.handle, |s| s.participants.len() == 1).await;
    assert_eq!(state_b.participants[0].id, "a");

    // The member already present initiated; the newcomer answered.
    let a_endpoint = a.connector.endpoint("b").expect("a's endpoint for b");
    assert_eq!(a_endpoint.count_offers(), 1);
    let b_endpoint = b.connector.endpoint("a").expect("b's endpoint for a");
    assert_eq!(b_endpoint.count_answers(), 1);
}

#[tokio::test]
async fn redelivered_join_does_not_recreate_the_peer() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    let _b = join(&bus, "b", "Bram").await;
    wait_for(&a.handle, |s| s.participants.len() == 1).await;
    let before = a.connector.endpoint("b").expect("endpoint");

    let channel = RoomChannel::new(bus.clone(), ROOM);
    channel
        .send(&Envelope::Join {
            from: "b".into(),
            display_name: "Bram".into(),
        })
        .expect("redeliver join");

    // Give the loop time to mishandle it if it were going to.
    sleep(Duration::from_millis(50)).await;
    let state = wait_for(&a.handle, |s| s.participants.len() == 1).await;
    assert_eq!(state.participants.len(), 1);
    let after = a.connector.endpoint("b").expect("endpoint");
    assert!(Arc::ptr_eq(&before, &after), "peer was recreated");
    assert_eq!(before.count_offers(), 1);
}

#[tokio::test]
async fn mute_toggle_round_trips_through_state() {
    let bus = Arc::new(LocalSignalBus::new());
    let member = join(&bus, "a", "Ada").await;
    wait_for(&member.handle, |s| s.status == CallStatus::Connected).await;

    member.handle.toggle_mute();
    wait_for(&member.handle, |s| s.local.is_muted).await;
    member.handle.toggle_mute();
    wait_for(&member.handle, |s| !s.local.is_muted).await;
}

#[tokio::test]
async fn denied_camera_is_fatal_to_the_feature_not_the_call() {
    let bus = Arc::new(LocalSignalBus::new());
    let member = join(&bus, "a", "Ada").await;
    wait_for(&member.handle, |s| s.status == CallStatus::Connected).await;

    member.devices.deny(TrackKind::Camera);
    member.handle.toggle_video();
    sleep(Duration::from_millis(50)).await;
    let state = member.handle.state();
    assert!(!state.local.is_video_enabled);
    assert_eq!(state.status, CallStatus::Connected);

    // Mute still works; the call carried on.
    member.handle.toggle_mute();
    wait_for(&member.handle, |s| s.local.is_muted).await;
}

#[tokio::test]
async fn screen_share_renegotiates_exactly_once() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    let b = join(&bus, "b", "Bram").await;
    wait_for(&a.handle, |s| s.participants.len() == 1).await;
    wait_for(&b.handle, |s| s.participants.len() == 1).await;
    let a_endpoint = a.connector.endpoint("b").expect("endpoint");
    assert_eq!(a_endpoint.count_offers(), 1);

    a.handle.toggle_screen_share();
    let state = wait_for(&a.handle, |s| s.local.is_screen_sharing).await;
    assert!(!state.local.is_video_enabled);

    // New sender means one renegotiation offer, answered by the peer.
    wait_until(|| a_endpoint.count_offers() == 2).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(a_endpoint.count_offers(), 2);

    // Stopping the share removes the sender and renegotiates again.
    a.handle.toggle_screen_share();
    wait_for(&a.handle, |s| !s.local.is_screen_sharing).await;
    wait_until(|| a_endpoint.count_offers() == 3).await;
}

#[tokio::test]
async fn screen_capture_revocation_stops_the_share() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    let _b = join(&bus, "b", "Bram").await;
    wait_for(&a.handle, |s| s.participants.len() == 1).await;
    let endpoint = a.connector.endpoint("b").expect("endpoint");

    a.handle.toggle_screen_share();
    wait_for(&a.handle, |s| s.local.is_screen_sharing).await;
    wait_until(|| endpoint.count_offers() == 2).await;

    // The OS pulling the capture session behaves like a user stop.
    a.devices.end_tracks(TrackKind::Screen);
    wait_for(&a.handle, |s| !s.local.is_screen_sharing).await;
    wait_until(|| endpoint.count_offers() == 3).await;
}

#[tokio::test]
async fn remote_tracks_show_up_in_the_roster() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    let b = join(&bus, "b", "Bram").await;
    wait_for(&b.handle, |s| s.participants.len() == 1).await;

    // Inbound audio surfaces its handle but flags no video.
    let b_endpoint = b.connector.endpoint("a").expect("endpoint");
    let audio_id = b_endpoint.emit_remote_track(TrackKind::Audio);
    let state = wait_for(&b.handle, |s| {
        s.participants.first().map(|p| !p.tracks.is_empty()).unwrap_or(false)
    })
    .await;
    assert_eq!(state.participants[0].id, "a");
    assert_eq!(state.participants[0].tracks[0].id, audio_id);
    assert!(!state.participants[0].has_video);

    let video_id = b_endpoint.emit_remote_track(TrackKind::Camera);
    let state = wait_for(&b.handle, |s| {
        s.participants.first().map(|p| p.has_video).unwrap_or(false)
    })
    .await;
    assert_eq!(state.participants[0].tracks.len(), 2);

    b_endpoint.emit_remote_track_ended(video_id);
    let state = wait_for(&b.handle, |s| {
        s.participants.first().map(|p| !p.has_video).unwrap_or(false)
    })
    .await;
    assert_eq!(state.participants[0].tracks.len(), 1);
    drop(a);
}

#[tokio::test]
async fn failed_peer_is_swept_and_rejoin_recreates_it() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    let _b = join(&bus, "b", "Bram").await;
    wait_for(&a.handle, |s| s.participants.len() == 1).await;
    let old = a.connector.endpoint("b").expect("endpoint");

    // First failure triggers the one allowed ICE restart; the second,
    // still in the same outage, is terminal for the peer.
    old.emit_ice(IceConnState::Failed);
    old.emit_ice(IceConnState::Failed);
    wait_for(&a.handle, |s| s.participants.is_empty()).await;
    assert_eq!(old.count_restart_offers(), 1);
    assert!(old.is_closed());

    // The peer announcing again starts a fresh connection.
    let channel = RoomChannel::new(bus.clone(), ROOM);
    channel
        .send(&Envelope::Join {
            from: "b".into(),
            display_name: "Bram".into(),
        })
        .expect("rejoin");
    wait_for(&a.handle, |s| s.participants.len() == 1).await;
    let new = a.connector.endpoint("b").expect("endpoint");
    assert!(!Arc::ptr_eq(&old, &new), "stale endpoint was reused");
}

#[tokio::test]
async fn responder_waits_out_an_outage_then_gives_up() {
    let bus = Arc::new(LocalSignalBus::new());
    let _a = join(&bus, "a", "Ada").await;
    let b = join(&bus, "b", "Bram").await;
    wait_for(&b.handle, |s| s.participants.len() == 1).await;

    // b answered a's offer, so b is not the initiator and never
    // restarts on its own.
    let endpoint = b.connector.endpoint("a").expect("endpoint");
    endpoint.emit_ice(IceConnState::Failed);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(endpoint.count_restart_offers(), 0);

    endpoint.emit_ice(IceConnState::Failed);
    wait_for(&b.handle, |s| s.participants.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn ghost_joiner_is_swept_when_the_offer_goes_unanswered() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    wait_for(&a.handle, |s| s.status == CallStatus::Connected).await;

    // A join announcement from a peer that vanishes before answering:
    // no answer, no candidates, no ICE activity at all.
    let channel = RoomChannel::new(bus.clone(), ROOM);
    channel
        .send(&Envelope::Join {
            from: "zz".into(),
            display_name: "Ghost".into(),
        })
        .expect("ghost join");
    wait_for(&a.handle, |s| s.participants.len() == 1).await;
    let endpoint = a.connector.endpoint("zz").expect("endpoint");
    assert_eq!(endpoint.count_offers(), 1);

    // Past the negotiation deadline the peer is reaped from the roster.
    // Longer bound than the usual one so it cannot fire first under
    // auto-advanced time.
    let mut watch = a.handle.watch();
    timeout(Duration::from_secs(30), async {
        loop {
            if watch.borrow_and_update().participants.is_empty() {
                return;
            }
            watch.changed().await.expect("session task dropped");
        }
    })
    .await
    .expect("ghost peer lingered");
    assert!(endpoint.is_closed());
    assert_eq!(endpoint.count_offers(), 1);
    assert_eq!(a.handle.state().status, CallStatus::Connected);
}

#[tokio::test]
async fn leave_ends_the_call_and_closes_endpoints() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    let _b = join(&bus, "b", "Bram").await;
    wait_for(&a.handle, |s| s.participants.len() == 1).await;
    let endpoint = a.connector.endpoint("b").expect("endpoint");

    a.handle.leave();
    let state = wait_for(&a.handle, |s| s.status == CallStatus::Ended).await;
    assert!(state.participants.is_empty());
    assert!(endpoint.is_closed());
}

#[tokio::test]
async fn dropping_the_handle_leaves_the_call() {
    let bus = Arc::new(LocalSignalBus::new());
    let a = join(&bus, "a", "Ada").await;
    let _b = join(&bus, "b", "Bram").await;
    wait_for(&a.handle, |s| s.participants.len() == 1).await;
    let endpoint = a.connector.endpoint("b").expect("endpoint");

    drop(a);
    timeout(DEADLINE, async {
        while !endpoint.is_closed() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("endpoint close deadline");
}
