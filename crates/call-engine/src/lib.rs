//! Group-call engine: full-mesh peer negotiation for a social app client.
//!
//! The engine establishes one bidirectional media session per remote
//! participant, coordinated over a broadcast signaling room (see the
//! `signal-bus` crate for the transport contract). It owns the join/leave
//! lifecycle, the per-peer offer/answer/ICE state machines including glare
//! resolution and ICE restart, and the local microphone/camera/screen
//! controls with mid-call renegotiation.
//!
//! UI layers consume the engine through [`session::CallHandle`]: a command
//! sender for the user actions and a `watch`-observable [`session::CallState`].

pub mod config;
pub mod identity;
pub mod media;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signaling;

pub use config::CallConfig;
pub use identity::{Identity, LocalParticipant, StaticIdentity};
pub use media::{RemoteTrack, RemoteTrackBacking, TrackKind};
pub use registry::ParticipantSnapshot;
pub use session::{CallError, CallHandle, CallSession, CallState, CallStatus, LocalMediaSnapshot};
pub use signaling::{CandidateInit, Envelope, SdpKind, SessionDescription};
