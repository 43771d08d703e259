//! Wire format and room plumbing for call signaling.
//!
//! Envelopes are broadcast to the whole room; addressed kinds carry a
//! `to` field and every member filters on it, since the transport fans
//! out to all subscribers including the sender.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use signal_bus::{BusError, RoomSubscription, SignalBus};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as exchanged during negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickle ICE candidate payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// One broadcast signaling message within a call room.
///
/// Delivery contract (the engine relies on nothing stronger):
/// at-least-once, fan-out to every subscriber including the sender,
/// no ordering guarantee across senders, same-sender order unreliable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Join {
        from: String,
        display_name: String,
    },
    Offer {
        from: String,
        to: String,
        sdp: SessionDescription,
    },
    Answer {
        from: String,
        to: String,
        sdp: SessionDescription,
    },
    Candidate {
        from: String,
        to: String,
        candidate: CandidateInit,
    },
}

impl Envelope {
    pub fn sender(&self) -> &str {
        match self {
            Envelope::Join { from, .. }
            | Envelope::Offer { from, .. }
            | Envelope::Answer { from, .. }
            | Envelope::Candidate { from, .. } => from,
        }
    }

    /// Addressee, when the kind is peer-addressed. `Join` broadcasts.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Envelope::Join { .. } => None,
            Envelope::Offer { to, .. }
            | Envelope::Answer { to, .. }
            | Envelope::Candidate { to, .. } => Some(to),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling transport error: {0}")]
    Bus(#[from] BusError),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A call room on the signaling bus: JSON envelopes over the raw
/// broadcast payloads. Cheap to clone; every peer controller holds one
/// so it can emit addressed envelopes directly.
#[derive(Clone)]
pub struct RoomChannel {
    bus: Arc<dyn SignalBus>,
    topic: String,
}

impl RoomChannel {
    pub fn new(bus: Arc<dyn SignalBus>, room_key: &str) -> Self {
        Self {
            bus,
            topic: format!("call:{room_key}"),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscribing must succeed before the join announcement goes out;
    /// the coordinator treats failure here as terminal call setup.
    pub fn subscribe(&self) -> Result<RoomSubscription, SignalError> {
        Ok(self.bus.subscribe(&self.topic)?)
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), SignalError> {
        let payload = serde_json::to_vec(envelope)?;
        tracing::trace!(
            target = "signal",
            room = %self.topic,
            kind = envelope_kind(envelope),
            to = envelope.recipient().unwrap_or("*"),
            "envelope out"
        );
        self.bus.publish(&self.topic, Bytes::from(payload))?;
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> Result<Envelope, SignalError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

fn envelope_kind(envelope: &Envelope) -> &'static str {
    match envelope {
        Envelope::Join { .. } => "join",
        Envelope::Offer { .. } => "offer",
        Envelope::Answer { .. } => "answer",
        Envelope::Candidate { .. } => "candidate",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_bus::LocalSignalBus;

    #[test]
    fn envelope_wire_format_is_snake_case_tagged() {
        let env = Envelope::Offer {
            from: "a".into(),
            to: "b".into(),
            sdp: SessionDescription::offer("v=0"),
        };
        let json = serde_json::to_string(&env).expect("serialize");
        assert!(json.contains(r#""type":"offer""#), "json: {json}");
        assert!(json.contains(r#""kind":"offer""#), "json: {json}");
        let back = RoomChannel::decode(json.as_bytes()).expect("decode");
        assert_eq!(back, env);
    }

    #[test]
    fn join_has_no_recipient() {
        let env = Envelope::Join {
            from: "a".into(),
            display_name: "Alice".into(),
        };
        assert_eq!(env.sender(), "a");
        assert_eq!(env.recipient(), None);
    }

    #[tokio::test]
    async fn room_round_trip_includes_sender() {
        let bus = Arc::new(LocalSignalBus::new());
        let channel = RoomChannel::new(bus, "r1");
        let mut sub = channel.subscribe().expect("subscribe");
        let env = Envelope::Join {
            from: "a".into(),
            display_name: "Alice".into(),
        };
        channel.send(&env).expect("send");
        let msg = sub.recv().await.expect("recv");
        assert_eq!(RoomChannel::decode(&msg.payload).expect("decode"), env);
    }
}
