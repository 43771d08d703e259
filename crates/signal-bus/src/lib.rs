//! Broadcast signaling bus contract for call rooms.
//!
//! A room is a pub/sub topic: every envelope published to it fans out to
//! every subscriber, including the publisher itself. Delivery is
//! at-least-once and carries no ordering guarantee across senders; the
//! call engine is written against exactly that contract, so embedders can
//! bridge `SignalBus` to whatever realtime backend the app already uses.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// One broadcast frame within a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub room: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus subscription lagged, {0} messages dropped")]
    Lagged(u64),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Live subscription to a single room. Dropping it unsubscribes.
pub struct RoomSubscription {
    room: String,
    receiver: broadcast::Receiver<RoomMessage>,
}

impl RoomSubscription {
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Next broadcast for this room. A lagged receiver reports the gap
    /// once and keeps delivering from where the buffer picks back up.
    pub async fn recv(&mut self) -> BusResult<RoomMessage> {
        match self.receiver.recv().await {
            Ok(message) => Ok(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed),
        }
    }
}

/// Room-scoped broadcast transport.
///
/// `subscribe` must be active before `publish` from the same member is
/// expected back: the engine treats a successful subscribe as the
/// confirmation gate before announcing presence.
pub trait SignalBus: Send + Sync {
    fn subscribe(&self, room: &str) -> BusResult<RoomSubscription>;
    fn publish(&self, room: &str, payload: Bytes) -> BusResult<()>;
}

/// In-memory bus for tests and single-process demos.
///
/// Fan-out is self-inclusive by construction: the publisher's own
/// subscription receives everything it sends, matching the production
/// channel configuration the engine was written for.
#[derive(Debug)]
pub struct LocalSignalBus {
    rooms: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<RoomMessage>>>,
    capacity: usize,
}

impl Default for LocalSignalBus {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_ROOM_CAPACITY: usize = 256;

impl LocalSignalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ROOM_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: parking_lot::RwLock::new(std::collections::HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender_for(&self, room: &str) -> broadcast::Sender<RoomMessage> {
        let mut guard = self.rooms.write();
        guard
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl SignalBus for LocalSignalBus {
    fn subscribe(&self, room: &str) -> BusResult<RoomSubscription> {
        Ok(RoomSubscription {
            room: room.to_string(),
            receiver: self.sender_for(room).subscribe(),
        })
    }

    fn publish(&self, room: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(room);
        sender
            .send(RoomMessage {
                room: room.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }
}
