//! Roster of remote participants and their negotiation machines.
//!
//! The registry is plain owned state inside the session loop; it never
//! needs locking. At most one controller exists per remote id, which is
//! what makes redelivered join announcements idempotent.

use std::collections::HashMap;

use crate::media::RemoteTrack;
use crate::peer::PeerController;

pub struct PeerEntry {
    pub controller: PeerController,
    pub display_name: String,
}

/// Roster entry as exposed to the UI, ordered by participant id so
/// successive snapshots diff cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSnapshot {
    pub id: String,
    pub display_name: String,
    pub has_video: bool,
    /// Inbound media handles for the embedder to play out or render.
    pub tracks: Vec<RemoteTrack>,
}

#[derive(Default)]
pub struct PeerRegistry {
    entries: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str, entry: PeerEntry) {
        self.entries.insert(id.to_string(), entry);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PeerEntry> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerEntry> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut PeerEntry> {
        self.entries.values_mut()
    }

    /// Ids of peers whose negotiation has reached a terminal state.
    pub fn terminal_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.controller.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn drain(&mut self) -> Vec<PeerEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn snapshot(&self) -> Vec<ParticipantSnapshot> {
        let mut participants: Vec<ParticipantSnapshot> = self
            .entries
            .iter()
            .map(|(id, entry)| ParticipantSnapshot {
                id: id.clone(),
                display_name: entry.display_name.clone(),
                has_video: entry.controller.has_remote_video(),
                tracks: entry.controller.remote_tracks().to_vec(),
            })
            .collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::peer::mock::MockEndpoint;
    use crate::peer::{NegotiationState, PeerEndpoint};
    use crate::signaling::RoomChannel;
    use signal_bus::LocalSignalBus;

    fn entry(local: &str, remote: &str, name: &str) -> PeerEntry {
        let (events, _) = mpsc::unbounded_channel();
        let endpoint = Arc::new(MockEndpoint::new(remote, local, events.clone()));
        let bus = Arc::new(LocalSignalBus::new());
        let controller = PeerController::new(
            local,
            remote,
            endpoint as Arc<dyn PeerEndpoint>,
            RoomChannel::new(bus, "r1"),
            events,
            true,
        );
        PeerEntry {
            controller,
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_id() {
        let mut registry = PeerRegistry::new();
        registry.insert("c", entry("a", "c", "Cleo"));
        registry.insert("b", entry("a", "b", "Bram"));
        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
        assert_eq!(snapshot[0].display_name, "Bram");
        assert!(!snapshot[0].has_video);
    }

    #[tokio::test]
    async fn terminal_ids_flags_closed_peers() {
        let mut registry = PeerRegistry::new();
        registry.insert("b", entry("a", "b", "Bram"));
        registry.insert("c", entry("a", "c", "Cleo"));
        assert!(registry.terminal_ids().is_empty());

        let peer = registry.get_mut("b").expect("entry");
        peer.controller.close().await;
        assert_eq!(peer.controller.state(), NegotiationState::Closed);
        assert_eq!(registry.terminal_ids(), vec!["b".to_string()]);
    }
}
