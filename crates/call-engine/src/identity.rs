//! Seam to the app's identity system. The engine only needs a stable,
//! opaque participant id for the duration of the call plus a display name
//! to ride the join announcement.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalParticipant {
    pub id: String,
    pub display_name: String,
}

pub trait Identity: Send + Sync {
    fn current_participant(&self) -> LocalParticipant;
}

/// Fixed identity, for tests and for embedders that resolve the user
/// before joining.
pub struct StaticIdentity(LocalParticipant);

impl StaticIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self(LocalParticipant {
            id: id.into(),
            display_name: display_name.into(),
        })
    }
}

impl Identity for StaticIdentity {
    fn current_participant(&self) -> LocalParticipant {
        self.0.clone()
    }
}
