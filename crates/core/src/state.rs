//! Connection lifecycle states.

use std::fmt;

/// States of a GCS connection.
///
/// ```text
/// Created --init--> Inited --open--> OpenNonPrimary
/// OpenNonPrimary <--view(non-prim)-- OpenPrimary
/// OpenPrimary --state-req--> Joiner --JOIN(ok)--> Joined --SYNC--> Synced
/// any --close--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Handle exists, no history hint installed.
    Created,
    /// History hint installed via `init`.
    Inited,
    /// Channel joined, waiting for a primary configuration.
    OpenNonPrimary,
    /// In a primary configuration, state transfer still required.
    OpenPrimary,
    /// State transfer request ordered; waiting for the donor.
    Joiner,
    /// State transfer finished (or none was needed); catching up.
    Joined,
    /// Fully synchronized with the group.
    Synced,
    /// Terminal.
    Closed,
}

impl ConnState {
    /// Whether the channel has been opened and not yet closed.
    pub fn is_open(self) -> bool {
        !matches!(self, ConnState::Created | ConnState::Inited | ConnState::Closed)
    }

    /// Whether the connection is inside a primary configuration, i.e.
    /// ordered progress is possible.
    pub fn is_primary(self) -> bool {
        matches!(
            self,
            ConnState::OpenPrimary | ConnState::Joiner | ConnState::Joined | ConnState::Synced
        )
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            ConnState::Created => "Created",
            ConnState::Inited => "Inited",
            ConnState::OpenNonPrimary => "OpenNonPrimary",
            ConnState::OpenPrimary => "OpenPrimary",
            ConnState::Joiner => "Joiner",
            ConnState::Joined => "Joined",
            ConnState::Synced => "Synced",
            ConnState::Closed => "Closed",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
