//! Group history epoch identity.

use std::fmt;

use uuid::Uuid;

/// 16-byte identity of a group history epoch.
///
/// Every seqno is meaningful only under a group uuid: a diverging uuid means
/// a diverging history, regardless of how the seqnos compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupUuid(Uuid);

impl GroupUuid {
    /// No history. Used by nodes that never belonged to a primary component.
    pub const ZERO: Self = GroupUuid(Uuid::nil());

    /// Length of the serialized form in bytes.
    pub const LEN: usize = 16;

    /// A fresh random epoch identity.
    pub fn random() -> Self {
        GroupUuid(Uuid::new_v4())
    }

    /// Deterministically derive an epoch identity from seed bytes.
    ///
    /// Every member hashing the same seed arrives at the same uuid, which is
    /// how a fresh group agrees on its identity without an extra exchange.
    pub fn derive(seed: &[u8]) -> Self {
        GroupUuid(Uuid::new_v5(&Uuid::NAMESPACE_OID, seed))
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        GroupUuid(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        self.0.as_bytes()
    }

    /// Whether this uuid denotes an actual history epoch.
    pub fn is_set(&self) -> bool {
        !self.0.is_nil()
    }
}

impl Default for GroupUuid {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for GroupUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
