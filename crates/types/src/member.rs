//! Group membership: member identity and configuration views.

use std::fmt;

use thiserror::Error;

/// Maximum member name length in bytes, including the wire terminator.
pub const MEMBER_NAME_MAX: usize = 40;

/// Errors constructing a [`MemberId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemberIdError {
    #[error("member id is empty")]
    Empty,
    #[error("member id exceeds {max} bytes: got {got}", max = MEMBER_NAME_MAX - 1)]
    TooLong { got: usize },
    #[error("member id contains an interior NUL byte")]
    InteriorNul,
}

/// Stable identity of a group member.
///
/// Member ids survive view changes (unlike member indexes, which are
/// positions within one configuration) and travel in CONF payloads as
/// null-terminated strings, hence the length and NUL restrictions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Result<Self, MemberIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(MemberIdError::Empty);
        }
        if id.len() > MEMBER_NAME_MAX - 1 {
            return Err(MemberIdError::TooLong { got: id.len() });
        }
        if id.bytes().any(|b| b == 0) {
            return Err(MemberIdError::InteriorNul);
        }
        Ok(MemberId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw membership view as reported by the group transport.
///
/// The view carries identities and positions only; each member's history
/// position travels through the ordered stream in the state exchange round
/// that follows every primary view. `view_id` is monotonically increasing
/// within the backend's group layer and becomes the CONF `conf_id` for
/// primary views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub view_id: i64,
    pub primary: bool,
    pub members: Vec<MemberId>,
    pub my_idx: usize,
}

impl View {
    /// Index of `id` within this view.
    pub fn index_of(&self, id: &MemberId) -> Option<usize> {
        self.members.iter().position(|m| m == id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
