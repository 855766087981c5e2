//! Sequence numbers.

use std::fmt;
use std::ops::{Add, Sub};

/// Global or local sequence number of an ordered action.
///
/// Seqnos are 64-bit signed and only meaningful within a [`GroupUuid`] epoch.
/// Three values are reserved:
///
/// - [`Seqno::ILL`]: the action was not serialized (service actions,
///   unassigned fields)
/// - [`Seqno::NIL`]: empty history, nothing applied yet
/// - [`Seqno::FIRST`]: the first valid seqno of an epoch
///
/// [`GroupUuid`]: crate::GroupUuid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seqno(pub i64);

impl Seqno {
    /// Illegal seqno. The action was not serialized.
    pub const ILL: Self = Seqno(-1);

    /// Empty history. No actions applied.
    pub const NIL: Self = Seqno(0);

    /// The first seqno of an epoch.
    pub const FIRST: Self = Seqno(1);

    /// Raw value.
    pub fn get(self) -> i64 {
        self.0
    }

    /// The seqno following this one.
    pub fn next(self) -> Self {
        Seqno(self.0 + 1)
    }

    /// Whether this seqno denotes a serialized position (`>= FIRST`).
    pub fn is_ordered(self) -> bool {
        self.0 >= Self::FIRST.0
    }
}

impl From<i64> for Seqno {
    fn from(value: i64) -> Self {
        Seqno(value)
    }
}

impl Add<i64> for Seqno {
    type Output = Seqno;

    fn add(self, rhs: i64) -> Seqno {
        Seqno(self.0 + rhs)
    }
}

impl Sub<Seqno> for Seqno {
    type Output = i64;

    fn sub(self, rhs: Seqno) -> i64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Seqno::ILL => write!(f, "ILL"),
            s => write!(f, "{}", s.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_ordered() {
        assert!(Seqno::ILL < Seqno::NIL);
        assert!(Seqno::NIL < Seqno::FIRST);
        assert!(!Seqno::ILL.is_ordered());
        assert!(!Seqno::NIL.is_ordered());
        assert!(Seqno::FIRST.is_ordered());
    }

    #[test]
    fn arithmetic() {
        assert_eq!(Seqno::NIL.next(), Seqno::FIRST);
        assert_eq!(Seqno(5) + 3, Seqno(8));
        assert_eq!(Seqno(5) - Seqno(2), 3);
    }

    #[test]
    fn display_marks_ill() {
        assert_eq!(Seqno::ILL.to_string(), "ILL");
        assert_eq!(Seqno(42).to_string(), "42");
    }
}
