//! Monotonic revision numbers and revision ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A point in repository history.
///
/// Positive values are absolute: 1 is the initial commit. Zero and
/// negative values are relative to the current head: 0 and -1 both denote
/// HEAD, -2 the parent of HEAD, and so on. Relative revisions must be
/// normalized against a known head before they can address storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    /// the initial commit of every repository
    pub const INIT: Revision = Revision(1);

    /// the current head, whatever it is
    pub const HEAD: Revision = Revision(-1);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// check if this revision is relative to the head
    pub fn is_relative(&self) -> bool {
        self.0 <= 0
    }

    /// the revision `n` steps ahead (absolute revisions only)
    pub fn forward(self, n: i64) -> Self {
        Self(self.0 + n)
    }

    /// the revision `n` steps behind (absolute revisions only)
    pub fn backward(self, n: i64) -> Self {
        Self(self.0 - n)
    }

    /// Resolve this revision against a known head revision.
    ///
    /// A positive revision must not exceed the head; a non-positive one
    /// maps to `head + n + 1` and must resolve to a positive value.
    pub fn normalize(self, head: Revision) -> Result<Revision> {
        let base = head.0;
        let major = if self.0 > 0 {
            if self.0 > base {
                return Err(Error::RevisionNotFound(self));
            }
            self.0
        } else {
            let major = base + self.0 + 1;
            if major <= 0 {
                return Err(Error::RevisionNotFound(self));
            }
            major
        };
        Ok(Revision(major))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered pair of revisions.
///
/// History and diff queries canonicalize the range internally but keep the
/// caller's ordering intent so results can be returned in the requested
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionRange {
    pub from: Revision,
    pub to: Revision,
}

impl RevisionRange {
    pub fn new(from: Revision, to: Revision) -> Self {
        Self { from, to }
    }

    /// check if the range runs from older to newer (normalized values only)
    pub fn is_ascending(&self) -> bool {
        self.from <= self.to
    }

    /// the same range ordered oldest first
    pub fn to_ascending(self) -> Self {
        if self.is_ascending() {
            self
        } else {
            Self { from: self.to, to: self.from }
        }
    }

    /// the same range ordered newest first
    pub fn to_descending(self) -> Self {
        if self.is_ascending() {
            Self { from: self.to, to: self.from }
        } else {
            self
        }
    }
}

impl fmt::Display for RevisionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_absolute() {
        let head = Revision::new(5);
        assert_eq!(Revision::new(1).normalize(head).unwrap(), Revision::new(1));
        assert_eq!(Revision::new(5).normalize(head).unwrap(), Revision::new(5));
        assert!(matches!(
            Revision::new(6).normalize(head),
            Err(Error::RevisionNotFound(_))
        ));
    }

    #[test]
    fn test_normalize_relative() {
        let head = Revision::new(5);
        assert_eq!(Revision::new(0).normalize(head).unwrap(), Revision::new(5));
        assert_eq!(Revision::HEAD.normalize(head).unwrap(), Revision::new(5));
        assert_eq!(Revision::new(-2).normalize(head).unwrap(), Revision::new(4));
        assert_eq!(Revision::new(-5).normalize(head).unwrap(), Revision::new(1));
        assert!(matches!(
            Revision::new(-6).normalize(head),
            Err(Error::RevisionNotFound(_))
        ));
    }

    #[test]
    fn test_range_ordering() {
        let range = RevisionRange::new(Revision::new(4), Revision::new(2));
        assert!(!range.is_ascending());
        assert_eq!(range.to_ascending().from, Revision::new(2));
        assert_eq!(range.to_descending().from, Revision::new(4));
        assert_eq!(range.to_descending(), range);
    }
}
