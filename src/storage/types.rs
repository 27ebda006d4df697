//! Identifiers for the object store.
//!
//! Everything git stores hashes down to the same `git2::Oid`, which makes
//! it far too easy to feed a tree hash into a commit lookup. Each object
//! kind gets its own wrapper type here so those mixups fail to compile;
//! only the storage layer can construct one or get the raw `Oid` back
//! out. The repository format version also lives here because open()
//! needs it before anything else is decided.

use std::fmt;

use git2::Oid;

use crate::error::{Error, Result};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) Oid);

        impl $name {
            pub(crate) fn new(oid: Oid) -> Self {
                Self(oid)
            }

            pub(crate) fn raw(&self) -> Oid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

object_id! {
    /// Hash of a commit object; what the commit-id index stores per
    /// revision.
    CommitId
}

object_id! {
    /// Hash of a tree object; also the cache key for tree comparisons.
    TreeId
}

object_id! {
    /// Hash of a file blob inside a tree.
    BlobId
}

impl CommitId {
    /// Parse a commit id from its 40-character hex form.
    pub fn from_hex(hex: &str) -> Result<Self> {
        Ok(Self(Oid::from_str(hex)?))
    }

    /// Abbreviated hex form for log lines and error messages, where the
    /// full 40-character hash drowns out the signal.
    pub fn short_hex(&self) -> String {
        self.0.to_string()[..7].to_string()
    }

    /// The raw hash bytes, in the fixed-width layout the commit-id index
    /// file uses.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self(Oid::from_bytes(bytes)?))
    }
}

impl TreeId {
    /// Abbreviated hex form for log lines.
    pub fn short_hex(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

/// On-disk repository format.
///
/// V1 differs from V0 only in layout details; the version is recorded as
/// an integer in the repository config and checked at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V0,
    V1,
}

impl FormatVersion {
    pub(crate) fn from_config(value: Option<i32>) -> Result<Self> {
        match value {
            None | Some(0) => Ok(FormatVersion::V0),
            Some(1) => Ok(FormatVersion::V1),
            Some(other) => Err(Error::storage(format!(
                "unknown repository format version: {other}"
            ))),
        }
    }

    pub(crate) fn as_int(self) -> i32 {
        match self {
            FormatVersion::V0 => 0,
            FormatVersion::V1 => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_hex_roundtrip() {
        let id = CommitId::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
        assert_eq!(id.to_string(), "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(id.short_hex(), "0123456");
        assert_eq!(CommitId::from_bytes(id.as_bytes()).unwrap(), id);
    }

    #[test]
    fn test_format_version() {
        assert_eq!(FormatVersion::from_config(None).unwrap(), FormatVersion::V0);
        assert_eq!(FormatVersion::from_config(Some(0)).unwrap(), FormatVersion::V0);
        assert_eq!(FormatVersion::from_config(Some(1)).unwrap(), FormatVersion::V1);
        assert!(FormatVersion::from_config(Some(7)).is_err());
    }
}
