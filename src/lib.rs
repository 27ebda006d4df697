//! confstore - a Git-backed versioned configuration store.
//!
//! Each repository keeps JSON and plain-text configuration files in a
//! linearly versioned, content-addressed store: every mutation is an
//! atomic commit, every revision stays addressable forever, and
//! long-poll watchers are notified when a committed change matches a
//! path pattern.
//!
//! # Example
//!
//! ```no_run
//! use confstore::{Author, Change, FindOptions, Markup, RepositoryConfig, RepositoryManager, Revision};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! # async fn example() -> confstore::Result<()> {
//! let manager = RepositoryManager::new("./data", RepositoryConfig::default());
//! let repo = manager.create("alpha", "settings").await?;
//!
//! repo.commit(
//!     Revision::HEAD,
//!     Utc::now(),
//!     Author::new("alice", "alice@example.com"),
//!     "Add a flag",
//!     "",
//!     Markup::Plaintext,
//!     vec![Change::UpsertJson { path: "/flags.json".into(), content: json!({"on": true}) }],
//! )
//! .await?;
//!
//! let entries = repo.find(Revision::HEAD, "/**", FindOptions::default()).await?;
//! assert_eq!(entries.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod jsonpatch;
pub mod model;
pub mod pattern;
pub mod repo;
pub mod revision;
pub mod storage;
pub mod text;

pub use error::{Error, Result};
pub use model::{Author, Change, Commit, Entry, EntryContent, EntryType, Markup, Query};
pub use pattern::PathPattern;
pub use repo::{DiffCache, FindOptions, Repository, RepositoryConfig, RepositoryManager};
pub use revision::{Revision, RevisionRange};
pub use storage::FormatVersion;
