//! On-disk persistence for a repository.
//!
//! Four pieces cooperate here. `store` owns the bare git object database
//! and the head ref; `revindex` keeps the side file that turns a
//! revision number into a commit id without walking history; `commit`
//! reads and writes commit objects whose message is a JSON envelope
//! carrying the revision; `apply` stages a change set as an in-memory
//! working tree before it is written back as tree objects.
//!
//! During a commit the pieces run in exactly that order: seed a working
//! tree from the base revision, apply the changes, write the new tree
//! and commit, append to the index, fast-forward the head ref. Reads go
//! the other way, from revision through the index to a tree. git2 types
//! stop at this module's boundary; callers see ids, paths and changes.

pub mod apply;
pub mod commit;
pub mod revindex;
pub mod store;
pub mod types;

pub use apply::WorkingTree;
pub use commit::{CommitInfo, CommitMessage};
pub use revindex::CommitIdIndex;
pub use store::{DeltaKind, GitStore, TreeDelta, HEAD_REF};
pub use types::{BlobId, CommitId, FormatVersion, TreeId};
