//! The dense revision → commit-id index.
//!
//! A single file inside the repository directory maps every revision to
//! its commit id: the slot at byte offset `r * 20` holds the raw 20-byte
//! id of revision `r` (slot 0 is unused padding), so lookup is O(1). The
//! index is the authoritative revision mapping during normal operation;
//! the commit log is only used to rebuild it when the two disagree.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use git2::Repository;

use crate::error::{Error, Result};
use crate::revision::Revision;
use crate::storage::commit;
use crate::storage::store;
use crate::storage::types::CommitId;

const ID_SIZE: usize = 20;

/// file name inside the repository directory
pub const INDEX_FILE: &str = "commit_ids.idx";

pub struct CommitIdIndex {
    path: PathBuf,
    /// `None` once closed; all mutation fails afterwards
    file: Option<File>,
    /// `ids[r - 1]` is the commit id of revision `r`
    ids: Vec<CommitId>,
}

impl CommitIdIndex {
    /// Open (or create) the index file inside a repository directory.
    pub fn open(repo_dir: &Path) -> Result<Self> {
        let path = repo_dir.join(INDEX_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        if !raw.is_empty() && raw.len() % ID_SIZE != 0 {
            return Err(Error::storage(format!(
                "corrupt commit id index at {}: {} bytes",
                path.display(),
                raw.len()
            )));
        }

        let mut ids = Vec::new();
        for chunk in raw.chunks_exact(ID_SIZE).skip(1) {
            ids.push(CommitId::from_bytes(chunk)?);
        }

        Ok(Self { path, file: Some(file), ids })
    }

    /// the highest indexed revision, if any commit has been indexed
    pub fn head_revision(&self) -> Option<Revision> {
        if self.ids.is_empty() {
            None
        } else {
            Some(Revision::new(self.ids.len() as i64))
        }
    }

    /// Look up the commit id of a revision. A missing entry within
    /// `[1, head]` is an engine bug, so this is a storage error rather
    /// than a revision-not-found.
    pub fn get(&self, revision: Revision) -> Result<CommitId> {
        let value = revision.value();
        if value < 1 {
            return Err(Error::storage(format!(
                "commit id index queried with a relative revision: {revision}"
            )));
        }
        self.ids
            .get((value - 1) as usize)
            .copied()
            .ok_or_else(|| Error::storage(format!("missing commit id for revision {revision}")))
    }

    /// Append the id of the next revision. `revision` must be exactly
    /// `head + 1`; the index is append-only.
    pub fn put(&mut self, revision: Revision, id: CommitId) -> Result<()> {
        let expected = self.ids.len() as i64 + 1;
        if revision.value() != expected {
            return Err(Error::storage(format!(
                "non-contiguous commit id index append: {revision} (expected: {expected})"
            )));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::storage("commit id index is closed"))?;

        file.seek(SeekFrom::Start(revision.value() as u64 * ID_SIZE as u64))?;
        file.write_all(id.as_bytes())?;
        file.sync_data()?;
        self.ids.push(id);
        Ok(())
    }

    /// Rebuild the whole index by walking the commit graph back from the
    /// head ref and extracting each commit's revision from its message.
    pub fn rebuild(&mut self, repo: &Repository) -> Result<()> {
        tracing::info!(path = %self.path.display(), "rebuilding commit id index from the commit log");

        let head = store::head_commit_id(repo)?
            .ok_or_else(|| Error::storage("cannot rebuild the commit id index: no head commit"))?;

        let mut chain: Vec<(Revision, CommitId)> = Vec::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let info = commit::read_commit(repo, id)?;
            chain.push((info.revision(), id));
            cursor = info.parent_id;
        }
        chain.reverse();

        for (i, (revision, _)) in chain.iter().enumerate() {
            if revision.value() != i as i64 + 1 {
                return Err(Error::storage(format!(
                    "commit log is not a linear revision chain: found {revision} at position {}",
                    i + 1
                )));
            }
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::storage("commit id index is closed"))?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(ID_SIZE as u64))?;
        for (_, id) in &chain {
            file.write_all(id.as_bytes())?;
        }
        file.sync_data()?;

        self.ids = chain.into_iter().map(|(_, id)| id).collect();
        Ok(())
    }

    /// Close the index. Idempotent; later mutation fails fast.
    pub fn close(&mut self) {
        self.file = None;
    }
}
