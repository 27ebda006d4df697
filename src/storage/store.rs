//! The content-addressed object store.
//!
//! [`GitStore`] owns the location and format of a bare git repository and
//! hands out per-operation `git2::Repository` handles; separate handles
//! are safe for concurrent readers, while writers are serialized by the
//! repository's exclusive lock one layer up. Everything above this module
//! speaks in paths, revisions and changes and never touches git2 types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use git2::{
    Delta, DiffOptions, ErrorCode, ObjectType, Repository, RepositoryInitOptions, TreeWalkMode,
    TreeWalkResult,
};

use crate::error::{Error, Result};
use crate::storage::types::{BlobId, CommitId, FormatVersion, TreeId};

/// the single branch every repository commits to
pub const HEAD_REF: &str = "refs/heads/main";

const FORMAT_KEY: &str = "confstore.formatversion";

const FILE_MODE_BLOB: i32 = 0o100644;
const FILE_MODE_TREE: i32 = 0o040000;

/// Location and format of one bare repository on disk.
pub struct GitStore {
    path: PathBuf,
    format: FormatVersion,
}

impl GitStore {
    /// Initialize a new bare repository.
    ///
    /// Fails if the directory already holds one. File modes, symlinks and
    /// hidden-file semantics are disabled; the format version is recorded
    /// in the repository config.
    pub fn create(dir: &Path) -> Result<Self> {
        if dir.join("config").is_file() {
            return Err(Error::storage(format!(
                "failed to create a repository at {}: exists already",
                dir.display()
            )));
        }

        let mut opts = RepositoryInitOptions::new();
        opts.bare(true).no_reinit(true).mkpath(true).initial_head("main");
        let repo = Repository::init_opts(dir, &opts)?;

        let mut config = repo.config()?;
        config.set_i32(FORMAT_KEY, FormatVersion::V1.as_int())?;
        config.set_bool("core.symlinks", false)?;
        config.set_bool("core.filemode", false)?;
        config.set_str("core.hidedotfiles", "false")?;
        config.set_bool("commit.gpgsign", false)?;
        config.set_str("diff.algorithm", "histogram")?;
        config.set_bool("diff.renames", false)?;

        Ok(Self { path: dir.to_path_buf(), format: FormatVersion::V1 })
    }

    /// Open an existing bare repository, detecting its format version.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.join("config").is_file() {
            return Err(Error::RepositoryNotFound(dir.display().to_string()));
        }
        let repo = Repository::open_bare(dir)?;
        let format = read_format(&repo)?;
        Ok(Self { path: dir.to_path_buf(), format })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FormatVersion {
        self.format
    }

    /// Open a fresh `git2` handle for one operation.
    pub(crate) fn open_git(&self) -> Result<Repository> {
        Ok(Repository::open_bare(&self.path)?)
    }
}

fn read_format(repo: &Repository) -> Result<FormatVersion> {
    let config = repo.config()?.snapshot()?;
    match config.get_i32(FORMAT_KEY) {
        Ok(value) => FormatVersion::from_config(Some(value)),
        Err(e) if e.code() == ErrorCode::NotFound => FormatVersion::from_config(None),
        Err(e) => Err(e.into()),
    }
}

/// write raw bytes as a blob, returning its content hash
pub fn write_blob(repo: &Repository, bytes: &[u8]) -> Result<BlobId> {
    Ok(BlobId::new(repo.blob(bytes)?))
}

/// read a blob's content
pub fn read_blob(repo: &Repository, id: BlobId) -> Result<Vec<u8>> {
    Ok(repo.find_blob(id.raw())?.content().to_vec())
}

/// read a blob and parse it as a JSON document
pub fn read_json_blob(repo: &Repository, id: BlobId) -> Result<serde_json::Value> {
    let bytes = read_blob(repo, id)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::storage(format!("stored blob {id} is not valid JSON: {e}")))
}

/// read a blob as sanitized UTF-8 text
pub fn read_text_blob(repo: &Repository, id: BlobId) -> Result<String> {
    let bytes = read_blob(repo, id)?;
    let raw = String::from_utf8(bytes)
        .map_err(|e| Error::storage(format!("stored blob {id} is not valid UTF-8: {e}")))?;
    Ok(crate::text::sanitize(&raw))
}

/// the tree a commit points at
pub fn tree_of_commit(repo: &Repository, id: CommitId) -> Result<TreeId> {
    let commit = repo
        .find_commit(id.raw())
        .map_err(|_| Error::storage(format!("commit not found: {id}")))?;
    Ok(TreeId::new(commit.tree_id()))
}

/// the commit id the head ref points at, if the ref exists
pub fn head_commit_id(repo: &Repository) -> Result<Option<CommitId>> {
    match repo.find_reference(HEAD_REF) {
        Ok(reference) => reference
            .target()
            .map(|oid| Some(CommitId::new(oid)))
            .ok_or_else(|| Error::storage(format!("{HEAD_REF} is not a direct reference"))),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Advance the head ref, allowing only new or fast-forward transitions.
///
/// Anything else indicates a broken invariant and is a storage error.
pub fn update_ref_fast_forward(repo: &Repository, new: CommitId) -> Result<()> {
    match repo.find_reference(HEAD_REF) {
        Ok(reference) => {
            let old = reference
                .target()
                .ok_or_else(|| Error::storage(format!("{HEAD_REF} is not a direct reference")))?;
            if old == new.raw() || !repo.graph_descendant_of(new.raw(), old)? {
                return Err(Error::storage(format!(
                    "unexpected ref update state: {HEAD_REF} {} -> {} is not a fast-forward",
                    CommitId::new(old).short_hex(),
                    new.short_hex()
                )));
            }
            repo.reference_matching(HEAD_REF, new.raw(), true, old, "commit")?;
        }
        Err(e) if e.code() == ErrorCode::NotFound => {
            repo.reference(HEAD_REF, new.raw(), false, "initial commit")?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Collect every blob in a tree as `path -> blob id` (paths carry no
/// leading slash).
pub fn read_tree(repo: &Repository, tree_id: TreeId) -> Result<BTreeMap<String, BlobId>> {
    let tree = repo.find_tree(tree_id.raw())?;
    let mut entries = BTreeMap::new();
    let mut bad_entry = None;
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            match entry.name() {
                Some(name) => {
                    entries.insert(format!("{root}{name}"), BlobId::new(entry.id()));
                }
                None => {
                    bad_entry = Some(format!("{root}<non-utf8>"));
                    return TreeWalkResult::Abort;
                }
            }
        }
        TreeWalkResult::Ok
    })?;
    if let Some(path) = bad_entry {
        return Err(Error::storage(format!("non-utf8 tree entry at {path}")));
    }
    Ok(entries)
}

/// Materialize a `path -> blob id` map as nested tree objects and return
/// the root tree's id.
pub fn write_tree(repo: &Repository, entries: &BTreeMap<String, BlobId>) -> Result<TreeId> {
    let items: Vec<(&str, BlobId)> = entries.iter().map(|(p, id)| (p.as_str(), *id)).collect();
    let oid = write_tree_level(repo, &items)?;
    Ok(TreeId::new(oid))
}

fn write_tree_level(repo: &Repository, items: &[(&str, BlobId)]) -> Result<git2::Oid> {
    let mut builder = repo.treebuilder(None)?;
    let mut i = 0;
    while i < items.len() {
        let (path, blob) = items[i];
        match path.split_once('/') {
            None => {
                builder.insert(path, blob.raw(), FILE_MODE_BLOB)?;
                i += 1;
            }
            Some((dir, _)) => {
                // lexicographic order keeps all entries of one directory
                // adjacent, so collect the whole run
                let prefix_len = dir.len() + 1;
                let mut children: Vec<(&str, BlobId)> = Vec::new();
                while i < items.len()
                    && items[i].0.len() > prefix_len
                    && items[i].0.as_bytes()[prefix_len - 1] == b'/'
                    && &items[i].0[..prefix_len - 1] == dir
                {
                    children.push((&items[i].0[prefix_len..], items[i].1));
                    i += 1;
                }
                let subtree = write_tree_level(repo, &children)?;
                builder.insert(dir, subtree, FILE_MODE_TREE)?;
            }
        }
    }
    Ok(builder.write()?)
}

/// the kind of change a [`TreeDelta`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Deleted,
    Modified,
    Renamed,
}

/// one changed path between two trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDelta {
    pub kind: DeltaKind,
    /// path in the old tree, no leading slash (equals `new_path` for adds)
    pub old_path: String,
    /// path in the new tree, no leading slash (equals `old_path` for deletes)
    pub new_path: String,
    pub old_blob: BlobId,
    pub new_blob: BlobId,
}

impl TreeDelta {
    /// the path watchers are notified about: the new path for additions,
    /// the old path otherwise
    pub fn notify_path(&self) -> &str {
        match self.kind {
            DeltaKind::Added => &self.new_path,
            _ => &self.old_path,
        }
    }
}

/// Compare two trees; `None` stands for the empty tree.
pub fn diff_trees(
    repo: &Repository,
    old: Option<TreeId>,
    new: Option<TreeId>,
) -> Result<Vec<TreeDelta>> {
    let old_tree = old.map(|id| repo.find_tree(id.raw())).transpose()?;
    let new_tree = new.map(|id| repo.find_tree(id.raw())).transpose()?;

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(old_tree.as_ref(), new_tree.as_ref(), Some(&mut opts))?;

    let mut deltas = Vec::new();
    for delta in diff.deltas() {
        let kind = match delta.status() {
            Delta::Added => DeltaKind::Added,
            Delta::Deleted => DeltaKind::Deleted,
            Delta::Modified => DeltaKind::Modified,
            Delta::Renamed => DeltaKind::Renamed,
            other => {
                return Err(Error::storage(format!(
                    "unexpected diff delta status: {other:?}"
                )))
            }
        };
        let old_path = delta_path(delta.old_file().path(), delta.new_file().path())?;
        let new_path = delta_path(delta.new_file().path(), delta.old_file().path())?;
        deltas.push(TreeDelta {
            kind,
            old_path,
            new_path,
            old_blob: BlobId::new(delta.old_file().id()),
            new_blob: BlobId::new(delta.new_file().id()),
        });
    }
    Ok(deltas)
}

fn delta_path(primary: Option<&Path>, fallback: Option<&Path>) -> Result<String> {
    let path = primary
        .or(fallback)
        .ok_or_else(|| Error::storage("diff delta without a path"))?;
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::storage(format!("non-utf8 path in diff: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitStore) {
        let dir = TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        let store = GitStore::create(&repo_dir).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_and_open() {
        let (_dir, store) = setup();
        assert_eq!(store.format(), FormatVersion::V1);

        let reopened = GitStore::open(store.path()).unwrap();
        assert_eq!(reopened.format(), FormatVersion::V1);
    }

    #[test]
    fn test_create_twice_fails() {
        let (_dir, store) = setup();
        let result = GitStore::create(store.path());
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[test]
    fn test_open_missing() {
        let dir = TempDir::new().unwrap();
        let result = GitStore::open(&dir.path().join("nope"));
        assert!(matches!(result, Err(Error::RepositoryNotFound(_))));
    }

    #[test]
    fn test_blob_roundtrip() {
        let (_dir, store) = setup();
        let git = store.open_git().unwrap();
        let id = write_blob(&git, b"hello").unwrap();
        assert_eq!(read_blob(&git, id).unwrap(), b"hello");
    }

    #[test]
    fn test_tree_roundtrip() {
        let (_dir, store) = setup();
        let git = store.open_git().unwrap();

        let mut entries = BTreeMap::new();
        entries.insert("a.json".to_string(), write_blob(&git, b"1").unwrap());
        entries.insert("dir/b.txt".to_string(), write_blob(&git, b"2").unwrap());
        entries.insert("dir/sub/c.txt".to_string(), write_blob(&git, b"3").unwrap());

        let tree_id = write_tree(&git, &entries).unwrap();
        let read_back = read_tree(&git, tree_id).unwrap();
        assert_eq!(read_back, entries);
    }

    #[test]
    fn test_write_tree_is_deterministic() {
        let (_dir, store) = setup();
        let git = store.open_git().unwrap();

        let mut entries = BTreeMap::new();
        entries.insert("x/y.txt".to_string(), write_blob(&git, b"y").unwrap());
        entries.insert("x/z.txt".to_string(), write_blob(&git, b"z").unwrap());

        let first = write_tree(&git, &entries).unwrap();
        let second = write_tree(&git, &entries).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_diff_trees() {
        let (_dir, store) = setup();
        let git = store.open_git().unwrap();

        let mut before = BTreeMap::new();
        before.insert("keep.txt".to_string(), write_blob(&git, b"same").unwrap());
        before.insert("gone.txt".to_string(), write_blob(&git, b"old").unwrap());
        before.insert("mod.txt".to_string(), write_blob(&git, b"v1").unwrap());

        let mut after = BTreeMap::new();
        after.insert("keep.txt".to_string(), write_blob(&git, b"same").unwrap());
        after.insert("mod.txt".to_string(), write_blob(&git, b"v2").unwrap());
        after.insert("new.txt".to_string(), write_blob(&git, b"add").unwrap());

        let tree_a = write_tree(&git, &before).unwrap();
        let tree_b = write_tree(&git, &after).unwrap();

        let deltas = diff_trees(&git, Some(tree_a), Some(tree_b)).unwrap();
        assert_eq!(deltas.len(), 3);
        assert!(deltas
            .iter()
            .any(|d| d.kind == DeltaKind::Deleted && d.old_path == "gone.txt"));
        assert!(deltas
            .iter()
            .any(|d| d.kind == DeltaKind::Modified && d.old_path == "mod.txt"));
        assert!(deltas
            .iter()
            .any(|d| d.kind == DeltaKind::Added && d.new_path == "new.txt"));
    }

    #[test]
    fn test_diff_against_empty() {
        let (_dir, store) = setup();
        let git = store.open_git().unwrap();

        let mut entries = BTreeMap::new();
        entries.insert("a.txt".to_string(), write_blob(&git, b"a").unwrap());
        let tree = write_tree(&git, &entries).unwrap();

        let deltas = diff_trees(&git, None, Some(tree)).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].kind, DeltaKind::Added);
        assert_eq!(deltas[0].notify_path(), "a.txt");
    }

    #[test]
    fn test_ref_fast_forward_only() {
        let (_dir, store) = setup();
        let git = store.open_git().unwrap();

        let sig = git2::Signature::now("t", "t@localhost").unwrap();
        let empty = write_tree(&git, &BTreeMap::new()).unwrap();
        let tree = git.find_tree(empty.raw()).unwrap();

        let c1 = CommitId::new(git.commit(None, &sig, &sig, "one", &tree, &[]).unwrap());
        update_ref_fast_forward(&git, c1).unwrap();
        assert_eq!(head_commit_id(&git).unwrap(), Some(c1));

        let parent = git.find_commit(c1.raw()).unwrap();
        let c2 = CommitId::new(git.commit(None, &sig, &sig, "two", &tree, &[&parent]).unwrap());
        update_ref_fast_forward(&git, c2).unwrap();
        assert_eq!(head_commit_id(&git).unwrap(), Some(c2));

        // moving back to an ancestor is not a fast-forward
        let result = update_ref_fast_forward(&git, c1);
        assert!(matches!(result, Err(Error::Storage(_))));
    }
}
