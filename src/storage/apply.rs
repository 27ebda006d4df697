//! Applies logical changes to an in-memory working tree.
//!
//! A [`WorkingTree`] is the staging area for a commit: a flat
//! `path -> blob` map seeded from the base revision's tree. Changes are
//! applied in order; only *effective* edits (those that alter a blob or
//! the tree shape) are counted, so redundant upserts cost nothing.

use std::collections::BTreeMap;

use git2::Repository;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::jsonpatch;
use crate::model::Change;
use crate::storage::store;
use crate::storage::types::{BlobId, TreeId};
use crate::text;

pub struct WorkingTree {
    entries: BTreeMap<String, BlobId>,
}

fn strip_path<'a>(path: &'a str, change: &Change) -> Result<&'a str> {
    path.strip_prefix('/')
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| Error::conflict(format!("path must be absolute: {change}")))
}

impl WorkingTree {
    /// Seed a working tree from a base tree (`None` for the empty tree).
    pub fn seed(repo: &Repository, base: Option<TreeId>) -> Result<Self> {
        let entries = match base {
            Some(tree_id) => store::read_tree(repo, tree_id)?,
            None => BTreeMap::new(),
        };
        Ok(Self { entries })
    }

    /// Write the working tree back as nested tree objects.
    pub fn write_tree(&self, repo: &Repository) -> Result<TreeId> {
        store::write_tree(repo, &self.entries)
    }

    /// Apply changes in order, returning the number of effective edits.
    pub fn apply(&mut self, repo: &Repository, changes: &[Change]) -> Result<usize> {
        let mut edits = 0;
        for change in changes {
            match change {
                Change::UpsertJson { path, content } => {
                    let rel = strip_path(path, change)?;
                    let old = match self.entries.get(rel) {
                        Some(id) => Some(store::read_json_blob(repo, *id)?),
                        None => None,
                    };
                    if old.as_ref() != Some(content) {
                        let blob = store::write_blob(repo, &serde_json::to_vec(content)?)?;
                        self.entries.insert(rel.to_string(), blob);
                        edits += 1;
                    }
                }
                Change::UpsertText { path, content } => {
                    let rel = strip_path(path, change)?;
                    let old = match self.entries.get(rel) {
                        Some(id) => Some(store::read_text_blob(repo, *id)?),
                        None => None,
                    };
                    let new = text::sanitize(content);
                    if old.as_deref() != Some(new.as_str()) {
                        let blob = store::write_blob(repo, new.as_bytes())?;
                        self.entries.insert(rel.to_string(), blob);
                        edits += 1;
                    }
                }
                Change::Remove { path } => {
                    let rel = strip_path(path, change)?;
                    if self.entries.remove(rel).is_some() {
                        edits += 1;
                        continue;
                    }
                    // the path might be a directory
                    let prefix = format!("{rel}/");
                    let victims: Vec<String> = self
                        .entries
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    if victims.is_empty() {
                        return Err(Error::conflict(format!(
                            "non-existent file/directory: {change}"
                        )));
                    }
                    for key in victims {
                        self.entries.remove(&key);
                    }
                    edits += 1;
                }
                Change::Rename { from, to } => {
                    let src = strip_path(from, change)?;
                    let dst = strip_path(to, change)?;

                    if self.entries.contains_key(dst) {
                        return Err(Error::conflict(format!(
                            "a file exists at the target path: {change}"
                        )));
                    }

                    if let Some(id) = self.entries.remove(src) {
                        self.entries.insert(dst.to_string(), id);
                        edits += 1;
                        continue;
                    }

                    // the path might be a directory
                    let old_prefix = format!("{src}/");
                    let new_prefix = format!("{dst}/");
                    if self.entries.keys().any(|k| k.starts_with(&new_prefix)) {
                        return Err(Error::conflict(format!(
                            "target directory exists already: {change}"
                        )));
                    }
                    let moved: Vec<(String, BlobId)> = self
                        .entries
                        .range(old_prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&old_prefix))
                        .map(|(k, id)| (k.clone(), *id))
                        .collect();
                    if moved.is_empty() {
                        return Err(Error::conflict(format!(
                            "non-existent file/directory: {change}"
                        )));
                    }
                    for (key, _) in &moved {
                        self.entries.remove(key);
                    }
                    for (key, id) in moved {
                        let relocated = format!("{new_prefix}{}", &key[old_prefix.len()..]);
                        self.entries.insert(relocated, id);
                    }
                    edits += 1;
                }
                Change::ApplyJsonPatch { path, patch } => {
                    let rel = strip_path(path, change)?;
                    let old = match self.entries.get(rel) {
                        Some(id) => store::read_json_blob(repo, *id)?,
                        None => Value::Null,
                    };
                    let new = jsonpatch::apply(&old, patch).map_err(|e| {
                        Error::conflict(format!("failed to apply JSON patch: {change}: {e}"))
                    })?;
                    if new != old {
                        let blob = store::write_blob(repo, &serde_json::to_vec(&new)?)?;
                        self.entries.insert(rel.to_string(), blob);
                        edits += 1;
                    }
                }
                Change::ApplyTextPatch { path, patch } => {
                    let rel = strip_path(path, change)?;
                    let old = match self.entries.get(rel) {
                        Some(id) => Some(store::read_text_blob(repo, *id)?),
                        None => None,
                    };
                    let new = text::apply_patch(old.as_deref().unwrap_or(""), &text::sanitize(patch))
                        .map_err(|e| {
                            Error::conflict(format!("failed to apply text patch: {change}: {e}"))
                        })?;
                    if old.as_deref() != Some(new.as_str()) {
                        let blob = store::write_blob(repo, new.as_bytes())?;
                        self.entries.insert(rel.to_string(), blob);
                        edits += 1;
                    }
                }
            }
        }
        Ok(edits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::GitStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitStore) {
        let dir = TempDir::new().unwrap();
        let store = GitStore::create(&dir.path().join("repo")).unwrap();
        (dir, store)
    }

    fn upsert_json(path: &str, content: Value) -> Change {
        Change::UpsertJson { path: path.to_string(), content }
    }

    fn upsert_text(path: &str, content: &str) -> Change {
        Change::UpsertText { path: path.to_string(), content: content.to_string() }
    }

    #[test]
    fn test_upsert_and_redundant_upsert() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();

        let edits = tree
            .apply(&git, &[upsert_json("/a.json", json!({"x": 1}))])
            .unwrap();
        assert_eq!(edits, 1);

        // same parsed content, different formatting: no effective edit
        let edits = tree
            .apply(&git, &[upsert_json("/a.json", json!({"x": 1}))])
            .unwrap();
        assert_eq!(edits, 0);

        let edits = tree
            .apply(&git, &[upsert_json("/a.json", json!({"x": 2}))])
            .unwrap();
        assert_eq!(edits, 1);
    }

    #[test]
    fn test_upsert_text_sanitizes() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();

        tree.apply(&git, &[upsert_text("/a.txt", "one\r\ntwo")]).unwrap();
        let blob = tree.entries.get("a.txt").copied().unwrap();
        assert_eq!(store::read_blob(&git, blob).unwrap(), b"one\ntwo\n");

        // equal after sanitization: no edit
        let edits = tree.apply(&git, &[upsert_text("/a.txt", "one\ntwo\n")]).unwrap();
        assert_eq!(edits, 0);
    }

    #[test]
    fn test_remove_file_and_directory() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(
            &git,
            &[
                upsert_text("/a.txt", "a"),
                upsert_text("/dir/b.txt", "b"),
                upsert_text("/dir/sub/c.txt", "c"),
            ],
        )
        .unwrap();

        let edits = tree
            .apply(&git, &[Change::Remove { path: "/a.txt".to_string() }])
            .unwrap();
        assert_eq!(edits, 1);

        let edits = tree
            .apply(&git, &[Change::Remove { path: "/dir".to_string() }])
            .unwrap();
        assert_eq!(edits, 1);
        assert!(tree.entries.is_empty());
    }

    #[test]
    fn test_remove_missing_conflicts() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();

        let err = tree
            .apply(&git, &[Change::Remove { path: "/missing".to_string() }])
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_rename_file() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(&git, &[upsert_text("/a.txt", "a")]).unwrap();

        let edits = tree
            .apply(
                &git,
                &[Change::Rename { from: "/a.txt".to_string(), to: "/b.txt".to_string() }],
            )
            .unwrap();
        assert_eq!(edits, 1);
        assert!(tree.entries.contains_key("b.txt"));
        assert!(!tree.entries.contains_key("a.txt"));
    }

    #[test]
    fn test_rename_directory_preserves_relative_paths() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(
            &git,
            &[upsert_text("/old/a.txt", "a"), upsert_text("/old/sub/b.txt", "b")],
        )
        .unwrap();

        tree.apply(
            &git,
            &[Change::Rename { from: "/old".to_string(), to: "/new".to_string() }],
        )
        .unwrap();
        assert!(tree.entries.contains_key("new/a.txt"));
        assert!(tree.entries.contains_key("new/sub/b.txt"));
        assert!(!tree.entries.keys().any(|k| k.starts_with("old")));
    }

    #[test]
    fn test_rename_conflicts() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(
            &git,
            &[
                upsert_text("/a.txt", "a"),
                upsert_text("/b.txt", "b"),
                upsert_text("/dir/c.txt", "c"),
                upsert_text("/occupied/d.txt", "d"),
            ],
        )
        .unwrap();

        // target file exists
        let err = tree
            .apply(
                &git,
                &[Change::Rename { from: "/a.txt".to_string(), to: "/b.txt".to_string() }],
            )
            .unwrap_err();
        assert!(err.is_conflict());

        // target directory occupied
        let err = tree
            .apply(
                &git,
                &[Change::Rename { from: "/dir".to_string(), to: "/occupied".to_string() }],
            )
            .unwrap_err();
        assert!(err.is_conflict());

        // a file whose name equals the target directory
        let err = tree
            .apply(
                &git,
                &[Change::Rename { from: "/dir".to_string(), to: "/a.txt".to_string() }],
            )
            .unwrap_err();
        assert!(err.is_conflict());

        // missing source
        let err = tree
            .apply(
                &git,
                &[Change::Rename { from: "/ghost".to_string(), to: "/fresh".to_string() }],
            )
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_apply_json_patch() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(&git, &[upsert_json("/c.json", json!({"a": 1}))]).unwrap();

        let patch = json!([{"op": "replace", "path": "/a", "value": 2}]);
        let edits = tree
            .apply(
                &git,
                &[Change::ApplyJsonPatch { path: "/c.json".to_string(), patch }],
            )
            .unwrap();
        assert_eq!(edits, 1);

        let blob = tree.entries.get("c.json").copied().unwrap();
        let value: Value = serde_json::from_slice(&store::read_blob(&git, blob).unwrap()).unwrap();
        assert_eq!(value, json!({"a": 2}));
    }

    #[test]
    fn test_apply_json_patch_to_absent_file_uses_null() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();

        let patch = json!([{"op": "replace", "path": "", "value": {"fresh": true}}]);
        let edits = tree
            .apply(
                &git,
                &[Change::ApplyJsonPatch { path: "/new.json".to_string(), patch }],
            )
            .unwrap();
        assert_eq!(edits, 1);
    }

    #[test]
    fn test_apply_json_patch_conflict() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(&git, &[upsert_json("/c.json", json!({"a": 1}))]).unwrap();

        let patch = json!([{"op": "test", "path": "/a", "value": 99}]);
        let err = tree
            .apply(
                &git,
                &[Change::ApplyJsonPatch { path: "/c.json".to_string(), patch }],
            )
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_apply_text_patch() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(&git, &[upsert_text("/a.txt", "hello")]).unwrap();

        let patch = text::unified_diff("hello\n", "world\n", "/a.txt", "/a.txt");
        let edits = tree
            .apply(
                &git,
                &[Change::ApplyTextPatch { path: "/a.txt".to_string(), patch }],
            )
            .unwrap();
        assert_eq!(edits, 1);

        let blob = tree.entries.get("a.txt").copied().unwrap();
        assert_eq!(store::read_blob(&git, blob).unwrap(), b"world\n");
    }

    #[test]
    fn test_apply_text_patch_conflict() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();
        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(&git, &[upsert_text("/a.txt", "something else")]).unwrap();

        let patch = text::unified_diff("hello\n", "world\n", "/a.txt", "/a.txt");
        let err = tree
            .apply(
                &git,
                &[Change::ApplyTextPatch { path: "/a.txt".to_string(), patch }],
            )
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_seed_from_existing_tree() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();

        let mut tree = WorkingTree::seed(&git, None).unwrap();
        tree.apply(&git, &[upsert_text("/x/y.txt", "y")]).unwrap();
        let tree_id = tree.write_tree(&git).unwrap();

        let reseeded = WorkingTree::seed(&git, Some(tree_id)).unwrap();
        assert_eq!(reseeded.entries, tree.entries);
    }
}
