//! Commit objects and the JSON commit-message envelope.
//!
//! A commit's message is a UTF-8 JSON document carrying the summary, the
//! detail, the markup and the revision number. The revision in the
//! message is what allows the commit-id index to be rebuilt from the
//! commit log alone. Unknown fields written by other engine versions are
//! preserved on re-emission.

use chrono::{DateTime, TimeZone, Utc};
use git2::Repository;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Author, Commit, Markup};
use crate::revision::Revision;
use crate::storage::types::{CommitId, TreeId};

/// The JSON document stored as a commit message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMessage {
    pub summary: String,
    pub detail: String,
    pub markup: Markup,
    pub revision: Revision,
    /// fields written by other engine versions, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CommitMessage {
    pub fn new(summary: impl Into<String>, detail: impl Into<String>, markup: Markup, revision: Revision) -> Self {
        Self {
            summary: summary.into(),
            detail: detail.into(),
            markup,
            revision,
            extra: serde_json::Map::new(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(message: &str) -> Result<Self> {
        serde_json::from_str(message)
            .map_err(|e| Error::storage(format!("malformed commit message: {e}")))
    }
}

/// Pull the revision number out of a raw commit message.
pub fn extract_revision(message: &str) -> Result<Revision> {
    Ok(CommitMessage::decode(message)?.revision)
}

/// Everything the engine needs to know about one stored commit.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: CommitId,
    pub tree_id: TreeId,
    pub parent_id: Option<CommitId>,
    pub author: Author,
    pub when: DateTime<Utc>,
    pub message: CommitMessage,
}

impl CommitInfo {
    pub fn revision(&self) -> Revision {
        self.message.revision
    }

    /// the public commit model
    pub fn to_commit(&self) -> Commit {
        Commit {
            revision: self.message.revision,
            author: self.author.clone(),
            when: self.when,
            summary: self.message.summary.clone(),
            detail: self.message.detail.clone(),
            markup: self.message.markup,
        }
    }
}

/// Read a commit and decode its message envelope.
pub fn read_commit(repo: &Repository, id: CommitId) -> Result<CommitInfo> {
    let commit = repo
        .find_commit(id.raw())
        .map_err(|_| Error::storage(format!("commit not found: {id}")))?;

    let committer = commit.committer();
    let author = match (committer.name(), committer.email()) {
        (Some(name), Some(email)) => Author::new(name, email),
        _ => Author::unknown(),
    };
    let when = Utc
        .timestamp_opt(commit.time().seconds(), 0)
        .single()
        .ok_or_else(|| Error::storage(format!("commit {id} has an invalid timestamp")))?;

    let message = CommitMessage::decode(commit.message().unwrap_or_default())?;
    let parent_id = if commit.parent_count() > 0 {
        Some(CommitId::new(commit.parent_id(0)?))
    } else {
        None
    };

    Ok(CommitInfo {
        id,
        tree_id: TreeId::new(commit.tree_id()),
        parent_id,
        author,
        when,
        message,
    })
}

/// Write a commit object without touching any ref.
///
/// The timestamp is truncated to whole seconds to match the on-disk
/// commit encoding; the author doubles as the committer.
pub fn create_commit(
    repo: &Repository,
    tree_id: TreeId,
    parent: Option<CommitId>,
    author: &Author,
    when: DateTime<Utc>,
    message: &CommitMessage,
) -> Result<CommitId> {
    let tree = repo.find_tree(tree_id.raw())?;
    let signature = git2::Signature::new(
        &author.name,
        &author.email,
        &git2::Time::new(when.timestamp(), 0),
    )?;

    let parent_commit = parent.map(|id| repo.find_commit(id.raw())).transpose()?;
    let parents: Vec<&git2::Commit<'_>> = parent_commit.iter().collect();

    let oid = repo.commit(None, &signature, &signature, &message.encode()?, &tree, &parents)?;
    Ok(CommitId::new(oid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::{self, GitStore};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitStore) {
        let dir = TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        let store = GitStore::create(&repo_dir).unwrap();
        (dir, store)
    }

    #[test]
    fn test_message_roundtrip() {
        let message = CommitMessage::new("Add config", "details here", Markup::Markdown, Revision::new(7));
        let encoded = message.encode().unwrap();
        let decoded = CommitMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.summary, "Add config");
        assert_eq!(decoded.detail, "details here");
        assert_eq!(decoded.markup, Markup::Markdown);
        assert_eq!(decoded.revision, Revision::new(7));
    }

    #[test]
    fn test_message_preserves_unknown_fields() {
        let raw = r#"{"summary":"s","detail":"","markup":"PLAINTEXT","revision":3,"futureField":true}"#;
        let decoded = CommitMessage::decode(raw).unwrap();
        assert_eq!(decoded.revision, Revision::new(3));
        assert_eq!(decoded.extra.get("futureField"), Some(&serde_json::Value::Bool(true)));

        let reencoded = decoded.encode().unwrap();
        assert!(reencoded.contains("futureField"));
    }

    #[test]
    fn test_extract_revision_rejects_garbage() {
        assert!(extract_revision("not json at all").is_err());
        assert!(extract_revision(r#"{"summary":"x"}"#).is_err());
    }

    #[test]
    fn test_create_and_read_commit() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();

        let tree = store::write_tree(&git, &BTreeMap::new()).unwrap();
        let author = Author::new("alice", "alice@example.com");
        let when = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let message = CommitMessage::new("first", "", Markup::Plaintext, Revision::INIT);

        let id = create_commit(&git, tree, None, &author, when, &message).unwrap();
        let info = read_commit(&git, id).unwrap();

        assert_eq!(info.revision(), Revision::INIT);
        assert_eq!(info.author, author);
        assert_eq!(info.when, when);
        assert_eq!(info.parent_id, None);
        assert_eq!(info.tree_id, tree);

        let commit = info.to_commit();
        assert_eq!(commit.summary, "first");
        assert_eq!(commit.markup, Markup::Plaintext);
    }

    #[test]
    fn test_commit_chain() {
        let (_dir, git_store) = setup();
        let git = git_store.open_git().unwrap();

        let tree = store::write_tree(&git, &BTreeMap::new()).unwrap();
        let author = Author::system();
        let when = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();

        let first = create_commit(
            &git,
            tree,
            None,
            &author,
            when,
            &CommitMessage::new("one", "", Markup::Plaintext, Revision::new(1)),
        )
        .unwrap();
        let second = create_commit(
            &git,
            tree,
            Some(first),
            &author,
            when,
            &CommitMessage::new("two", "", Markup::Plaintext, Revision::new(2)),
        )
        .unwrap();

        let info = read_commit(&git, second).unwrap();
        assert_eq!(info.parent_id, Some(first));
        assert_eq!(info.revision(), Revision::new(2));
    }
}
