//! The public data model: authors, entries, changes and commits.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::revision::Revision;

/// The identity behind a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self { name: name.into(), email: email.into() }
    }

    /// sentinel for commits lacking committer identity
    pub fn unknown() -> Self {
        Self::new("Unknown", "nobody@no.where")
    }

    /// default identity for engine-initiated commits
    pub fn system() -> Self {
        Self::new("System", "system@localhost")
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// How the commit detail should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Markup {
    Plaintext,
    Markdown,
}

impl fmt::Display for Markup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Markup::Plaintext => write!(f, "PLAINTEXT"),
            Markup::Markdown => write!(f, "MARKDOWN"),
        }
    }
}

/// The type of an entry, derived from its path suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Json,
    Text,
    Directory,
}

impl EntryType {
    /// `.json` paths hold JSON documents; everything else is plain text
    pub fn guess_from_path(path: &str) -> EntryType {
        if path.ends_with(".json") {
            EntryType::Json
        } else {
            EntryType::Text
        }
    }
}

/// The content carried by an [`Entry`]. Directory entries carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryContent {
    Json(Value),
    Text(String),
    Directory,
}

/// A file or directory at a specific revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub revision: Revision,
    pub path: String,
    pub content: EntryContent,
}

impl Entry {
    pub fn of_json(revision: Revision, path: impl Into<String>, content: Value) -> Self {
        Self { revision, path: path.into(), content: EntryContent::Json(content) }
    }

    pub fn of_text(revision: Revision, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self { revision, path: path.into(), content: EntryContent::Text(content.into()) }
    }

    pub fn of_directory(revision: Revision, path: impl Into<String>) -> Self {
        Self { revision, path: path.into(), content: EntryContent::Directory }
    }

    pub fn entry_type(&self) -> EntryType {
        match self.content {
            EntryContent::Json(_) => EntryType::Json,
            EntryContent::Text(_) => EntryType::Text,
            EntryContent::Directory => EntryType::Directory,
        }
    }

    /// the JSON content, if this is a JSON entry
    pub fn content_as_json(&self) -> Option<&Value> {
        match &self.content {
            EntryContent::Json(value) => Some(value),
            _ => None,
        }
    }

    /// the text content, if this is a text entry
    pub fn content_as_text(&self) -> Option<&str> {
        match &self.content {
            EntryContent::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A request to mutate one path. Paths are absolute (leading `/`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Change {
    UpsertJson { path: String, content: Value },
    UpsertText { path: String, content: String },
    Remove { path: String },
    Rename { from: String, to: String },
    ApplyJsonPatch { path: String, patch: Value },
    ApplyTextPatch { path: String, patch: String },
}

impl Change {
    /// the path this change applies to (the source path for renames)
    pub fn path(&self) -> &str {
        match self {
            Change::UpsertJson { path, .. }
            | Change::UpsertText { path, .. }
            | Change::Remove { path }
            | Change::ApplyJsonPatch { path, .. }
            | Change::ApplyTextPatch { path, .. } => path,
            Change::Rename { from, .. } => from,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::UpsertJson { path, .. } => write!(f, "UPSERT_JSON {path}"),
            Change::UpsertText { path, .. } => write!(f, "UPSERT_TEXT {path}"),
            Change::Remove { path } => write!(f, "REMOVE {path}"),
            Change::Rename { from, to } => write!(f, "RENAME {from} -> {to}"),
            Change::ApplyJsonPatch { path, .. } => write!(f, "APPLY_JSON_PATCH {path}"),
            Change::ApplyTextPatch { path, .. } => write!(f, "APPLY_TEXT_PATCH {path}"),
        }
    }
}

/// A commit in repository history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub revision: Revision,
    pub author: Author,
    pub when: DateTime<Utc>,
    pub summary: String,
    pub detail: String,
    pub markup: Markup,
}

/// A sub-query applied to a JSON entry's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    /// the whole document
    Identity,
    /// a JSON-pointer read, e.g. `/a/b`
    JsonPointer(String),
}

impl Query {
    /// Evaluate this query against a JSON document.
    ///
    /// Returns `None` when the pointer does not resolve.
    pub fn apply_to(&self, value: &Value) -> Option<Value> {
        match self {
            Query::Identity => Some(value.clone()),
            Query::JsonPointer(pointer) => value.pointer(pointer).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_type_guess() {
        assert_eq!(EntryType::guess_from_path("/a/b.json"), EntryType::Json);
        assert_eq!(EntryType::guess_from_path("/a/b.txt"), EntryType::Text);
        assert_eq!(EntryType::guess_from_path("/a/b"), EntryType::Text);
    }

    #[test]
    fn test_change_path() {
        let change = Change::Rename { from: "/a".to_string(), to: "/b".to_string() };
        assert_eq!(change.path(), "/a");

        let change = Change::Remove { path: "/c.json".to_string() };
        assert_eq!(change.path(), "/c.json");
    }

    #[test]
    fn test_change_serde_roundtrip() {
        let change = Change::UpsertJson {
            path: "/config.json".to_string(),
            content: json!({"a": 1}),
        };
        let encoded = serde_json::to_string(&change).unwrap();
        assert!(encoded.contains("UPSERT_JSON"));
        let decoded: Change = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, change);
    }

    #[test]
    fn test_markup_serde() {
        assert_eq!(serde_json::to_string(&Markup::Plaintext).unwrap(), "\"PLAINTEXT\"");
        assert_eq!(serde_json::to_string(&Markup::Markdown).unwrap(), "\"MARKDOWN\"");
    }

    #[test]
    fn test_query_apply() {
        let doc = json!({"a": {"b": [1, 2, 3]}});
        assert_eq!(Query::Identity.apply_to(&doc), Some(doc.clone()));
        assert_eq!(
            Query::JsonPointer("/a/b/1".to_string()).apply_to(&doc),
            Some(json!(2))
        );
        assert_eq!(Query::JsonPointer("/missing".to_string()).apply_to(&doc), None);
    }
}
