//! The repository engine: the commit pipeline, the query engine and
//! long-poll watch.
//!
//! A [`Repository`] is a linearly versioned store over a bare git object
//! database. One read-write lock per repository covers all shared state:
//! queries run under the read lock, the commit pipeline is the single
//! exclusive writer. Every public operation returns a future; blocking
//! git work runs on the tokio blocking pool.
//!
//! Watcher notification for a commit happens strictly after the write
//! lock is released. A completion callback may re-enter the repository,
//! so notifying under the lock would deadlock.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use git2::ObjectType;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::error::{Error, Result};
use crate::jsonpatch::{self, ReplaceMode};
use crate::model::{Author, Change, Commit, Entry, EntryContent, EntryType, Markup, Query};
use crate::pattern::PathPattern;
use crate::repo::cache::DiffCache;
use crate::repo::watchers::CommitWatchers;
use crate::revision::{Revision, RevisionRange};
use crate::storage::commit::{self as commit_store, CommitMessage};
use crate::storage::revindex::CommitIdIndex;
use crate::storage::store;
use crate::storage::{DeltaKind, FormatVersion, GitStore, TreeDelta, TreeId, WorkingTree};
use crate::text;

/// commits are replayed in batches of this size while cloning
const CLONE_BATCH: usize = 16;

/// Options for [`Repository::find`].
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// fetch entry contents, not just paths
    pub fetch_content: bool,
    /// cap on the number of returned entries
    pub max_entries: usize,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self { fetch_content: true, max_entries: usize::MAX }
    }
}

impl FindOptions {
    /// existence probe: a single entry, no content
    pub fn one_without_content() -> Self {
        Self { fetch_content: false, max_entries: 1 }
    }
}

/// Construction-time collaborators and tunables of a repository.
///
/// The engine reads no environment variables; everything enters here.
#[derive(Clone)]
pub struct RepositoryConfig {
    /// author of engine-initiated commits (repository creation)
    pub creation_author: Author,
    /// fail an operation with `Timeout` if it cannot start within this
    /// budget after dispatch
    pub request_timeout: Option<Duration>,
    /// how long `close` waits for in-flight operations to drain
    pub graceful_shutdown_timeout: Duration,
    /// optional shared tree-comparison cache
    pub cache: Option<DiffCache>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            creation_author: Author::system(),
            request_timeout: None,
            graceful_shutdown_timeout: Duration::from_secs(10),
            cache: None,
        }
    }
}

struct RepoInner {
    project: String,
    name: String,
    store: GitStore,
    /// the one lock: shared for queries, exclusive for the commit
    /// pipeline and close
    rw: RwLock<()>,
    index: RwLock<CommitIdIndex>,
    /// current head revision, published after each commit
    head: AtomicI64,
    watchers: CommitWatchers,
    close_pending: AtomicBool,
    close_done: watch::Sender<bool>,
    config: RepositoryConfig,
}

impl RepoInner {
    fn head_revision(&self) -> Revision {
        Revision::new(self.head.load(Ordering::Acquire))
    }

    fn check_open(&self) -> Result<()> {
        if self.close_pending.load(Ordering::Acquire) {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// run under the shared lock with a fresh git handle
    fn read_op<T>(&self, f: impl FnOnce(&git2::Repository) -> Result<T>) -> Result<T> {
        let _guard = self.rw.read();
        self.check_open()?;
        let git = self.store.open_git()?;
        f(&git)
    }

    fn tree_of(&self, git: &git2::Repository, revision: Revision) -> Result<TreeId> {
        let commit_id = self.index.read().get(revision)?;
        store::tree_of_commit(git, commit_id)
    }

    /// Compare two trees, going through the shared cache when one is
    /// configured. Cached entries carry paths only; content-bearing
    /// diffs are always computed directly.
    fn compare_trees(
        &self,
        git: &git2::Repository,
        old: TreeId,
        new: TreeId,
    ) -> Result<Arc<Vec<TreeDelta>>> {
        match &self.config.cache {
            Some(cache) => {
                cache.get_with(old, new, || store::diff_trees(git, Some(old), Some(new)))
            }
            None => store::diff_trees(git, Some(old), Some(new)).map(Arc::new),
        }
    }

    /// The commit pipeline core. The caller must hold the exclusive
    /// write lock. Returns the new revision and the changed paths for
    /// watcher notification.
    #[allow(clippy::too_many_arguments)]
    fn commit0(
        &self,
        git: &git2::Repository,
        prev: Option<Revision>,
        next: Revision,
        when: DateTime<Utc>,
        author: &Author,
        summary: &str,
        detail: &str,
        markup: Markup,
        changes: &[Change],
        allow_empty: bool,
    ) -> Result<(Revision, Vec<String>)> {
        let prev_tree = prev.map(|r| self.tree_of(git, r)).transpose()?;

        let mut working = WorkingTree::seed(git, prev_tree)?;
        let num_edits = working.apply(git, changes)?;
        let next_tree = working.write_tree(git)?;

        // Even with edits applied, the resulting tree can be identical to
        // the base tree.
        let deltas = if num_edits > 0 {
            store::diff_trees(git, prev_tree, Some(next_tree))?
        } else {
            Vec::new()
        };
        if !allow_empty && deltas.is_empty() {
            return Err(Error::redundant(format!(
                "changes did not change anything in {}/{} at revision {}",
                self.project,
                self.name,
                prev.map_or(0, |r| r.value())
            )));
        }

        let message = CommitMessage::new(summary, detail, markup, next);
        let parent = prev.map(|r| self.index.read().get(r)).transpose()?;
        let commit_id = commit_store::create_commit(git, next_tree, parent, author, when, &message)?;

        self.index.write().put(next, commit_id)?;
        store::update_ref_fast_forward(git, commit_id)?;

        tracing::debug!(
            project = %self.project,
            repository = %self.name,
            revision = next.value(),
            commit = %commit_id.short_hex(),
            "committed"
        );
        let changed = deltas.iter().map(|d| format!("/{}", d.notify_path())).collect();
        Ok((next, changed))
    }
}

/// A versioned configuration repository.
///
/// Clone this to share across tasks; it uses `Arc` internally.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

enum WatchState {
    Ready(Revision),
    Pending(u64, oneshot::Receiver<Result<Revision>>),
}

/// Deregisters a pending waiter when the watch future is dropped before
/// completion (caller-initiated cancellation).
struct WatchGuard {
    inner: Arc<RepoInner>,
    id: Option<u64>,
}

impl WatchGuard {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.inner.watchers.remove(id);
        }
    }
}

impl Repository {
    /// Create a new repository at `dir` and write the initial commit
    /// (revision 1, empty tree). A half-created directory is removed on
    /// failure.
    pub async fn create(
        project: &str,
        name: &str,
        dir: &Path,
        config: RepositoryConfig,
    ) -> Result<Self> {
        let author = config.creation_author.clone();
        Self::create_with(project, name, dir, config, author, Utc::now()).await
    }

    pub(crate) async fn create_with(
        project: &str,
        name: &str,
        dir: &Path,
        config: RepositoryConfig,
        author: Author,
        when: DateTime<Utc>,
    ) -> Result<Self> {
        let project = project.to_string();
        let name = name.to_string();
        let dir = dir.to_path_buf();
        spawn_blocking("create", move || {
            blocking_create(project, name, &dir, config, author, when)
        })
        .await
    }

    /// Open an existing repository. The commit-id index is validated
    /// against the head commit and rebuilt from the log when the two
    /// disagree.
    pub async fn open(
        project: &str,
        name: &str,
        dir: &Path,
        config: RepositoryConfig,
    ) -> Result<Self> {
        let project = project.to_string();
        let name = name.to_string();
        let dir = dir.to_path_buf();
        spawn_blocking("open", move || blocking_open(project, name, &dir, config)).await
    }

    pub fn project(&self) -> &str {
        &self.inner.project
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn format(&self) -> FormatVersion {
        self.inner.store.format()
    }

    /// the current head revision
    pub fn head_revision(&self) -> Revision {
        self.inner.head_revision()
    }

    /// Resolve a possibly-relative revision against the current head.
    pub fn normalize_now(&self, revision: Revision) -> Result<Revision> {
        revision.normalize(self.inner.head_revision())
    }

    /// Resolve both ends of a range against the current head.
    pub fn normalize_range(&self, from: Revision, to: Revision) -> Result<RevisionRange> {
        let head = self.inner.head_revision();
        Ok(RevisionRange::new(from.normalize(head)?, to.normalize(head)?))
    }

    /// dispatch a blocking closure to the worker pool, honoring the
    /// configured request deadline
    async fn run_blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RepoInner) -> Result<T> + Send + 'static,
    {
        self.inner.check_open()?;
        let deadline = self.inner.config.request_timeout.map(|t| Instant::now() + t);
        let inner = Arc::clone(&self.inner);
        spawn_blocking(operation, move || {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    tracing::warn!(operation, "operation timed out before reaching the worker");
                    return Err(Error::Timeout { operation });
                }
            }
            f(&inner)
        })
        .await
    }

    /// Find entries matching a path pattern at a revision.
    ///
    /// A speculative read past the head returns an empty result. Result
    /// order is tree-walk order.
    pub async fn find(
        &self,
        revision: Revision,
        path_pattern: &str,
        options: FindOptions,
    ) -> Result<BTreeMap<String, Entry>> {
        let pattern = path_pattern.to_string();
        self.run_blocking("find", move |inner| {
            blocking_find(inner, revision, &pattern, &options)
        })
        .await
    }

    /// Read a single entry, optionally refining JSON content with a
    /// query. Returns `None` when nothing exists at the path.
    pub async fn get(
        &self,
        revision: Revision,
        path: &str,
        query: Query,
    ) -> Result<Option<Entry>> {
        let entries = self.find(revision, path, FindOptions::default()).await?;
        let Some(entry) = entries.into_values().next() else {
            return Ok(None);
        };
        match (&entry.content, &query) {
            (EntryContent::Json(value), _) => {
                let refined = query.apply_to(value).ok_or_else(|| {
                    Error::conflict(format!("query matched nothing at {path}: {query:?}"))
                })?;
                Ok(Some(Entry::of_json(entry.revision, entry.path, refined)))
            }
            (_, Query::Identity) => Ok(Some(entry)),
            (_, Query::JsonPointer(_)) => Err(Error::conflict(format!(
                "cannot apply a JSON query to a non-JSON entry: {path}"
            ))),
        }
    }

    /// List the commits that touched a matching path, newest first for a
    /// descending range. The result is capped at `max_commits`.
    pub async fn history(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
        max_commits: usize,
    ) -> Result<Vec<Commit>> {
        let pattern = path_pattern.to_string();
        self.run_blocking("history", move |inner| {
            blocking_history(inner, from, to, &pattern, max_commits)
        })
        .await
    }

    /// The changes between two revisions, keyed by path.
    pub async fn diff(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
    ) -> Result<BTreeMap<String, Change>> {
        let pattern = path_pattern.to_string();
        self.run_blocking("diff", move |inner| blocking_diff(inner, from, to, &pattern))
            .await
    }

    /// Apply changes to a scratch tree derived from `base` and report
    /// what would change, without committing anything.
    pub async fn preview_diff(
        &self,
        base: Revision,
        changes: Vec<Change>,
    ) -> Result<BTreeMap<String, Change>> {
        self.run_blocking("previewDiff", move |inner| {
            let norm = base.normalize(inner.head_revision())?;
            inner.read_op(|git| {
                let base_tree = inner.tree_of(git, norm)?;
                let mut working = WorkingTree::seed(git, Some(base_tree))?;
                if working.apply(git, &changes)? == 0 {
                    return Ok(BTreeMap::new());
                }
                let scratch = working.write_tree(git)?;
                let deltas = store::diff_trees(git, Some(base_tree), Some(scratch))?;
                to_change_map(git, &deltas)
            })
        })
        .await
    }

    /// Apply changes on top of `base` as one atomic commit and return
    /// the new revision.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit(
        &self,
        base: Revision,
        when: DateTime<Utc>,
        author: Author,
        summary: impl Into<String>,
        detail: impl Into<String>,
        markup: Markup,
        changes: Vec<Change>,
    ) -> Result<Revision> {
        self.commit_internal(base, when, author, summary.into(), detail.into(), markup, changes, false)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn commit_internal(
        &self,
        base: Revision,
        when: DateTime<Utc>,
        author: Author,
        summary: String,
        detail: String,
        markup: Markup,
        changes: Vec<Change>,
        allow_empty: bool,
    ) -> Result<Revision> {
        let (revision, changed) = self
            .run_blocking("commit", move |inner| {
                let _guard = inner.rw.write();
                inner.check_open()?;
                let git = inner.store.open_git()?;

                let head = inner.head_revision();
                let norm = base.normalize(head)?;
                if norm != head {
                    return Err(Error::conflict(format!(
                        "invalid base revision: {base} (expected: {head} or equivalent)"
                    )));
                }

                let result = inner.commit0(
                    &git,
                    Some(head),
                    head.forward(1),
                    when,
                    &author,
                    &summary,
                    &detail,
                    markup,
                    &changes,
                    allow_empty,
                )?;
                inner.head.store(result.0.value(), Ordering::Release);
                Ok(result)
            })
            .await?;

        // Notify while no lock is held: a watcher callback may call
        // straight back into this repository.
        self.inner.watchers.notify(revision, &changed);
        Ok(revision)
    }

    /// The latest revision that changed a matching path since
    /// `last_known`, or `None` when there is none yet.
    pub async fn find_latest_revision(
        &self,
        last_known: Revision,
        path_pattern: &str,
    ) -> Result<Option<Revision>> {
        let pattern = PathPattern::compile(path_pattern);
        self.run_blocking("findLatestRevision", move |inner| {
            let norm = last_known.normalize(inner.head_revision())?;
            inner.read_op(|git| find_latest_locked(inner, git, norm, &pattern))
        })
        .await
    }

    /// Wait until a commit newer than `last_known` touches a path
    /// matching the pattern.
    ///
    /// Resolves to `Ok(None)` when the timeout elapses first and fails
    /// with `ShuttingDown` when the repository closes. Dropping the
    /// future deregisters the waiter.
    pub async fn watch(
        &self,
        last_known: Revision,
        path_pattern: &str,
        timeout: Duration,
    ) -> Result<Option<Revision>> {
        let norm = self.normalize_now(last_known)?;
        let pattern = PathPattern::compile(path_pattern);

        let state = self
            .run_blocking("watch", move |inner| {
                inner.read_op(|git| {
                    // Double-check under the read lock: if last_known is
                    // already outdated there is nothing to wait for, and
                    // no commit can slip in between this check and the
                    // registration.
                    if let Some(revision) = find_latest_locked(inner, git, norm, &pattern)? {
                        return Ok(WatchState::Ready(revision));
                    }
                    let (id, receiver) = inner.watchers.add(pattern.clone())?;
                    Ok(WatchState::Pending(id, receiver))
                })
            })
            .await?;

        match state {
            WatchState::Ready(revision) => Ok(Some(revision)),
            WatchState::Pending(id, receiver) => {
                let guard = WatchGuard { inner: Arc::clone(&self.inner), id: Some(id) };
                match tokio::time::timeout(timeout, receiver).await {
                    // timed out; the guard removes the waiter
                    Err(_) => Ok(None),
                    Ok(Ok(result)) => {
                        guard.disarm();
                        result.map(Some)
                    }
                    // the registry dropped the sender while closing
                    Ok(Err(_)) => {
                        guard.disarm();
                        Err(Error::ShuttingDown)
                    }
                }
            }
        }
    }

    /// Drain in-flight operations and close this repository.
    ///
    /// Idempotent: the first caller performs the close, everyone awaits
    /// its completion. Pending watchers fail with `ShuttingDown`; the
    /// drain is bounded by the configured graceful-shutdown timeout.
    pub async fn close(&self) {
        if !self.inner.close_pending.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            let drain = tokio::task::spawn_blocking(move || {
                let _guard = inner.rw.write();
                inner.index.write().close();
            });
            match tokio::time::timeout(self.inner.config.graceful_shutdown_timeout, drain).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(repository = %self.inner.name, error = %e, "close task failed")
                }
                Err(_) => tracing::warn!(
                    repository = %self.inner.name,
                    "graceful shutdown timed out; failing watchers now"
                ),
            }
            self.inner.watchers.close();
            self.inner.close_done.send_replace(true);
            tracing::info!(
                project = %self.inner.project,
                repository = %self.inner.name,
                "repository closed"
            );
        } else {
            let mut rx = self.inner.close_done.subscribe();
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Clone this repository into a new one at `dir` by replaying its
    /// whole history in batches.
    ///
    /// Empty commits are normally rejected, but a replayed commit whose
    /// effective change set is empty (a hole left by an old engine
    /// version) is preserved as-is.
    pub async fn clone_to(&self, dir: &Path) -> Result<Repository> {
        let end = self.normalize_now(Revision::HEAD)?;

        // keep the original creation identity on the clone
        let first = self.history(Revision::INIT, Revision::INIT, "/**", 1).await?;
        let (author, when) = first
            .first()
            .map(|c| (c.author.clone(), c.when))
            .unwrap_or_else(|| (self.inner.config.creation_author.clone(), Utc::now()));

        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.inner.name)
            .to_string();
        let clone = Repository::create_with(
            &self.inner.project,
            &name,
            dir,
            self.inner.config.clone(),
            author,
            when,
        )
        .await?;

        if let Err(e) = self.replay_into(&clone, end).await {
            clone.close().await;
            let _ = std::fs::remove_dir_all(dir);
            return Err(e);
        }
        Ok(clone)
    }

    async fn replay_into(&self, clone: &Repository, end: Revision) -> Result<()> {
        let mut previous_non_empty: Option<Revision> = None;
        let mut next = 2i64;
        while next <= end.value() {
            let batch_end = (next + CLONE_BATCH as i64 - 1).min(end.value());
            let commits = self
                .history(Revision::new(next), Revision::new(batch_end), "/**", CLONE_BATCH)
                .await?;
            if commits.is_empty() {
                return Err(Error::storage("no commits returned while cloning"));
            }
            if previous_non_empty.is_none() {
                previous_non_empty = Some(commits[0].revision.backward(1));
            }

            for c in commits {
                if c.revision.value() != next {
                    return Err(Error::storage(format!(
                        "mismatching revision while cloning: {} (expected: {next})",
                        c.revision
                    )));
                }
                let base = c.revision.backward(1);
                let changes: Vec<Change> = self
                    .diff(previous_non_empty.unwrap_or(base), c.revision, "/**")
                    .await?
                    .into_values()
                    .collect();

                match clone
                    .commit_internal(
                        base,
                        c.when,
                        c.author.clone(),
                        c.summary.clone(),
                        c.detail.clone(),
                        c.markup,
                        changes.clone(),
                        false,
                    )
                    .await
                {
                    Ok(_) => {
                        previous_non_empty = Some(c.revision);
                    }
                    Err(Error::RedundantChange { .. }) => {
                        clone
                            .commit_internal(
                                base, c.when, c.author, c.summary, c.detail, c.markup, changes,
                                true,
                            )
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
                next += 1;
            }
        }
        Ok(())
    }
}

async fn spawn_blocking<T, F>(operation: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::storage(format!("repository worker failed during {operation}: {e}")))?
}

fn new_inner(
    project: String,
    name: String,
    store: GitStore,
    index: CommitIdIndex,
    head: i64,
    config: RepositoryConfig,
) -> Arc<RepoInner> {
    let (close_done, _) = watch::channel(false);
    Arc::new(RepoInner {
        project,
        name,
        store,
        rw: RwLock::new(()),
        index: RwLock::new(index),
        head: AtomicI64::new(head),
        watchers: CommitWatchers::new(),
        close_pending: AtomicBool::new(false),
        close_done,
        config,
    })
}

fn blocking_create(
    project: String,
    name: String,
    dir: &Path,
    config: RepositoryConfig,
    author: Author,
    when: DateTime<Utc>,
) -> Result<Repository> {
    // fail before the cleanup scope so an existing repository is never
    // deleted as cruft
    if dir.join("config").is_file() {
        return Err(Error::storage(format!(
            "failed to create a repository at {}: exists already",
            dir.display()
        )));
    }

    let result = (|| {
        let store = GitStore::create(dir)?;
        let index = CommitIdIndex::open(dir)?;
        let inner = new_inner(project, name, store, index, 0, config);

        {
            let _guard = inner.rw.write();
            let git = inner.store.open_git()?;
            inner.commit0(
                &git,
                None,
                Revision::INIT,
                when,
                &author,
                "Create a new repository",
                "",
                Markup::Plaintext,
                &[],
                true,
            )?;
            inner.head.store(Revision::INIT.value(), Ordering::Release);
        }

        tracing::info!(project = %inner.project, repository = %inner.name, "created repository");
        Ok(Repository { inner })
    })();

    if result.is_err() && dir.exists() {
        // remove any cruft so it is not loaded on the next run
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::error!(
                dir = %dir.display(),
                error = %e,
                "failed to delete a half-created repository"
            );
        }
    }
    result
}

fn blocking_open(
    project: String,
    name: String,
    dir: &Path,
    config: RepositoryConfig,
) -> Result<Repository> {
    let store = GitStore::open(dir)?;
    let git = store.open_git()?;

    let head_id = store::head_commit_id(&git)?.ok_or_else(|| {
        Error::storage(format!("failed to determine the head of {project}/{name}"))
    })?;
    let head_revision = commit_store::read_commit(&git, head_id)?.revision();

    let mut index = CommitIdIndex::open(dir)?;
    let consistent = index.head_revision() == Some(head_revision)
        && index.get(head_revision).map(|id| id == head_id).unwrap_or(false);
    if !consistent {
        index.rebuild(&git)?;
        if index.head_revision() != Some(head_revision) {
            return Err(Error::storage(format!(
                "commit id index of {project}/{name} is inconsistent after rebuild"
            )));
        }
    }

    let inner = new_inner(project, name, store, index, head_revision.value(), config);
    Ok(Repository { inner })
}

fn blocking_find(
    inner: &RepoInner,
    revision: Revision,
    path_pattern: &str,
    options: &FindOptions,
) -> Result<BTreeMap<String, Entry>> {
    let head = inner.head_revision();
    let norm = match revision.normalize(head) {
        Ok(norm) => norm,
        // a speculative read past the head returns an empty result
        Err(Error::RevisionNotFound(_)) if !revision.is_relative() => {
            return Ok(BTreeMap::new());
        }
        Err(e) => return Err(e),
    };

    inner.read_op(|git| {
        if path_pattern.trim() == "/" {
            let mut result = BTreeMap::new();
            result.insert("/".to_string(), Entry::of_directory(norm, "/"));
            return Ok(result);
        }

        let pattern = PathPattern::compile(path_pattern);
        let tree_id = inner.tree_of(git, norm)?;
        find_in_tree(git, tree_id, norm, &pattern, options)
    })
}

fn find_in_tree(
    git: &git2::Repository,
    tree_id: TreeId,
    revision: Revision,
    pattern: &PathPattern,
    options: &FindOptions,
) -> Result<BTreeMap<String, Entry>> {
    let tree = git.find_tree(tree_id.raw())?;
    let mut result = BTreeMap::new();
    walk_tree(git, &tree, "", pattern, options, revision, &mut result)?;
    Ok(result)
}

/// Pre-order walk with cursor-wise pruning: a subtree is entered only
/// when some path below it could still match.
fn walk_tree(
    git: &git2::Repository,
    tree: &git2::Tree<'_>,
    prefix: &str,
    pattern: &PathPattern,
    options: &FindOptions,
    revision: Revision,
    result: &mut BTreeMap<String, Entry>,
) -> Result<bool> {
    for entry in tree.iter() {
        if result.len() >= options.max_entries {
            return Ok(false);
        }
        let name = entry
            .name()
            .ok_or_else(|| Error::storage(format!("non-utf8 tree entry under /{prefix}")))?;
        let path = format!("/{prefix}{name}");

        match entry.kind() {
            Some(ObjectType::Tree) => {
                if pattern.matches(&path) {
                    result.insert(path.clone(), Entry::of_directory(revision, path.clone()));
                }
                if pattern.matches_dir(&path) {
                    let subtree = git.find_tree(entry.id())?;
                    let child_prefix = format!("{prefix}{name}/");
                    if !walk_tree(git, &subtree, &child_prefix, pattern, options, revision, result)? {
                        return Ok(false);
                    }
                }
            }
            Some(ObjectType::Blob) => {
                if !pattern.matches(&path) {
                    continue;
                }
                let blob = crate::storage::BlobId::new(entry.id());
                let built = match EntryType::guess_from_path(&path) {
                    EntryType::Json if options.fetch_content => {
                        Entry::of_json(revision, path.clone(), store::read_json_blob(git, blob)?)
                    }
                    EntryType::Json => Entry::of_json(revision, path.clone(), Value::Null),
                    _ if options.fetch_content => {
                        Entry::of_text(revision, path.clone(), store::read_text_blob(git, blob)?)
                    }
                    _ => Entry::of_text(revision, path.clone(), ""),
                };
                result.insert(path, built);
            }
            _ => {}
        }
    }
    Ok(true)
}

fn blocking_history(
    inner: &RepoInner,
    from: Revision,
    to: Revision,
    path_pattern: &str,
    max_commits: usize,
) -> Result<Vec<Commit>> {
    if max_commits == 0 {
        return Err(Error::storage("max_commits must be positive"));
    }
    let head = inner.head_revision();
    let range = RevisionRange::new(from.normalize(head)?, to.normalize(head)?);
    let descending = range.to_descending();
    let pattern = PathPattern::compile(path_pattern);

    inner.read_op(|git| {
        let hi = descending.from.value();
        let lo = descending.to.value();

        let mut commits: Vec<Commit> = Vec::new();
        let mut included_lo = false;
        let mut hit_max = false;

        for r in (lo..=hi).rev() {
            let revision = Revision::new(r);
            let commit_id = inner.index.read().get(revision)?;
            let info = commit_store::read_commit(git, commit_id)?;

            let parent_tree = if r > 1 {
                let parent_id = inner.index.read().get(Revision::new(r - 1))?;
                Some(store::tree_of_commit(git, parent_id)?)
            } else {
                None
            };
            let deltas = store::diff_trees(git, parent_tree, Some(info.tree_id))?;
            let touched = deltas.iter().any(|d| {
                pattern.matches(&format!("/{}", d.old_path))
                    || pattern.matches(&format!("/{}", d.new_path))
            });
            if touched {
                commits.push(info.to_commit());
                if r == lo {
                    included_lo = true;
                }
                if commits.len() == max_commits {
                    hit_max = true;
                    break;
                }
            }
        }

        // The initial commit carries no diff, so the filter never yields
        // it; callers asking for the whole tree still expect to see it.
        if !included_lo && !hit_max && lo == 1 && pattern.source().contains("**") {
            let commit_id = inner.index.read().get(Revision::INIT)?;
            let info = commit_store::read_commit(git, commit_id)?;
            commits.push(info.to_commit());
        }

        if range.is_ascending() {
            commits.reverse();
        }
        Ok(commits)
    })
}

fn blocking_diff(
    inner: &RepoInner,
    from: Revision,
    to: Revision,
    path_pattern: &str,
) -> Result<BTreeMap<String, Change>> {
    let head = inner.head_revision();
    let range = RevisionRange::new(from.normalize(head)?, to.normalize(head)?).to_ascending();
    let pattern = PathPattern::compile(path_pattern);

    inner.read_op(|git| {
        let tree_a = inner.tree_of(git, range.from)?;
        let tree_b = inner.tree_of(git, range.to)?;
        let deltas = store::diff_trees(git, Some(tree_a), Some(tree_b))?;

        let filtered: Vec<TreeDelta> = deltas
            .into_iter()
            .filter(|d| {
                pattern.matches_all()
                    || pattern.matches(&format!("/{}", d.old_path))
                    || pattern.matches(&format!("/{}", d.new_path))
            })
            .collect();
        to_change_map(git, &filtered)
    })
}

/// Translate tree deltas into the public change map.
fn to_change_map(git: &git2::Repository, deltas: &[TreeDelta]) -> Result<BTreeMap<String, Change>> {
    let mut changes = BTreeMap::new();
    for delta in deltas {
        let old_path = format!("/{}", delta.old_path);
        let new_path = format!("/{}", delta.new_path);

        match delta.kind {
            DeltaKind::Modified | DeltaKind::Renamed => {
                if old_path != new_path {
                    put_change(
                        &mut changes,
                        old_path.clone(),
                        Change::Rename { from: old_path.clone(), to: new_path.clone() },
                    )?;
                }
                match EntryType::guess_from_path(&old_path) {
                    EntryType::Json => {
                        let old_json = store::read_json_blob(git, delta.old_blob)?;
                        let new_json = store::read_json_blob(git, delta.new_blob)?;
                        let patch = jsonpatch::generate(&old_json, &new_json, ReplaceMode::Safe);
                        let empty = patch.as_array().map(Vec::is_empty).unwrap_or(true);
                        if !empty {
                            put_change(
                                &mut changes,
                                new_path.clone(),
                                Change::ApplyJsonPatch { path: new_path, patch },
                            )?;
                        }
                    }
                    _ => {
                        let old_text = store::read_text_blob(git, delta.old_blob)?;
                        let new_text = store::read_text_blob(git, delta.new_blob)?;
                        if old_text != new_text {
                            let patch =
                                text::unified_diff(&old_text, &new_text, &old_path, &new_path);
                            put_change(
                                &mut changes,
                                new_path.clone(),
                                Change::ApplyTextPatch { path: new_path, patch },
                            )?;
                        }
                    }
                }
            }
            DeltaKind::Added => {
                let change = match EntryType::guess_from_path(&new_path) {
                    EntryType::Json => Change::UpsertJson {
                        path: new_path.clone(),
                        content: store::read_json_blob(git, delta.new_blob)?,
                    },
                    _ => Change::UpsertText {
                        path: new_path.clone(),
                        content: store::read_text_blob(git, delta.new_blob)?,
                    },
                };
                put_change(&mut changes, new_path, change)?;
            }
            DeltaKind::Deleted => {
                put_change(&mut changes, old_path.clone(), Change::Remove { path: old_path })?;
            }
        }
    }
    Ok(changes)
}

fn put_change(
    changes: &mut BTreeMap<String, Change>,
    path: String,
    change: Change,
) -> Result<()> {
    if changes.insert(path.clone(), change).is_some() {
        return Err(Error::storage(format!("duplicate change for path {path}")));
    }
    Ok(())
}

fn find_latest_locked(
    inner: &RepoInner,
    git: &git2::Repository,
    last_known: Revision,
    pattern: &PathPattern,
) -> Result<Option<Revision>> {
    let head = inner.head_revision();
    if last_known == head {
        return Ok(None);
    }

    if last_known == Revision::INIT {
        // Fast path: revision 1 holds nothing, so any match at the head
        // is news.
        let tree_id = inner.tree_of(git, head)?;
        let probe = find_in_tree(git, tree_id, head, pattern, &FindOptions::one_without_content())?;
        return Ok(if probe.is_empty() { None } else { Some(head) });
    }

    let tree_a = inner.tree_of(git, last_known)?;
    let tree_b = inner.tree_of(git, head)?;
    if tree_a == tree_b {
        return Ok(None);
    }

    let deltas = inner.compare_trees(git, tree_a, tree_b)?;
    let touched = deltas
        .iter()
        .any(|d| pattern.matches(&format!("/{}", d.notify_path())));
    Ok(if touched { Some(head) } else { None })
}
