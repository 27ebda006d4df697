//! The long-poll watcher registry.
//!
//! Each waiter is a `(pattern, promise)` record; a commit's changed paths
//! are matched against every pattern and matching waiters are completed
//! with the new revision. Completions are always sent after the registry
//! lock is released: a completion may re-enter the repository, and
//! holding the lock across it would deadlock.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::pattern::PathPattern;
use crate::revision::Revision;

struct Waiter {
    pattern: PathPattern,
    sender: oneshot::Sender<Result<Revision>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    closed: bool,
    waiters: HashMap<u64, Waiter>,
}

#[derive(Default)]
pub(crate) struct CommitWatchers {
    registry: Mutex<Registry>,
}

impl CommitWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Fails once the registry has been closed.
    pub fn add(&self, pattern: PathPattern) -> Result<(u64, oneshot::Receiver<Result<Revision>>)> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(Error::ShuttingDown);
        }
        let id = registry.next_id;
        registry.next_id += 1;
        let (sender, receiver) = oneshot::channel();
        registry.waiters.insert(id, Waiter { pattern, sender });
        Ok((id, receiver))
    }

    /// Remove a waiter, e.g. when the caller cancels or times out.
    pub fn remove(&self, id: u64) {
        self.registry.lock().waiters.remove(&id);
    }

    /// Complete every waiter whose pattern matches any of the changed
    /// paths. Non-matching waiters stay registered.
    pub fn notify(&self, revision: Revision, changed_paths: &[String]) {
        let completed: Vec<oneshot::Sender<Result<Revision>>> = {
            let mut registry = self.registry.lock();
            let matched: Vec<u64> = registry
                .waiters
                .iter()
                .filter(|(_, w)| changed_paths.iter().any(|p| w.pattern.matches(p)))
                .map(|(id, _)| *id)
                .collect();
            matched
                .into_iter()
                .filter_map(|id| registry.waiters.remove(&id))
                .map(|w| w.sender)
                .collect()
        };
        // completion callbacks run outside the lock
        for sender in completed {
            let _ = sender.send(Ok(revision));
        }
    }

    /// Terminal shutdown: fail every waiter and reject later additions.
    /// Idempotent.
    pub fn close(&self) {
        let drained: Vec<oneshot::Sender<Result<Revision>>> = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.waiters.drain().map(|(_, w)| w.sender).collect()
        };
        for sender in drained {
            let _ = sender.send(Err(Error::ShuttingDown));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.registry.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_notify_completes_matching_waiter() {
        let watchers = CommitWatchers::new();
        let (_, rx) = watchers.add(PathPattern::compile("/a/**")).unwrap();

        watchers.notify(Revision::new(2), &paths(&["/a/b.json"]));
        assert_eq!(rx.await.unwrap().unwrap(), Revision::new(2));
        assert_eq!(watchers.len(), 0);
    }

    #[tokio::test]
    async fn test_non_matching_waiter_stays() {
        let watchers = CommitWatchers::new();
        let (_, mut rx) = watchers.add(PathPattern::compile("/b/**")).unwrap();

        watchers.notify(Revision::new(2), &paths(&["/a/x.json"]));
        assert_eq!(watchers.len(), 1);
        assert!(rx.try_recv().is_err());

        watchers.notify(Revision::new(3), &paths(&["/b/y.json"]));
        assert_eq!(rx.await.unwrap().unwrap(), Revision::new(3));
    }

    #[tokio::test]
    async fn test_remove_cancels() {
        let watchers = CommitWatchers::new();
        let (id, mut rx) = watchers.add(PathPattern::compile("/**")).unwrap();
        watchers.remove(id);
        assert_eq!(watchers.len(), 0);

        watchers.notify(Revision::new(2), &paths(&["/a"]));
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[tokio::test]
    async fn test_close_fails_all_waiters() {
        let watchers = CommitWatchers::new();
        let (_, rx1) = watchers.add(PathPattern::compile("/**")).unwrap();
        let (_, rx2) = watchers.add(PathPattern::compile("/x")).unwrap();

        watchers.close();
        watchers.close();

        assert!(matches!(rx1.await.unwrap(), Err(Error::ShuttingDown)));
        assert!(matches!(rx2.await.unwrap(), Err(Error::ShuttingDown)));
        assert!(matches!(
            watchers.add(PathPattern::compile("/**")),
            Err(Error::ShuttingDown)
        ));
    }
}
