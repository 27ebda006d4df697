//! Project and repository lifecycle.
//!
//! Repositories are grouped under projects on disk: a repository named
//! `name` in project `project` lives at `<root>/<project>/<name>`. The
//! manager tracks open repositories and closes them together on
//! shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::repo::repository::{Repository, RepositoryConfig};

/// Creates, opens and removes repositories under one root directory.
pub struct RepositoryManager {
    root: PathBuf,
    config: RepositoryConfig,
    open: RwLock<HashMap<(String, String), Repository>>,
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(Error::storage(format!("invalid {kind} name: {name:?}")))
    }
}

impl RepositoryManager {
    pub fn new(root: impl Into<PathBuf>, config: RepositoryConfig) -> Self {
        Self { root: root.into(), config, open: RwLock::new(HashMap::new()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, project: &str, name: &str) -> PathBuf {
        self.root.join(project).join(name)
    }

    /// the repository if it is currently open
    pub fn get(&self, project: &str, name: &str) -> Option<Repository> {
        self.open
            .read()
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    /// Create a new repository and keep it open.
    pub async fn create(&self, project: &str, name: &str) -> Result<Repository> {
        validate_name("project", project)?;
        validate_name("repository", name)?;
        if self.get(project, name).is_some() {
            return Err(Error::storage(format!(
                "repository exists already: {project}/{name}"
            )));
        }

        let dir = self.repo_dir(project, name);
        let repo = Repository::create(project, name, &dir, self.config.clone()).await?;
        self.open
            .write()
            .insert((project.to_string(), name.to_string()), repo.clone());
        Ok(repo)
    }

    /// Open an existing repository, reusing the handle if it is open
    /// already.
    pub async fn open(&self, project: &str, name: &str) -> Result<Repository> {
        validate_name("project", project)?;
        validate_name("repository", name)?;
        if let Some(repo) = self.get(project, name) {
            return Ok(repo);
        }

        let dir = self.repo_dir(project, name);
        let repo = Repository::open(project, name, &dir, self.config.clone()).await?;
        let mut open = self.open.write();
        // another task may have opened it while we were off the lock
        Ok(open
            .entry((project.to_string(), name.to_string()))
            .or_insert(repo)
            .clone())
    }

    /// List the repositories of a project present on disk.
    pub fn list(&self, project: &str) -> Result<Vec<String>> {
        validate_name("project", project)?;
        let project_dir = self.root.join(project);
        if !project_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&project_dir)? {
            let entry = entry?;
            if entry.path().join("config").is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Close a repository and delete it from disk.
    pub async fn remove(&self, project: &str, name: &str) -> Result<()> {
        validate_name("project", project)?;
        validate_name("repository", name)?;

        let repo = {
            let mut open = self.open.write();
            open.remove(&(project.to_string(), name.to_string()))
        };
        if let Some(repo) = repo {
            repo.close().await;
        }

        let dir = self.repo_dir(project, name);
        if !dir.join("config").is_file() {
            return Err(Error::RepositoryNotFound(dir.display().to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!(project, repository = name, "removed repository");
        Ok(())
    }

    /// Close every open repository.
    pub async fn close_all(&self) {
        let repos: Vec<Repository> = {
            let mut open = self.open.write();
            open.drain().map(|(_, repo)| repo).collect()
        };
        for repo in repos {
            repo.close().await;
        }
    }
}
