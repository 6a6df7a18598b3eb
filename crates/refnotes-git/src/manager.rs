use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use refnotes_core::repo::{RepoError, RepoManager, Repository};

use crate::GitRepository;

/// Bare repositories under one directory, one per name, opened once and
/// shared.
pub struct GitRepoManager {
    base: PathBuf,
    open: RwLock<HashMap<String, Arc<GitRepository>>>,
}

impl GitRepoManager {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            open: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Where repository `name` lives on disk.
    #[must_use]
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.base.join(format!("{name}.git"))
    }

    fn cached(&self, name: &str) -> Option<Arc<GitRepository>> {
        self.open
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remember(&self, name: &str, repo: GitRepository) -> Arc<GitRepository> {
        self.open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(repo))
            .clone()
    }
}

fn check_name(name: &str) -> Result<(), RepoError> {
    if name.is_empty() || name.starts_with('/') || name.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(RepoError::InvalidRefName(name.to_string()));
    }
    Ok(())
}

impl RepoManager for GitRepoManager {
    fn open(&self, name: &str) -> Result<Option<Arc<dyn Repository>>, RepoError> {
        check_name(name)?;
        if let Some(repo) = self.cached(name) {
            return Ok(Some(repo));
        }
        let path = self.path_of(name);
        if !path.exists() {
            return Ok(None);
        }
        let repo = GitRepository::open(name, &path)?;
        Ok(Some(self.remember(name, repo)))
    }

    fn create(&self, name: &str) -> Result<Arc<dyn Repository>, RepoError> {
        check_name(name)?;
        if let Some(repo) = self.cached(name) {
            return Ok(repo);
        }
        let path = self.path_of(name);
        let repo = if path.exists() {
            GitRepository::open(name, &path)?
        } else {
            tracing::info!(repo = name, path = %path.display(), "creating repository");
            GitRepository::init(name, &path)?
        };
        Ok(self.remember(name, repo))
    }
}
