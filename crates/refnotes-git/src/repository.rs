use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use git2::ErrorCode;
use refnotes_core::repo::{
    ObjectId, ObjectKind, ObjectReader, RefUpdate, RefUpdateOutcome, RepoError, Repository,
};

use crate::{backend, from_object_type, from_oid, to_object_type, to_oid};

const REFLOG_MESSAGE: &str = "refnotes: update";
const REFLOG_NAME: &str = "refnotes";
const REFLOG_EMAIL: &str = "refnotes@localhost";

/// One bare repository. `git2::Repository` is not `Sync`, so every call
/// goes through a mutex.
pub struct GitRepository {
    name: String,
    repo: Mutex<git2::Repository>,
}

impl GitRepository {
    /// Open an existing bare repository.
    ///
    /// # Errors
    ///
    /// [`RepoError::Backend`] if `path` is not a git repository.
    pub fn open(name: impl Into<String>, path: &Path) -> Result<Self, RepoError> {
        let repo = git2::Repository::open_bare(path).map_err(backend)?;
        Ok(Self::wrap(name, repo))
    }

    /// Create a bare repository at `path`, or open it if one exists.
    ///
    /// # Errors
    ///
    /// [`RepoError::Backend`] if the repository cannot be created.
    pub fn init(name: impl Into<String>, path: &Path) -> Result<Self, RepoError> {
        let repo = git2::Repository::init_bare(path).map_err(backend)?;
        Ok(Self::wrap(name, repo))
    }

    fn wrap(name: impl Into<String>, repo: git2::Repository) -> Self {
        Self {
            name: name.into(),
            repo: Mutex::new(repo),
        }
    }

    fn lock(&self) -> MutexGuard<'_, git2::Repository> {
        self.repo.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ObjectReader for GitRepository {
    fn read_object(&self, id: ObjectId) -> Result<(ObjectKind, Vec<u8>), RepoError> {
        let repo = self.lock();
        let odb = repo.odb().map_err(backend)?;
        let object = match odb.read(to_oid(id)?) {
            Ok(object) => object,
            Err(e) if e.code() == ErrorCode::NotFound => return Err(RepoError::MissingObject(id)),
            Err(e) => return Err(backend(e)),
        };
        let kind = from_object_type(object.kind()).ok_or_else(|| RepoError::Corrupt {
            id,
            kind: ObjectKind::Blob,
            detail: format!("unsupported object type {}", object.kind()),
        })?;
        Ok((kind, object.data().to_vec()))
    }
}

impl Repository for GitRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn hash_object(&self, kind: ObjectKind, data: &[u8]) -> ObjectId {
        git2::Oid::hash_object(to_object_type(kind), data).map_or(ObjectId::ZERO, from_oid)
    }

    fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, RepoError> {
        let repo = self.lock();
        let odb = repo.odb().map_err(backend)?;
        let oid = odb.write(to_object_type(kind), data).map_err(backend)?;
        let written = from_oid(oid);
        let expected = self.hash_object(kind, data);
        if written != expected {
            return Err(RepoError::HashMismatch {
                expected,
                actual: written,
            });
        }
        Ok(written)
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, RepoError> {
        match self.lock().refname_to_id(name) {
            Ok(oid) => Ok(Some(from_oid(oid))),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) if e.code() == ErrorCode::InvalidSpec => Err(RepoError::InvalidRefName(name.to_string())),
            Err(e) => Err(backend(e)),
        }
    }

    fn scan_refs(&self, prefix: &str) -> Result<BTreeMap<String, ObjectId>, RepoError> {
        let repo = self.lock();
        let mut found = BTreeMap::new();
        for reference in repo.references().map_err(backend)? {
            let reference = reference.map_err(backend)?;
            let (Some(name), Some(target)) = (reference.name(), reference.target()) else {
                continue;
            };
            if name.starts_with(prefix) {
                found.insert(name.to_string(), from_oid(target));
            }
        }
        Ok(found)
    }

    /// Locks every ref, checks every expected old value, then commits.
    /// Nothing is written unless all checks pass.
    fn update_refs(&self, commands: &[RefUpdate]) -> Result<Vec<RefUpdateOutcome>, RepoError> {
        for cmd in commands {
            if !cmd.name.starts_with("refs/") || !git2::Reference::is_valid_name(&cmd.name) {
                return Err(RepoError::InvalidRefName(cmd.name.clone()));
            }
        }
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let repo = self.lock();
        let odb = repo.odb().map_err(backend)?;
        let mut tx = repo.transaction().map_err(backend)?;

        let mut outcomes = Vec::with_capacity(commands.len());
        for cmd in commands {
            let outcome = match tx.lock_ref(&cmd.name) {
                Err(e) if e.code() == ErrorCode::Locked => RefUpdateOutcome::LockFailure,
                Err(e) => return Err(backend(e)),
                Ok(()) => {
                    let live = match repo.refname_to_id(&cmd.name) {
                        Ok(oid) => from_oid(oid),
                        Err(e) if e.code() == ErrorCode::NotFound => ObjectId::ZERO,
                        Err(e) => return Err(backend(e)),
                    };
                    if live != cmd.old {
                        RefUpdateOutcome::LockFailure
                    } else if !cmd.new.is_zero() && !odb.exists(to_oid(cmd.new)?) {
                        RefUpdateOutcome::Rejected(format!("missing object {}", cmd.new))
                    } else {
                        RefUpdateOutcome::Ok
                    }
                }
            };
            outcomes.push(outcome);
        }

        if outcomes.iter().any(|o| !o.is_ok()) {
            tracing::debug!(
                repo = %self.name,
                commands = commands.len(),
                "ref transaction rejected"
            );
            return Ok(outcomes
                .into_iter()
                .map(|o| if o.is_ok() { RefUpdateOutcome::Aborted } else { o })
                .collect());
        }

        let signature = git2::Signature::now(REFLOG_NAME, REFLOG_EMAIL).map_err(backend)?;
        for cmd in commands {
            if cmd.new.is_zero() {
                if !cmd.old.is_zero() {
                    tx.remove(&cmd.name).map_err(backend)?;
                }
            } else {
                tx.set_target(&cmd.name, to_oid(cmd.new)?, Some(&signature), REFLOG_MESSAGE)
                    .map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)?;
        tracing::debug!(repo = %self.name, commands = commands.len(), "ref transaction committed");
        Ok(outcomes)
    }
}
