//! The narrow capability surface the engine needs from a version-control
//! backend.
//!
//! A backend stores raw objects by kind, hashes them, reads and scans refs,
//! and applies a batch of ref updates atomically. Everything else (tree and
//! commit encodings, history walks, buffered writes) is built on top of
//! that in this module, so the in-memory backend and the git backend behave
//! identically.

pub mod inserter;
pub mod memory;
pub mod object;
pub mod refs;
pub mod walk;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use inserter::{ObjectInserter, StagedObjects};
pub use memory::{MemoryRepoManager, MemoryRepository};
pub use object::{CommitData, ObjectId, ObjectIdError, ObjectKind, PersonIdent, Tree};
pub use walk::CommitWalk;

/// Backend-level failures.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("object {0} not found")]
    MissingObject(ObjectId),

    #[error("object {id} is a {actual}, expected a {expected}")]
    WrongKind {
        id: ObjectId,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    #[error("malformed {kind} {id}: {detail}")]
    Corrupt {
        id: ObjectId,
        kind: ObjectKind,
        detail: String,
    },

    #[error("invalid ref name {0:?}")]
    InvalidRefName(String),

    #[error("backend returned {actual} for an object hashed as {expected}")]
    HashMismatch { expected: ObjectId, actual: ObjectId },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

// ---------------------------------------------------------------------------
// Ref updates
// ---------------------------------------------------------------------------

/// One compare-and-swap command. The zero id means "absent" on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: String,
    pub old: ObjectId,
    pub new: ObjectId,
}

impl RefUpdate {
    #[must_use]
    pub fn new(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }

    #[must_use]
    pub fn is_create(&self) -> bool {
        self.old.is_zero() && !self.new.is_zero()
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        !self.old.is_zero() && self.new.is_zero()
    }
}

/// Per-command result of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdateOutcome {
    Ok,
    /// The ref's live value did not match `old`.
    LockFailure,
    /// Not applied because another command in the batch failed.
    Aborted,
    Rejected(String),
}

impl RefUpdateOutcome {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for RefUpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::LockFailure => f.write_str("lock failure"),
            Self::Aborted => f.write_str("aborted"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Typed object reads layered over raw `read_object`.
pub trait ObjectReader {
    /// Read a raw object and its kind.
    ///
    /// # Errors
    ///
    /// [`RepoError::MissingObject`] when the id is unknown.
    fn read_object(&self, id: ObjectId) -> Result<(ObjectKind, Vec<u8>), RepoError>;

    /// # Errors
    ///
    /// Missing object or wrong kind.
    fn read_typed(&self, id: ObjectId, expected: ObjectKind) -> Result<Vec<u8>, RepoError> {
        let (actual, bytes) = self.read_object(id)?;
        if actual != expected {
            return Err(RepoError::WrongKind {
                id,
                expected,
                actual,
            });
        }
        Ok(bytes)
    }

    /// # Errors
    ///
    /// Missing object or wrong kind.
    fn read_blob(&self, id: ObjectId) -> Result<Vec<u8>, RepoError> {
        self.read_typed(id, ObjectKind::Blob)
    }

    /// # Errors
    ///
    /// Missing object, wrong kind or malformed tree.
    fn read_tree(&self, id: ObjectId) -> Result<Tree, RepoError> {
        let bytes = self.read_typed(id, ObjectKind::Tree)?;
        Tree::decode(&bytes).map_err(|detail| RepoError::Corrupt {
            id,
            kind: ObjectKind::Tree,
            detail,
        })
    }

    /// # Errors
    ///
    /// Missing object, wrong kind or malformed commit.
    fn read_commit(&self, id: ObjectId) -> Result<CommitData, RepoError> {
        let bytes = self.read_typed(id, ObjectKind::Commit)?;
        CommitData::decode(&bytes).map_err(|detail| RepoError::Corrupt {
            id,
            kind: ObjectKind::Commit,
            detail,
        })
    }
}

/// One repository as seen by the engine.
pub trait Repository: ObjectReader + Send + Sync {
    fn name(&self) -> &str;

    /// Id the backend would assign to these bytes, without storing them.
    fn hash_object(&self, kind: ObjectKind, data: &[u8]) -> ObjectId;

    /// Store an object and return its id.
    ///
    /// # Errors
    ///
    /// Backend write failure.
    fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, RepoError>;

    /// # Errors
    ///
    /// Backend read failure. A missing ref is `Ok(None)`.
    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, RepoError>;

    /// All refs whose name starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Backend read failure.
    fn scan_refs(&self, prefix: &str) -> Result<BTreeMap<String, ObjectId>, RepoError>;

    /// Apply every command or none of them. The returned outcomes line up
    /// with `commands`; when any command fails, no ref is modified.
    ///
    /// # Errors
    ///
    /// Backend failure unrelated to compare-and-swap.
    fn update_refs(&self, commands: &[RefUpdate]) -> Result<Vec<RefUpdateOutcome>, RepoError>;
}

/// Opens repositories by name.
pub trait RepoManager: Send + Sync {
    /// `Ok(None)` when no repository of that name exists.
    ///
    /// # Errors
    ///
    /// Backend failure while opening an existing repository.
    fn open(&self, name: &str) -> Result<Option<Arc<dyn Repository>>, RepoError>;

    /// Open or create.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn create(&self, name: &str) -> Result<Arc<dyn Repository>, RepoError>;
}
