//! git2-backed repository backend for refnotes.
//!
//! Every repository is a bare git repository under one base directory,
//! named `<name>.git`. Objects go straight into the object database: the
//! core already encodes trees and commits in git's own format, so ids from
//! [`Repository::hash_object`] are git SHA-1 ids.
//!
//! [`Repository::hash_object`]: refnotes_core::repo::Repository::hash_object

mod manager;
mod repository;

pub use manager::GitRepoManager;
pub use repository::GitRepository;

use refnotes_core::repo::{ObjectId, ObjectKind, RepoError};

pub(crate) fn backend(err: git2::Error) -> RepoError {
    RepoError::Backend(Box::new(err))
}

pub(crate) fn to_oid(id: ObjectId) -> Result<git2::Oid, RepoError> {
    git2::Oid::from_bytes(id.as_bytes()).map_err(backend)
}

pub(crate) fn from_oid(oid: git2::Oid) -> ObjectId {
    ObjectId::from_slice(oid.as_bytes()).unwrap_or(ObjectId::ZERO)
}

pub(crate) const fn to_object_type(kind: ObjectKind) -> git2::ObjectType {
    match kind {
        ObjectKind::Blob => git2::ObjectType::Blob,
        ObjectKind::Tree => git2::ObjectType::Tree,
        ObjectKind::Commit => git2::ObjectType::Commit,
    }
}

pub(crate) const fn from_object_type(kind: git2::ObjectType) -> Option<ObjectKind> {
    match kind {
        git2::ObjectType::Blob => Some(ObjectKind::Blob),
        git2::ObjectType::Tree => Some(ObjectKind::Tree),
        git2::ObjectType::Commit => Some(ObjectKind::Commit),
        _ => None,
    }
}
