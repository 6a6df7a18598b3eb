//! Buffered object writes.
//!
//! Staging a batch computes every new object's id up front but keeps the
//! bytes in memory, so staging never touches the backing store. Objects
//! reach the store only on [`ObjectInserter::flush`], immediately before the
//! ref transaction that makes them reachable.

use std::collections::HashMap;

use super::{CommitData, ObjectId, ObjectKind, ObjectReader, RepoError, Repository, Tree};

#[derive(Debug)]
struct PendingObject {
    id: ObjectId,
    kind: ObjectKind,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ObjectInserter {
    pending: Vec<PendingObject>,
    index: HashMap<ObjectId, usize>,
}

impl ObjectInserter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an object and return the id the backend will give it.
    pub fn insert(&mut self, repo: &dyn Repository, kind: ObjectKind, data: Vec<u8>) -> ObjectId {
        let id = repo.hash_object(kind, &data);
        if !self.index.contains_key(&id) {
            self.index.insert(id, self.pending.len());
            self.pending.push(PendingObject { id, kind, data });
        }
        id
    }

    pub fn insert_blob(&mut self, repo: &dyn Repository, data: Vec<u8>) -> ObjectId {
        self.insert(repo, ObjectKind::Blob, data)
    }

    pub fn insert_tree(&mut self, repo: &dyn Repository, tree: &Tree) -> ObjectId {
        self.insert(repo, ObjectKind::Tree, tree.encode())
    }

    pub fn insert_commit(&mut self, repo: &dyn Repository, commit: &CommitData) -> ObjectId {
        self.insert(repo, ObjectKind::Commit, commit.encode())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Reader that sees buffered objects first, then the repository.
    #[must_use]
    pub fn reader<'a>(&'a self, repo: &'a dyn Repository) -> StagedObjects<'a> {
        StagedObjects {
            repo,
            inserter: self,
        }
    }

    /// Write every buffered object to `repo`.
    ///
    /// # Errors
    ///
    /// Propagates write failures, and rejects a backend that assigns a
    /// different id than it reported from `hash_object`.
    pub fn flush(&mut self, repo: &dyn Repository) -> Result<usize, RepoError> {
        let count = self.pending.len();
        for object in self.pending.drain(..) {
            let written = repo.write_object(object.kind, &object.data)?;
            if written != object.id {
                return Err(RepoError::HashMismatch {
                    expected: object.id,
                    actual: written,
                });
            }
        }
        self.index.clear();
        tracing::debug!(repo = repo.name(), objects = count, "flushed staged objects");
        Ok(count)
    }
}

/// Read view combining an inserter's buffer with its repository.
pub struct StagedObjects<'a> {
    repo: &'a dyn Repository,
    inserter: &'a ObjectInserter,
}

impl ObjectReader for StagedObjects<'_> {
    fn read_object(&self, id: ObjectId) -> Result<(ObjectKind, Vec<u8>), RepoError> {
        if let Some(&slot) = self.inserter.index.get(&id) {
            let object = &self.inserter.pending[slot];
            return Ok((object.kind, object.data.clone()));
        }
        self.repo.read_object(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepository;

    #[test]
    fn staged_objects_are_readable_before_flush() {
        let repo = MemoryRepository::new("p");
        let mut ins = ObjectInserter::new();
        let id = ins.insert_blob(&repo, b"hello".to_vec());
        assert!(repo.read_blob(id).is_err());
        assert_eq!(ins.reader(&repo).read_blob(id).expect("staged"), b"hello");

        assert_eq!(ins.flush(&repo).expect("flush"), 1);
        assert!(ins.is_empty());
        assert_eq!(repo.read_blob(id).expect("stored"), b"hello");
    }

    #[test]
    fn duplicate_inserts_are_buffered_once() {
        let repo = MemoryRepository::new("p");
        let mut ins = ObjectInserter::new();
        let a = ins.insert_blob(&repo, b"x".to_vec());
        let b = ins.insert_blob(&repo, b"x".to_vec());
        assert_eq!(a, b);
        assert_eq!(ins.len(), 1);
    }
}
