//! In-memory backend.
//!
//! Used by tests and by embedders that want the engine without a git
//! checkout. Object ids are blake3 digests truncated to 20 bytes over a
//! git-style `<kind> <len>\0` header, so ids are stable across runs but
//! deliberately differ from git's SHA-1 ids.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::{
    ObjectId, ObjectKind, ObjectReader, RefUpdate, RefUpdateOutcome, RepoError, RepoManager,
    Repository,
};

#[derive(Debug)]
pub struct MemoryRepository {
    name: String,
    objects: RwLock<HashMap<ObjectId, (ObjectKind, Arc<[u8]>)>>,
    refs: Mutex<BTreeMap<String, ObjectId>>,
    transactions: AtomicUsize,
    injected_lock_failures: AtomicUsize,
}

impl MemoryRepository {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
            refs: Mutex::new(BTreeMap::new()),
            transactions: AtomicUsize::new(0),
            injected_lock_failures: AtomicUsize::new(0),
        }
    }

    /// Number of `update_refs` calls so far, successful or not.
    #[must_use]
    pub fn ref_transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    /// Make the next `count` ref transactions fail with a lock failure, as if
    /// another process had raced them.
    pub fn inject_lock_failures(&self, count: usize) {
        self.injected_lock_failures.store(count, Ordering::SeqCst);
    }

    /// Number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_lock_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn has_object(&self, id: ObjectId) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

impl ObjectReader for MemoryRepository {
    fn read_object(&self, id: ObjectId) -> Result<(ObjectKind, Vec<u8>), RepoError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|(kind, data)| (*kind, data.to_vec()))
            .ok_or(RepoError::MissingObject(id))
    }
}

impl Repository for MemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn hash_object(&self, kind: ObjectKind, data: &[u8]) -> ObjectId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(data);
        let digest = hasher.finalize();
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest.as_bytes()[..20]);
        ObjectId::from_bytes(id)
    }

    fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, RepoError> {
        let id = self.hash_object(kind, data);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| (kind, Arc::from(data)));
        Ok(id)
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, RepoError> {
        Ok(self
            .refs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied())
    }

    fn scan_refs(&self, prefix: &str) -> Result<BTreeMap<String, ObjectId>, RepoError> {
        Ok(self
            .refs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, id)| (name.clone(), *id))
            .collect())
    }

    fn update_refs(&self, commands: &[RefUpdate]) -> Result<Vec<RefUpdateOutcome>, RepoError> {
        for cmd in commands {
            if !cmd.name.starts_with("refs/") {
                return Err(RepoError::InvalidRefName(cmd.name.clone()));
            }
        }

        let mut refs = self.refs.lock().unwrap_or_else(PoisonError::into_inner);
        self.transactions.fetch_add(1, Ordering::SeqCst);

        if self.take_injected_failure() {
            return Ok(vec![RefUpdateOutcome::LockFailure; commands.len()]);
        }

        let outcomes: Vec<RefUpdateOutcome> = commands
            .iter()
            .map(|cmd| {
                let live = refs.get(&cmd.name).copied().unwrap_or(ObjectId::ZERO);
                if live != cmd.old {
                    RefUpdateOutcome::LockFailure
                } else if !cmd.new.is_zero() && !self.has_object(cmd.new) {
                    RefUpdateOutcome::Rejected(format!("missing object {}", cmd.new))
                } else {
                    RefUpdateOutcome::Ok
                }
            })
            .collect();

        if outcomes.iter().any(|o| !o.is_ok()) {
            return Ok(outcomes
                .into_iter()
                .map(|o| if o.is_ok() { RefUpdateOutcome::Aborted } else { o })
                .collect());
        }

        for cmd in commands {
            if cmd.new.is_zero() {
                refs.remove(&cmd.name);
            } else {
                refs.insert(cmd.name.clone(), cmd.new);
            }
        }
        Ok(outcomes)
    }
}

/// Repositories keyed by name, created on demand.
#[derive(Debug, Default)]
pub struct MemoryRepoManager {
    repos: RwLock<HashMap<String, Arc<MemoryRepository>>>,
}

impl MemoryRepoManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle, for tests that inspect transaction counts.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<MemoryRepository>> {
        self.repos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl RepoManager for MemoryRepoManager {
    fn open(&self, name: &str) -> Result<Option<Arc<dyn Repository>>, RepoError> {
        Ok(self.get(name).map(|repo| repo as Arc<dyn Repository>))
    }

    fn create(&self, name: &str) -> Result<Arc<dyn Repository>, RepoError> {
        let repo = self
            .repos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryRepository::new(name)))
            .clone();
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(repo: &MemoryRepository, data: &[u8]) -> ObjectId {
        repo.write_object(ObjectKind::Blob, data).expect("write")
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let repo = MemoryRepository::new("p");
        let a = blob(&repo, b"a");
        let b = blob(&repo, b"b");
        let ok = repo
            .update_refs(&[RefUpdate::new("refs/x", ObjectId::ZERO, a)])
            .expect("update");
        assert_eq!(ok, vec![RefUpdateOutcome::Ok]);

        let outcomes = repo
            .update_refs(&[
                RefUpdate::new("refs/y", ObjectId::ZERO, b),
                RefUpdate::new("refs/x", b, a),
            ])
            .expect("update");
        assert_eq!(
            outcomes,
            vec![RefUpdateOutcome::Aborted, RefUpdateOutcome::LockFailure]
        );
        assert_eq!(repo.read_ref("refs/y").expect("read"), None);
        assert_eq!(repo.ref_transactions(), 2);
    }

    #[test]
    fn ref_to_missing_object_is_rejected() {
        let repo = MemoryRepository::new("p");
        let outcomes = repo
            .update_refs(&[RefUpdate::new(
                "refs/x",
                ObjectId::ZERO,
                ObjectId::from_bytes([9; 20]),
            )])
            .expect("update");
        assert!(matches!(outcomes[0], RefUpdateOutcome::Rejected(_)));
    }

    #[test]
    fn scan_respects_prefix_and_delete_removes() {
        let repo = MemoryRepository::new("p");
        let a = blob(&repo, b"a");
        repo.update_refs(&[
            RefUpdate::new("refs/changes/01/1/meta", ObjectId::ZERO, a),
            RefUpdate::new("refs/sequences/changes", ObjectId::ZERO, a),
        ])
        .expect("update");
        assert_eq!(repo.scan_refs("refs/changes/").expect("scan").len(), 1);

        repo.update_refs(&[RefUpdate::new("refs/changes/01/1/meta", a, ObjectId::ZERO)])
            .expect("delete");
        assert!(repo.scan_refs("refs/changes/").expect("scan").is_empty());
    }

    #[test]
    fn injected_failures_are_consumed() {
        let repo = MemoryRepository::new("p");
        let a = blob(&repo, b"a");
        repo.inject_lock_failures(1);
        let first = repo
            .update_refs(&[RefUpdate::new("refs/x", ObjectId::ZERO, a)])
            .expect("update");
        assert_eq!(first, vec![RefUpdateOutcome::LockFailure]);
        let second = repo
            .update_refs(&[RefUpdate::new("refs/x", ObjectId::ZERO, a)])
            .expect("update");
        assert_eq!(second, vec![RefUpdateOutcome::Ok]);
    }

    #[test]
    fn manager_open_distinguishes_missing() {
        let manager = MemoryRepoManager::new();
        assert!(manager.open("nope").expect("open").is_none());
        manager.create("p").expect("create");
        assert!(manager.open("p").expect("open").is_some());
    }
}
