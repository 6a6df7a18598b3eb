//! Reading change notes through a per-tip snapshot cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::NotesConfig;
use crate::db::RelationalStore;
use crate::error::NotesError;
use crate::migration::MigrationState;
use crate::model::{AccountId, ChangeId, Comment};
use crate::note::{IdentityCodec, RevisionNoteMap};
use crate::repo::{ObjectId, RepoManager, Repository, refs};
use crate::token::{LiveRefs, StateToken};

use super::parser::parse_change;
use super::state::ChangeNotesState;

const CACHE_CAPACITY: usize = 4096;

/// Brings a change's versioned copy up to date with the relational store.
///
/// Implemented by the rebuilder; the loader only sees this seam.
pub trait RebuildTrigger: Send + Sync {
    /// Rebuild `change` if its refs no longer match its state token.
    /// Returns whether a rebuild happened.
    ///
    /// # Errors
    ///
    /// Whatever the rebuild failed with.
    fn rebuild_if_stale(&self, change: ChangeId) -> Result<bool, NotesError>;
}

struct AutoRebuild {
    store: Arc<dyn RelationalStore>,
    trigger: Arc<dyn RebuildTrigger>,
}

pub struct ChangeNotesLoader {
    repos: Arc<dyn RepoManager>,
    codec: IdentityCodec,
    all_users: String,
    migration: MigrationState,
    auto_rebuild: Option<AutoRebuild>,
    cache: Mutex<HashMap<(ChangeId, ObjectId), Arc<ChangeNotesState>>>,
}

impl ChangeNotesLoader {
    #[must_use]
    pub fn new(repos: Arc<dyn RepoManager>, config: &NotesConfig) -> Self {
        Self {
            repos,
            codec: IdentityCodec::new(&config.identity),
            all_users: config.repos.all_users.clone(),
            migration: config.migration.state,
            auto_rebuild: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild stale changes before reading them. Only takes effect while
    /// the relational store is still primary and `auto_rebuild` is set.
    #[must_use]
    pub fn with_auto_rebuild(
        mut self,
        config: &NotesConfig,
        store: Arc<dyn RelationalStore>,
        trigger: Arc<dyn RebuildTrigger>,
    ) -> Self {
        if config.migration.auto_rebuild {
            self.auto_rebuild = Some(AutoRebuild { store, trigger });
        }
        self
    }

    #[must_use]
    pub const fn codec(&self) -> &IdentityCodec {
        &self.codec
    }

    /// Load the current state of `change` in `project`. A missing project
    /// or meta ref yields the empty state.
    ///
    /// # Errors
    ///
    /// Storage failures, malformed history, or a failed rebuild.
    pub fn load(&self, project: &str, change: ChangeId) -> Result<Arc<ChangeNotesState>, NotesError> {
        let Some(repo) = self
            .repos
            .open(project)
            .map_err(|e| NotesError::storage(project, e))?
        else {
            return Ok(Arc::new(ChangeNotesState::empty(change)));
        };

        self.rebuild_if_stale(change, repo.as_ref())?;

        let meta_ref = refs::change_meta_ref(change);
        let tip = repo
            .read_ref(&meta_ref)
            .map_err(|e| NotesError::storage(&meta_ref, e))?
            .unwrap_or(ObjectId::ZERO);
        self.load_at(repo.as_ref(), change, tip)
    }

    /// Load the state at a specific tip, through the cache.
    ///
    /// # Errors
    ///
    /// Storage failures or malformed history.
    pub fn load_at(
        &self,
        repo: &dyn Repository,
        change: ChangeId,
        tip: ObjectId,
    ) -> Result<Arc<ChangeNotesState>, NotesError> {
        let key = (change, tip);
        if let Some(hit) = self.lock_cache().get(&key) {
            tracing::debug!(change_id = %change, tip = %tip, "change notes cache hit");
            return Ok(Arc::clone(hit));
        }

        let state = Arc::new(parse_change(change, repo, tip, &self.codec)?);
        let mut cache = self.lock_cache();
        if cache.len() >= CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(key, Arc::clone(&state));
        Ok(state)
    }

    /// Draft comments `author` holds on `change`, ordered by revision.
    ///
    /// # Errors
    ///
    /// Storage failures or malformed notes.
    pub fn load_drafts(&self, change: ChangeId, author: AccountId) -> Result<Vec<Comment>, NotesError> {
        let Some(repo) = self
            .repos
            .open(&self.all_users)
            .map_err(|e| NotesError::storage(&self.all_users, e))?
        else {
            return Ok(Vec::new());
        };
        let draft_ref = refs::draft_comments_ref(change, author);
        let Some(tip) = repo
            .read_ref(&draft_ref)
            .map_err(|e| NotesError::storage(&draft_ref, e))?
        else {
            return Ok(Vec::new());
        };
        let commit = repo
            .read_commit(tip)
            .map_err(|e| NotesError::storage(&draft_ref, e))?;
        let mut notes = RevisionNoteMap::load(change, repo.as_ref(), commit.tree)?;
        notes.parse_all(repo.as_ref(), &self.codec)?;
        Ok(notes.comments().cloned().collect())
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<(ChangeId, ObjectId), Arc<ChangeNotesState>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rebuild_if_stale(&self, change: ChangeId, repo: &dyn Repository) -> Result<(), NotesError> {
        let Some(auto) = &self.auto_rebuild else {
            return Ok(());
        };
        if !self.migration.read_changes() || self.migration.versioned_primary() {
            return Ok(());
        }
        let Some(row) = auto.store.change(change)? else {
            return Ok(());
        };
        let token = StateToken::of_change(&row)?;
        let Some(draft_repo) = self
            .repos
            .open(&self.all_users)
            .map_err(|e| NotesError::storage(&self.all_users, e))?
        else {
            return Ok(());
        };
        let live = LiveRefs::read(change, repo, draft_repo.as_ref())?;
        let stale = token.as_ref().is_none_or(|t| !t.is_up_to_date(&live));
        if stale {
            tracing::warn!(change_id = %change, "change notes out of date, rebuilding before read");
            auto.trigger.rebuild_if_stale(change)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::repo::MemoryRepoManager;

    struct CountingTrigger(AtomicUsize);

    impl RebuildTrigger for CountingTrigger {
        fn rebuild_if_stale(&self, _change: ChangeId) -> Result<bool, NotesError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[test]
    fn missing_project_and_ref_load_empty() {
        let repos = Arc::new(MemoryRepoManager::new());
        let loader = ChangeNotesLoader::new(repos.clone(), &NotesConfig::default());
        let change = ChangeId::new(1);
        assert!(!loader.load("nope", change).expect("load").exists());

        repos.create("p").expect("create");
        assert!(!loader.load("p", change).expect("load").exists());
        assert_eq!(loader.cached(), 1);
        assert!(loader.load_drafts(change, AccountId::new(1)).expect("drafts").is_empty());
    }

    #[test]
    fn stale_token_triggers_rebuild_in_read_write() {
        use crate::db::SqliteStore;
        use crate::model::Change;

        let mut config = NotesConfig::default();
        config.migration.state = MigrationState::ReadWrite;
        let repos = Arc::new(MemoryRepoManager::new());
        repos.create("p").expect("create");
        repos.create(&config.repos.all_users).expect("create");

        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let when = chrono::DateTime::from_timestamp(1_700_000_000, 0).expect("ts");
        let mut row = Change::new(ChangeId::new(4), "p", "I4", AccountId::new(1), "main", "s", when);
        row.note_db_state = Some(ObjectId::from_bytes([7; 20]).to_string());
        store.insert_change(&row).expect("insert");

        let trigger = Arc::new(CountingTrigger(AtomicUsize::new(0)));
        let loader = ChangeNotesLoader::new(repos, &config).with_auto_rebuild(&config, store, trigger.clone());
        loader.load("p", ChangeId::new(4)).expect("load");
        assert_eq!(trigger.0.load(Ordering::SeqCst), 1);
    }
}
