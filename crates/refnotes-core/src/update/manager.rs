//! Batching updates across the change repository and the draft repository.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::NotesConfig;
use crate::error::NotesError;
use crate::model::{AccountId, Change, ChangeId};
use crate::note::IdentityCodec;
use crate::repo::{ObjectId, ObjectInserter, RefUpdate, Repository, refs};
use crate::token::{LiveRefs, StateToken, TokenDelta, apply_delta};

use super::{ApplyOutcome, ChangeUpdate, DeleteCommentRewriter, DraftUpdate, RefUpdater};

/// Ref commands a batch will run, and the token deltas they imply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedBatch {
    pub change_commands: Vec<RefUpdate>,
    pub draft_commands: Vec<RefUpdate>,
    pub deltas: BTreeMap<ChangeId, TokenDelta>,
}

impl StagedBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.change_commands.is_empty() && self.draft_commands.is_empty()
    }
}

type Chain = Vec<Box<dyn RefUpdater>>;

struct RepoBatch {
    repo: Arc<dyn Repository>,
    inserter: ObjectInserter,
    chains: BTreeMap<String, Chain>,
}

impl RepoBatch {
    fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            inserter: ObjectInserter::new(),
            chains: BTreeMap::new(),
        }
    }

    fn live(&self, ref_name: &str) -> Result<ObjectId, NotesError> {
        Ok(self
            .repo
            .read_ref(ref_name)
            .map_err(|e| NotesError::storage(ref_name, e))?
            .unwrap_or(ObjectId::ZERO))
    }

    /// Run every chain not belonging to a deleted change, threading tips.
    /// Chains of a reset change start from an empty ref.
    fn stage(
        &mut self,
        codec: &IdentityCodec,
        deleted: &BTreeSet<ChangeId>,
        reset: &BTreeSet<ChangeId>,
    ) -> Result<Vec<RefUpdate>, NotesError> {
        let mut commands = Vec::new();
        for (ref_name, chain) in &self.chains {
            let Some(first) = chain.first() else {
                continue;
            };
            if deleted.contains(&first.change()) {
                continue;
            }
            if chain.len() > 1 && chain.iter().any(|u| u.is_rewrite()) {
                return Err(NotesError::InvalidUpdate(format!(
                    "history rewrite of {ref_name} cannot be combined with other updates"
                )));
            }
            let old = self.live(ref_name)?;
            let from_scratch = reset.contains(&first.change());
            if old.is_zero() && !from_scratch && !first.allows_create() {
                return Err(NotesError::InvalidUpdate(format!("{ref_name} does not exist")));
            }

            let mut tip = if from_scratch { ObjectId::ZERO } else { old };
            for update in chain {
                match update.apply(self.repo.as_ref(), &mut self.inserter, codec, tip)? {
                    ApplyOutcome::Unchanged => {}
                    ApplyOutcome::Commit(id) => tip = id,
                    ApplyOutcome::DeleteRef => tip = ObjectId::ZERO,
                }
            }
            if tip != old {
                commands.push(RefUpdate::new(ref_name.clone(), old, tip));
            }
        }
        Ok(commands)
    }

    /// Run `commands` in one transaction after flushing buffered objects.
    fn execute(&mut self, commands: &[RefUpdate]) -> Result<(), NotesError> {
        if commands.is_empty() {
            return Ok(());
        }
        let repo = self.repo.name().to_string();
        self.inserter
            .flush(self.repo.as_ref())
            .map_err(|e| NotesError::storage(&repo, e))?;
        let outcomes = self
            .repo
            .update_refs(commands)
            .map_err(|e| NotesError::storage(&repo, e))?;
        if let Some((cmd, outcome)) = commands.iter().zip(&outcomes).find(|(_, o)| !o.is_ok()) {
            return Err(NotesError::concurrency(&cmd.name, outcome.to_string()));
        }
        Ok(())
    }
}

/// Collects update builders and applies them as two atomic ref
/// transactions: the change repository first, then the draft repository.
pub struct BatchUpdateManager {
    codec: IdentityCodec,
    read_only_skew: Duration,
    writes_disabled: bool,
    ignore_read_only: bool,
    changes: RepoBatch,
    drafts: RepoBatch,
    expected: BTreeMap<ChangeId, StateToken>,
    deleted: BTreeSet<ChangeId>,
    reset: BTreeSet<ChangeId>,
    staged: Option<StagedBatch>,
}

impl BatchUpdateManager {
    #[must_use]
    pub fn new(
        config: &NotesConfig,
        change_repo: Arc<dyn Repository>,
        draft_repo: Arc<dyn Repository>,
    ) -> Self {
        Self {
            codec: IdentityCodec::new(&config.identity),
            read_only_skew: config.lease.read_only_skew(),
            writes_disabled: config.migration.disable_change_writes,
            ignore_read_only: false,
            changes: RepoBatch::new(change_repo),
            drafts: RepoBatch::new(draft_repo),
            expected: BTreeMap::new(),
            deleted: BTreeSet::new(),
            reset: BTreeSet::new(),
            staged: None,
        }
    }

    /// Write through read-only leases and the global write switch. Used by
    /// the rebuilder and the primary storage migrator, which hold the lease.
    #[must_use]
    pub const fn ignoring_read_only(mut self) -> Self {
        self.ignore_read_only = true;
        self
    }

    /// Queue a change update. Comments it publishes are removed from their
    /// authors' drafts in the same batch.
    pub fn add_change_update(&mut self, update: ChangeUpdate) {
        let mut draft_deletes: BTreeMap<AccountId, DraftUpdate> = BTreeMap::new();
        for comment in update.published_comments() {
            draft_deletes
                .entry(comment.author)
                .or_insert_with(|| DraftUpdate::new(update.change(), comment.author, update.when()))
                .delete_comment(comment.key.clone());
        }
        self.queue_change(Box::new(update));
        for draft in draft_deletes.into_values() {
            self.add_draft_update(draft);
        }
    }

    pub fn add_draft_update(&mut self, update: DraftUpdate) {
        self.invalidate();
        self.drafts
            .chains
            .entry(update.ref_name())
            .or_default()
            .push(Box::new(update));
    }

    pub fn add_rewrite(&mut self, rewriter: DeleteCommentRewriter) {
        self.queue_change(Box::new(rewriter));
    }

    /// Remove the change's meta ref and every draft ref on it.
    pub fn delete_change(&mut self, change: ChangeId) {
        self.invalidate();
        self.deleted.insert(change);
    }

    /// Replace the change's refs wholesale: its queued updates build on an
    /// empty history, and any of its refs with nothing queued are deleted.
    /// Ref commands still compare against the live tips, so rebuilding to
    /// identical commits moves nothing.
    pub fn reset_change(&mut self, change: ChangeId) {
        self.invalidate();
        self.reset.insert(change);
    }

    /// Require the change's refs to still match the token stored on `row`
    /// when the batch is staged.
    ///
    /// # Errors
    ///
    /// The stored token is malformed.
    pub fn expect_token(&mut self, row: &Change) -> Result<(), NotesError> {
        self.invalidate();
        if let Some(token) = StateToken::of_change(row)? {
            self.expected.insert(row.id, token);
        }
        Ok(())
    }

    fn queue_change(&mut self, update: Box<dyn RefUpdater>) {
        self.invalidate();
        self.changes.chains.entry(update.ref_name()).or_default().push(update);
    }

    fn invalidate(&mut self) {
        if self.staged.take().is_some() {
            self.changes.inserter = ObjectInserter::new();
            self.drafts.inserter = ObjectInserter::new();
        }
    }

    fn check_expected(&self) -> Result<(), NotesError> {
        let now = Utc::now();
        for (change, token) in &self.expected {
            if !self.ignore_read_only {
                token.check_not_read_only(*change, now, self.read_only_skew)?;
            }
            let live = LiveRefs::read(*change, self.changes.repo.as_ref(), self.drafts.repo.as_ref())?;
            if !token.is_up_to_date(&live) {
                return Err(NotesError::concurrency(
                    refs::change_meta_ref(*change),
                    format!("expected state {token}, found {}", live.change_meta),
                ));
            }
        }
        Ok(())
    }

    fn live_drafts(&self, change: ChangeId) -> Result<BTreeMap<String, ObjectId>, NotesError> {
        let prefix = refs::draft_comments_prefix(change);
        self.drafts
            .repo
            .scan_refs(&prefix)
            .map_err(|e| NotesError::storage(&prefix, e))
    }

    /// Deletes for removed changes, and for refs of reset changes that no
    /// queued update writes.
    fn deletion_commands(&self) -> Result<(Vec<RefUpdate>, Vec<RefUpdate>), NotesError> {
        let mut change_commands = Vec::new();
        let mut draft_commands = Vec::new();
        let doomed = self.deleted.iter().map(|c| (*c, true));
        let reset = self
            .reset
            .iter()
            .filter(|c| !self.deleted.contains(c))
            .map(|c| (*c, false));
        for (change, deleted) in doomed.chain(reset) {
            let meta_ref = refs::change_meta_ref(change);
            let old = self.changes.live(&meta_ref)?;
            if !old.is_zero() && (deleted || !self.changes.chains.contains_key(&meta_ref)) {
                change_commands.push(RefUpdate::new(meta_ref, old, ObjectId::ZERO));
            }
            for (name, old) in self.live_drafts(change)? {
                if deleted || !self.drafts.chains.contains_key(&name) {
                    draft_commands.push(RefUpdate::new(name, old, ObjectId::ZERO));
                }
            }
        }
        Ok((change_commands, draft_commands))
    }

    /// Full token deltas for reset changes: every ref's final tip, staged or
    /// untouched, with old draft entries dropped.
    fn reset_delta(
        &self,
        change: ChangeId,
        change_commands: &[RefUpdate],
        draft_commands: &[RefUpdate],
    ) -> Result<TokenDelta, NotesError> {
        let final_tip = |commands: &[RefUpdate], name: &str, live: ObjectId| {
            commands
                .iter()
                .find(|cmd| cmd.name == name)
                .map_or(live, |cmd| cmd.new)
        };
        let meta_ref = refs::change_meta_ref(change);
        let meta = final_tip(change_commands, &meta_ref, self.changes.live(&meta_ref)?);

        let mut delta = TokenDelta {
            new_change_meta: Some(meta),
            replace_drafts: true,
            ..TokenDelta::default()
        };
        let queued = self
            .drafts
            .chains
            .keys()
            .filter(|name| refs::parse_draft_comments_ref(name).is_some_and(|(c, _)| c == change));
        for name in queued {
            let Some((_, account)) = refs::parse_draft_comments_ref(name) else {
                continue;
            };
            let tip = final_tip(draft_commands, name, self.drafts.live(name)?);
            if !tip.is_zero() {
                delta.new_drafts.insert(account, tip);
            }
        }
        Ok(delta)
    }

    /// Compute every ref command without writing anything. Repeated calls
    /// return the same result until another update is queued.
    ///
    /// # Errors
    ///
    /// - [`NotesError::WritesDisabled`] or [`NotesError::ReadOnly`] when
    ///   writes are blocked.
    /// - [`NotesError::Concurrency`] when an expected token is stale.
    /// - [`NotesError::InvalidUpdate`] for a chain that cannot apply.
    pub fn stage(&mut self) -> Result<&StagedBatch, NotesError> {
        if self.staged.is_none() {
            let staged = self.stage_fresh()?;
            tracing::debug!(
                change_commands = staged.change_commands.len(),
                draft_commands = staged.draft_commands.len(),
                "staged batch update"
            );
            self.staged = Some(staged);
        }
        match &self.staged {
            Some(staged) => Ok(staged),
            None => Err(NotesError::InvalidUpdate("batch was not staged".to_string())),
        }
    }

    fn stage_fresh(&mut self) -> Result<StagedBatch, NotesError> {
        if self.writes_disabled && !self.ignore_read_only {
            return Err(NotesError::WritesDisabled);
        }
        self.check_expected()?;

        let (mut change_commands, mut draft_commands) = self.deletion_commands()?;
        change_commands.extend(self.changes.stage(&self.codec, &self.deleted, &self.reset)?);
        draft_commands.extend(self.drafts.stage(&self.codec, &self.deleted, &self.reset)?);

        let mut deltas: BTreeMap<ChangeId, TokenDelta> = BTreeMap::new();
        for cmd in &change_commands {
            if let Some(change) = refs::parse_change_meta_ref(&cmd.name) {
                deltas.entry(change).or_default().new_change_meta = Some(cmd.new);
            }
        }
        for cmd in &draft_commands {
            if let Some((change, account)) = refs::parse_draft_comments_ref(&cmd.name) {
                deltas.entry(change).or_default().new_drafts.insert(account, cmd.new);
            }
        }
        for change in self.reset.difference(&self.deleted) {
            let delta = self.reset_delta(*change, &change_commands, &draft_commands)?;
            deltas.insert(*change, delta);
        }
        Ok(StagedBatch {
            change_commands,
            draft_commands,
            deltas,
        })
    }

    /// Stage, then fold the resulting tips into `row`'s token in memory.
    /// The caller persists the row in its own relational transaction.
    ///
    /// # Errors
    ///
    /// As [`Self::stage`], or a malformed stored token.
    pub fn stage_and_apply_delta(&mut self, row: &mut Change) -> Result<Option<StateToken>, NotesError> {
        let delta = self.stage()?.deltas.get(&row.id).cloned().unwrap_or_default();
        apply_delta(row, &delta)
    }

    /// Stage if needed, flush objects, and run the change repository
    /// transaction followed by the draft repository transaction.
    ///
    /// # Errors
    ///
    /// - As [`Self::stage`].
    /// - [`NotesError::Concurrency`] when a ref moved since staging.
    /// - [`NotesError::Inconsistent`] when the draft transaction fails after
    ///   the change transaction committed.
    pub fn execute(mut self) -> Result<StagedBatch, NotesError> {
        self.stage()?;
        let Some(staged) = self.staged.take() else {
            return Ok(StagedBatch::default());
        };

        self.changes.execute(&staged.change_commands)?;
        if let Err(err) = self.drafts.execute(&staged.draft_commands) {
            if staged.change_commands.is_empty() {
                return Err(err);
            }
            let ref_name = staged
                .draft_commands
                .first()
                .map_or_else(String::new, |cmd| cmd.name.clone());
            tracing::error!(
                ref_name = %ref_name,
                error = %err,
                "draft refs failed after change refs committed"
            );
            return Err(NotesError::Inconsistent {
                ref_name,
                detail: err.to_string(),
            });
        }
        tracing::debug!(
            change_commands = staged.change_commands.len(),
            draft_commands = staged.draft_commands.len(),
            "executed batch update"
        );
        Ok(staged)
    }
}
