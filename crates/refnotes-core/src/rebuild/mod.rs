//! Rebuilding a change's versioned history from its relational rows.
//!
//! Rows are turned into [`event::Event`]s, sorted into one timeline,
//! grouped into commit-sized batches and written from an empty history.
//! Rebuilding is deterministic: replaying the same rows produces the same
//! commits, so rebuilding an up-to-date change moves no ref.

pub mod event;
pub mod window;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::config::NotesConfig;
use crate::db::{ChangeBundle, RelationalStore};
use crate::error::NotesError;
use crate::model::{Change, ChangeId, ChangeStatus, PatchSetId};
use crate::note::footer::{parse_hashtags, parse_patch_set};
use crate::note::{CommitMessage, FooterKey, IdentityCodec};
use crate::notes::RebuildTrigger;
use crate::repo::{CommitWalk, RepoManager, Repository, refs};
use crate::token::{LiveRefs, PrimaryStorage, StateToken};
use crate::update::{BatchUpdateManager, ChangeUpdate, DraftUpdate};

use event::{Event, EventKind, fill_events, infer_status, infer_topic, sort_events};
use window::{Windows, group_events};

const CREATE_CHANGE_SUBJECT: &str = "Create change";
const FINAL_UPDATES_SUBJECT: &str = "Final migration updates";

/// What a rebuild wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildResult {
    pub change: ChangeId,
    /// Token now stored on the row.
    pub note_db_state: Option<String>,
    pub change_commands: usize,
    pub draft_commands: usize,
}

impl RebuildResult {
    /// Whether any ref moved.
    #[must_use]
    pub const fn changed_refs(&self) -> bool {
        self.change_commands + self.draft_commands > 0
    }
}

/// Replayed column values the final fixup compares against the row.
#[derive(Debug, Default)]
struct Replayed {
    topic: Option<String>,
    status: ChangeStatus,
}

pub struct ChangeRebuilder {
    config: NotesConfig,
    repos: Arc<dyn RepoManager>,
    store: Arc<dyn RelationalStore>,
    codec: IdentityCodec,
    windows: Windows,
}

impl ChangeRebuilder {
    #[must_use]
    pub fn new(config: &NotesConfig, repos: Arc<dyn RepoManager>, store: Arc<dyn RelationalStore>) -> Self {
        Self {
            config: config.clone(),
            repos,
            store,
            codec: IdentityCodec::new(&config.identity),
            windows: Windows::from_config(&config.rebuild),
        }
    }

    fn open(&self, name: &str) -> Result<Arc<dyn Repository>, NotesError> {
        self.repos.create(name).map_err(|e| NotesError::storage(name, e))
    }

    /// Rebuild one change and record the new token on its row.
    ///
    /// # Errors
    ///
    /// - [`NotesError::InvalidUpdate`] if the change does not exist or is
    ///   already versioned-primary.
    /// - [`NotesError::ReadOnly`] while a migration lease is held.
    /// - [`NotesError::NoPatchSets`] for a change without patch sets.
    /// - [`NotesError::Concurrency`] if the row's token moved while
    ///   rebuilding, or a ref moved before the batch executed.
    pub fn rebuild(&self, change: ChangeId) -> Result<RebuildResult, NotesError> {
        self.rebuild_inner(change, true)
    }

    /// As [`Self::rebuild`], for the holder of the change's read-only lease.
    /// The lease is carried over into the new token.
    ///
    /// # Errors
    ///
    /// As [`Self::rebuild`], minus the lease check.
    pub fn rebuild_even_if_read_only(&self, change: ChangeId) -> Result<RebuildResult, NotesError> {
        self.rebuild_inner(change, false)
    }

    fn rebuild_inner(&self, change: ChangeId, honor_lease: bool) -> Result<RebuildResult, NotesError> {
        let start = Instant::now();
        let skew = self.config.lease.read_only_skew();
        let bundle = self
            .store
            .bundle(change)?
            .ok_or_else(|| NotesError::InvalidUpdate(format!("change {change} does not exist")))?;
        let old_state = bundle.change.note_db_state.clone();
        if StateToken::of_change(&bundle.change)?.is_some_and(|t| t.primary() == PrimaryStorage::Versioned) {
            return Err(NotesError::InvalidUpdate(format!(
                "change {change} is versioned-primary and cannot be rebuilt"
            )));
        }

        let change_repo = self.open(&bundle.change.project)?;
        let draft_repo = self.open(&self.config.repos.all_users)?;
        let mut manager =
            BatchUpdateManager::new(&self.config, change_repo.clone(), draft_repo.clone()).ignoring_read_only();
        self.build_updates(&mut manager, &bundle, change_repo.as_ref())?;

        let mut staged_row = bundle.change.clone();
        manager.stage_and_apply_delta(&mut staged_row)?;
        let new_state = staged_row.note_db_state;

        let mut finished_elsewhere = false;
        let updated = self.store.atomic_update(change, &mut |row| {
            if honor_lease {
                if let Some(token) = StateToken::of_change(row)? {
                    token.check_not_read_only(change, Utc::now(), skew)?;
                }
            }
            if row.note_db_state == new_state {
                finished_elsewhere = true;
                return Ok(false);
            }
            if row.note_db_state != old_state {
                return Err(NotesError::concurrency(
                    refs::change_meta_ref(change),
                    format!(
                        "state moved from {:?} to {:?} during rebuild",
                        old_state, row.note_db_state
                    ),
                ));
            }
            row.note_db_state.clone_from(&new_state);
            Ok(true)
        })?;
        if updated.is_none() {
            return Err(NotesError::InvalidUpdate(format!("change {change} was deleted during rebuild")));
        }

        if finished_elsewhere {
            let live = LiveRefs::read(change, change_repo.as_ref(), draft_repo.as_ref())?;
            if StateToken::parse(change, new_state.as_deref())?.is_some_and(|t| t.is_up_to_date(&live)) {
                tracing::debug!(change_id = %change, "change already rebuilt");
                return Ok(RebuildResult {
                    change,
                    note_db_state: new_state,
                    change_commands: 0,
                    draft_commands: 0,
                });
            }
        }

        let staged = manager.execute()?;
        tracing::info!(
            change_id = %change,
            change_commands = staged.change_commands.len(),
            draft_commands = staged.draft_commands.len(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "rebuilt change"
        );
        Ok(RebuildResult {
            change,
            note_db_state: new_state,
            change_commands: staged.change_commands.len(),
            draft_commands: staged.draft_commands.len(),
        })
    }

    /// Whether the change's refs no longer match its stored token. Changes
    /// that are versioned-primary or missing are never stale.
    ///
    /// # Errors
    ///
    /// Relational or storage failures, or a malformed token.
    pub fn is_stale(&self, change: ChangeId) -> Result<bool, NotesError> {
        let Some(row) = self.store.change(change)? else {
            return Ok(false);
        };
        let token = StateToken::of_change(&row)?;
        if token.as_ref().is_some_and(|t| t.primary() == PrimaryStorage::Versioned) {
            return Ok(false);
        }
        let Some(token) = token else {
            return Ok(true);
        };
        let Some(change_repo) = self
            .repos
            .open(&row.project)
            .map_err(|e| NotesError::storage(&row.project, e))?
        else {
            return Ok(true);
        };
        let draft_repo = self.open(&self.config.repos.all_users)?;
        let live = LiveRefs::read(change, change_repo.as_ref(), draft_repo.as_ref())?;
        Ok(!token.is_up_to_date(&live))
    }

    /// Queue the updates that recreate `bundle` from scratch.
    ///
    /// Hashtags have no relational rows; their history is read back from the
    /// existing meta ref before it is replaced.
    ///
    /// # Errors
    ///
    /// [`NotesError::NoPatchSets`], or failures reading the old history.
    pub fn build_updates(
        &self,
        manager: &mut BatchUpdateManager,
        bundle: &ChangeBundle,
        change_repo: &dyn Repository,
    ) -> Result<(), NotesError> {
        let change = &bundle.change;
        let id = change.id;
        let current = change
            .current_patch_set
            .or_else(|| bundle.patch_sets.iter().map(|ps| ps.id).max())
            .ok_or(NotesError::NoPatchSets(id))?;
        let hashtags = self.recover_hashtags(change, change_repo)?;
        manager.reset_change(id);

        let created = change.created_on;
        let mut events = Vec::new();
        let mut patch_sets: BTreeSet<PatchSetId> = BTreeSet::new();
        for ps in bundle.patch_sets.iter().filter(|ps| ps.id <= current) {
            patch_sets.insert(ps.id);
            events.push(Event::new(
                EventKind::PatchSet {
                    patch_set: ps.clone(),
                    create_change: false,
                },
                Some(ps.uploader),
                ps.created_on,
                Some(ps.id),
                created,
            ));
        }
        let Some(min_patch_set) = patch_sets.first().copied() else {
            return Err(NotesError::NoPatchSets(id));
        };

        for comment in bundle.published_comments() {
            if patch_sets.contains(&comment.key.patch_set) {
                events.push(Event::new(
                    EventKind::Comment(comment.clone()),
                    Some(comment.author),
                    comment.written_on,
                    Some(comment.key.patch_set),
                    created,
                ));
            }
        }
        for approval in bundle.approvals.iter().filter(|a| patch_sets.contains(&a.patch_set)) {
            events.push(
                Event::new(
                    EventKind::Approval(approval.clone()),
                    Some(approval.account),
                    approval.granted,
                    Some(approval.patch_set),
                    created,
                )
                .with_tag(approval.tag.clone()),
            );
        }
        for reviewer in &bundle.reviewers {
            events.push(Event::new(
                EventKind::Reviewer {
                    account: reviewer.account,
                    state: reviewer.state,
                },
                Some(reviewer.account),
                reviewer.updated,
                None,
                created,
            ));
        }
        for message in &bundle.messages {
            if message.patch_set.is_some_and(|ps| !patch_sets.contains(&ps)) {
                continue;
            }
            let event = |kind| {
                Event::new(kind, message.author, message.written_on, message.patch_set, created)
                    .with_real_user(message.real_author)
                    .with_tag(message.tag.clone())
            };
            events.push(event(EventKind::Message(message.clone())));
            if let Some(status) = infer_status(&message.message) {
                events.push(event(EventKind::Status(status)));
            }
        }
        events.extend(
            hashtags
                .into_iter()
                .filter(|e| e.patch_set.is_some_and(|ps| patch_sets.contains(&ps))),
        );
        events.push(Event::new(
            EventKind::FinalUpdates,
            Some(change.owner),
            change.last_updated_on,
            Some(current),
            created,
        ));

        sort_events(&mut events);
        fill_events(&mut events, change, min_patch_set);

        let mut replayed = Replayed::default();
        for group in group_events(events, self.windows) {
            if let Some(update) = Self::flush(change, group, min_patch_set, &mut replayed) {
                manager.add_change_update(update);
            }
        }

        for (author, drafts) in bundle.drafts_by_author() {
            let mut events: Vec<Event> = drafts
                .into_iter()
                .filter(|c| patch_sets.contains(&c.key.patch_set))
                .map(|c| {
                    Event::new(
                        EventKind::Draft(c.clone()),
                        Some(author),
                        c.written_on,
                        Some(c.key.patch_set),
                        created,
                    )
                })
                .collect();
            events.sort_by(Event::timeline_cmp);
            for group in group_events(events, self.windows) {
                let when = group.last().map_or(created, |e| e.when);
                let mut update = DraftUpdate::new(id, author, when);
                for event in group {
                    if let EventKind::Draft(comment) = event.kind {
                        update.put_comment(comment);
                    }
                }
                manager.add_draft_update(update);
            }
        }
        Ok(())
    }

    /// Hashtag changes recorded on the existing meta ref, oldest first.
    ///
    /// Commits whose message, patch set or author cannot be read carry no
    /// usable hashtags and are skipped, so a damaged ref can still be
    /// replaced. A commit that cannot be loaded at all is an error.
    fn recover_hashtags(&self, change: &Change, repo: &dyn Repository) -> Result<Vec<Event>, NotesError> {
        let meta_ref = refs::change_meta_ref(change.id);
        let Some(tip) = repo.read_ref(&meta_ref).map_err(|e| NotesError::storage(&meta_ref, e))? else {
            return Ok(Vec::new());
        };
        let mut events = Vec::new();
        for step in CommitWalk::new(repo, tip) {
            let (id, commit) = step.map_err(|e| NotesError::storage(&meta_ref, e))?;
            let message = match CommitMessage::parse(change.id, &commit.message) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(change_id = %change.id, commit = %id, error = %err, "skipping unparseable commit");
                    continue;
                }
            };
            let mut tags = message.values(FooterKey::Hashtags);
            let (Some(tags), None) = (tags.next(), tags.next()) else {
                continue;
            };
            let mut patch_sets = message.values(FooterKey::PatchSet);
            let patch_set = match (patch_sets.next(), patch_sets.next()) {
                (Some(value), None) => parse_patch_set(change.id, value).ok().map(|(ps, _)| ps),
                _ => None,
            };
            let Some(patch_set) = patch_set else {
                tracing::warn!(change_id = %change.id, commit = %id, "skipping hashtags without a readable patch set");
                continue;
            };
            let Some(user) = self.codec.parse_ident(&commit.author) else {
                tracing::warn!(change_id = %change.id, commit = %id, "skipping hashtags from an unknown author");
                continue;
            };
            events.push(Event::new(
                EventKind::Hashtags(parse_hashtags(tags)),
                Some(user),
                commit.committer.when,
                Some(patch_set),
                change.created_on,
            ));
        }
        events.reverse();
        Ok(events)
    }

    fn flush(
        change: &Change,
        group: Vec<Event>,
        min_patch_set: PatchSetId,
        replayed: &mut Replayed,
    ) -> Option<ChangeUpdate> {
        let (first, last) = (group.first()?, group.last()?);
        let mut update = ChangeUpdate::new(
            change.id,
            first.patch_set.unwrap_or(min_patch_set),
            first.user,
            last.when,
        );
        if let Some(real) = first.real_user.filter(|r| Some(*r) != first.user) {
            update.set_real_user(real);
        }
        if let Some(tag) = &first.tag {
            update.set_tag(tag.clone());
        }
        for event in group {
            Self::apply(change, event.kind, &mut update, replayed);
        }
        (!update.is_empty()).then_some(update)
    }

    fn apply(change: &Change, kind: EventKind, update: &mut ChangeUpdate, replayed: &mut Replayed) {
        match kind {
            EventKind::CreateChange => Self::create_change(change, update),
            EventKind::PatchSet {
                patch_set,
                create_change,
            } => {
                if create_change {
                    Self::create_change(change, update);
                } else {
                    update.set_subject(change.subject.clone());
                    update.set_commit_subject(format!("Create patch set {}", patch_set.id));
                }
                update.set_commit(patch_set.revision);
                if !patch_set.groups.is_empty() {
                    update.set_groups(patch_set.groups);
                }
                if let Some(cert) = patch_set.push_certificate {
                    update.set_push_certificate(patch_set.revision, cert);
                }
                if let Some(description) = patch_set.description {
                    update.set_patch_set_description(description);
                }
            }
            EventKind::Approval(approval) => {
                update.put_approval_for(approval.account, approval.label, approval.value);
            }
            EventKind::Reviewer { account, state } => update.put_reviewer(account, state),
            EventKind::Comment(comment) => update.put_comment(comment),
            EventKind::Draft(_) => {}
            EventKind::Message(message) => {
                if let Some(topic) = infer_topic(&message.message) {
                    update.set_topic(topic.as_deref());
                    replayed.topic = topic;
                }
                update.set_change_message(message.message);
            }
            EventKind::Status(status) => {
                update.set_status(status);
                replayed.status = status;
            }
            EventKind::Hashtags(tags) => update.set_hashtags(tags),
            EventKind::FinalUpdates => {
                if change.topic != replayed.topic {
                    update.set_topic(change.topic.as_deref());
                }
                if change.status != replayed.status {
                    update.set_status(change.status);
                }
                if let Some(submission_id) = &change.submission_id {
                    if change.status == ChangeStatus::Merged {
                        update.set_submission_id(submission_id.clone());
                    }
                }
                if change.assignee.is_some() {
                    update.set_assignee(change.assignee);
                }
                if change.is_private {
                    update.set_private(true);
                }
                if change.work_in_progress {
                    update.set_work_in_progress(true);
                }
                if !update.is_empty() {
                    update.set_commit_subject(FINAL_UPDATES_SUBJECT);
                }
            }
        }
    }

    fn create_change(change: &Change, update: &mut ChangeUpdate) {
        update.set_commit_subject(CREATE_CHANGE_SUBJECT);
        update.set_change_key(change.change_key.clone());
        update.set_branch(change.dest_branch());
        update.set_subject(change.original_subject.clone());
    }
}

impl RebuildTrigger for ChangeRebuilder {
    fn rebuild_if_stale(&self, change: ChangeId) -> Result<bool, NotesError> {
        if !self.is_stale(change)? {
            return Ok(false);
        }
        self.rebuild(change)?;
        Ok(true)
    }
}
