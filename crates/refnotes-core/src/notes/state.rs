use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::model::{
    AccountId, Change, ChangeId, ChangeMessage, ChangeStatus, Comment, PatchSet, PatchSetApproval,
    PatchSetId, ReviewerSet, SubmitRecord,
};
use crate::repo::ObjectId;

/// Scalar attributes of a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeColumns {
    pub change_key: String,
    pub owner: AccountId,
    pub branch: String,
    pub subject: String,
    pub original_subject: String,
    pub topic: Option<String>,
    pub status: ChangeStatus,
    pub created_on: DateTime<Utc>,
    pub last_updated_on: DateTime<Utc>,
    pub current_patch_set: Option<PatchSetId>,
    pub submission_id: Option<String>,
    pub assignee: Option<AccountId>,
    pub is_private: bool,
    pub work_in_progress: bool,
}

/// Everything stored for one change at one meta ref tip.
///
/// Built once per `(change, tip)` and shared read-only afterwards. When the
/// meta ref does not exist, `columns` is `None` and every collection is
/// empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotesState {
    pub change: ChangeId,
    /// Tip the state was read from; zero when the ref is absent.
    pub meta_id: ObjectId,
    pub columns: Option<ChangeColumns>,
    pub patch_sets: BTreeMap<PatchSetId, PatchSet>,
    /// Keyed by (patch set, voter, label).
    pub approvals: BTreeMap<(PatchSetId, AccountId, String), PatchSetApproval>,
    /// Oldest first.
    pub messages: Vec<ChangeMessage>,
    /// Published comments by revision.
    pub comments: BTreeMap<ObjectId, Vec<Comment>>,
    pub reviewers: ReviewerSet,
    /// Everyone ever added as reviewer or CC, in the order first added.
    pub all_past_reviewers: Vec<AccountId>,
    pub hashtags: BTreeSet<String>,
    pub submit_records: Vec<SubmitRecord>,
    pub read_only_until: Option<DateTime<Utc>>,
}

impl ChangeNotesState {
    #[must_use]
    pub const fn empty(change: ChangeId) -> Self {
        Self {
            change,
            meta_id: ObjectId::ZERO,
            columns: None,
            patch_sets: BTreeMap::new(),
            approvals: BTreeMap::new(),
            messages: Vec::new(),
            comments: BTreeMap::new(),
            reviewers: ReviewerSet::new(),
            all_past_reviewers: Vec::new(),
            hashtags: BTreeSet::new(),
            submit_records: Vec::new(),
            read_only_until: None,
        }
    }

    #[must_use]
    pub const fn exists(&self) -> bool {
        self.columns.is_some()
    }

    /// Current patch set, if any patch set survives.
    #[must_use]
    pub fn current_patch_set(&self) -> Option<&PatchSet> {
        let id = self.columns.as_ref()?.current_patch_set?;
        self.patch_sets.get(&id)
    }

    pub fn approvals_for(&self, patch_set: PatchSetId) -> impl Iterator<Item = &PatchSetApproval> {
        self.approvals
            .values()
            .filter(move |approval| approval.patch_set == patch_set)
    }

    /// Messages grouped by the patch set they were posted on.
    #[must_use]
    pub fn messages_by_patch_set(&self) -> BTreeMap<PatchSetId, Vec<&ChangeMessage>> {
        let mut out: BTreeMap<PatchSetId, Vec<&ChangeMessage>> = BTreeMap::new();
        for message in &self.messages {
            if let Some(ps) = message.patch_set {
                out.entry(ps).or_default().push(message);
            }
        }
        out
    }

    pub fn published_comments(&self) -> impl Iterator<Item = &Comment> {
        self.comments.values().flatten()
    }

    /// The relational row this state corresponds to. `None` when the change
    /// does not exist.
    #[must_use]
    pub fn to_change(&self, project: &str) -> Option<Change> {
        let c = self.columns.as_ref()?;
        let mut change = Change::new(
            self.change,
            project,
            &c.change_key,
            c.owner,
            &c.branch,
            &c.subject,
            c.created_on,
        );
        change.original_subject.clone_from(&c.original_subject);
        change.topic.clone_from(&c.topic);
        change.status = c.status;
        change.last_updated_on = c.last_updated_on;
        change.current_patch_set = c.current_patch_set;
        change.submission_id.clone_from(&c.submission_id);
        change.assignee = c.assignee;
        change.is_private = c.is_private;
        change.work_in_progress = c.work_in_progress;
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_has_no_columns_and_empty_collections() {
        let state = ChangeNotesState::empty(ChangeId::new(1));
        assert!(!state.exists());
        assert!(state.meta_id.is_zero());
        assert!(state.patch_sets.is_empty());
        assert!(state.reviewers.is_empty());
        assert!(state.current_patch_set().is_none());
        assert!(state.to_change("p").is_none());
    }

    #[test]
    fn to_change_copies_columns() {
        let when = DateTime::from_timestamp(1_700_000_000, 0).expect("ts");
        let mut state = ChangeNotesState::empty(ChangeId::new(9));
        state.columns = Some(ChangeColumns {
            change_key: "Iabc".to_string(),
            owner: AccountId::new(3),
            branch: "refs/heads/main".to_string(),
            subject: "new".to_string(),
            original_subject: "old".to_string(),
            topic: Some("t".to_string()),
            status: ChangeStatus::Merged,
            created_on: when,
            last_updated_on: when,
            current_patch_set: Some(PatchSetId::new(2)),
            submission_id: None,
            assignee: None,
            is_private: true,
            work_in_progress: false,
        });
        let change = state.to_change("proj").expect("exists");
        assert_eq!(change.original_subject, "old");
        assert_eq!(change.subject, "new");
        assert_eq!(change.status, ChangeStatus::Merged);
        assert!(change.is_private);
        assert_eq!(change.project, "proj");
    }
}
