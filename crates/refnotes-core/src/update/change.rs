use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::NotesError;
use crate::model::{
    AccountId, ChangeId, ChangeStatus, Comment, CommentKey, PatchSetId, PatchSetState,
    ReviewerState, SubmitRecord,
};
use crate::note::{IdentityCodec, RevisionNoteMap};
use crate::repo::{CommitData, ObjectId, ObjectInserter, Repository, Tree, refs};

use super::{ApplyOutcome, DeltaOp, PendingDelta, RefUpdater, apply_note_edits, read_parent};

/// Mutations to one change, written as a single commit on its meta ref.
///
/// `author` is `None` for updates made by the server itself; such commits
/// carry the server identity as both author and committer.
#[derive(Debug, Clone)]
pub struct ChangeUpdate {
    change: ChangeId,
    patch_set: PatchSetId,
    author: Option<AccountId>,
    when: DateTime<Utc>,
    delta: PendingDelta,
}

impl ChangeUpdate {
    #[must_use]
    pub fn new(change: ChangeId, patch_set: PatchSetId, author: Option<AccountId>, when: DateTime<Utc>) -> Self {
        Self {
            change,
            patch_set,
            author,
            when,
            delta: PendingDelta::new(),
        }
    }

    #[must_use]
    pub const fn patch_set(&self) -> PatchSetId {
        self.patch_set
    }

    #[must_use]
    pub const fn author(&self) -> Option<AccountId> {
        self.author
    }

    #[must_use]
    pub const fn when(&self) -> DateTime<Utc> {
        self.when
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delta.is_empty()
    }

    #[must_use]
    pub const fn delta(&self) -> &PendingDelta {
        &self.delta
    }

    pub fn push(&mut self, op: DeltaOp) {
        self.delta.push(op);
    }

    pub fn set_commit_subject(&mut self, subject: impl Into<String>) {
        self.delta.set_subject(subject);
    }

    pub fn set_change_key(&mut self, key: impl Into<String>) {
        self.push(DeltaOp::ChangeKey(key.into()));
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.push(DeltaOp::Branch(branch.into()));
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.push(DeltaOp::Subject(subject.into()));
    }

    pub fn set_status(&mut self, status: ChangeStatus) {
        self.push(DeltaOp::Status(status));
    }

    pub fn set_topic(&mut self, topic: Option<&str>) {
        self.push(DeltaOp::Topic(topic.map(ToString::to_string)));
    }

    /// Create the update's patch set pointing at `revision`.
    pub fn set_commit(&mut self, revision: ObjectId) {
        self.push(DeltaOp::Commit(revision));
    }

    pub fn set_groups(&mut self, groups: Vec<String>) {
        self.push(DeltaOp::Groups(groups));
    }

    pub fn set_hashtags(&mut self, hashtags: BTreeSet<String>) {
        self.push(DeltaOp::Hashtags(hashtags));
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.push(DeltaOp::Tag(tag.into()));
    }

    pub fn set_submission_id(&mut self, id: impl Into<String>) {
        self.push(DeltaOp::SubmissionId(id.into()));
    }

    pub fn set_submit_records(&mut self, records: Vec<SubmitRecord>) {
        self.push(DeltaOp::SubmitRecords(records));
    }

    pub fn set_assignee(&mut self, assignee: Option<AccountId>) {
        self.push(DeltaOp::Assignee(assignee));
    }

    pub fn set_private(&mut self, private: bool) {
        self.push(DeltaOp::Private(private));
    }

    pub fn set_work_in_progress(&mut self, wip: bool) {
        self.push(DeltaOp::WorkInProgress(wip));
    }

    pub fn set_read_only_until(&mut self, until: DateTime<Utc>) {
        self.push(DeltaOp::ReadOnlyUntil(until));
    }

    /// Record the account that acted when `author` is impersonated.
    pub fn set_real_user(&mut self, account: AccountId) {
        self.push(DeltaOp::RealUser(account));
    }

    pub fn set_current_patch_set(&mut self) {
        self.push(DeltaOp::Current);
    }

    pub fn set_patch_set_description(&mut self, description: impl Into<String>) {
        self.push(DeltaOp::PatchSetDescription(description.into()));
    }

    pub fn set_patch_set_state(&mut self, state: PatchSetState) {
        self.push(DeltaOp::PatchSetState(state));
    }

    pub fn set_push_certificate(&mut self, revision: ObjectId, certificate: impl Into<String>) {
        self.push(DeltaOp::PushCertificate {
            revision,
            certificate: certificate.into(),
        });
    }

    pub fn set_change_message(&mut self, message: impl Into<String>) {
        self.push(DeltaOp::Message(message.into()));
    }

    /// Vote as the update's author.
    pub fn put_approval(&mut self, label: impl Into<String>, value: i16) {
        self.push(DeltaOp::Vote {
            label: label.into(),
            value,
            on_behalf_of: None,
        });
    }

    pub fn put_approval_for(&mut self, account: AccountId, label: impl Into<String>, value: i16) {
        self.push(DeltaOp::Vote {
            label: label.into(),
            value,
            on_behalf_of: self.on_behalf(account),
        });
    }

    pub fn remove_approval(&mut self, label: impl Into<String>) {
        self.push(DeltaOp::RemoveVote {
            label: label.into(),
            on_behalf_of: None,
        });
    }

    pub fn remove_approval_for(&mut self, account: AccountId, label: impl Into<String>) {
        self.push(DeltaOp::RemoveVote {
            label: label.into(),
            on_behalf_of: self.on_behalf(account),
        });
    }

    pub fn put_reviewer(&mut self, account: AccountId, state: ReviewerState) {
        self.push(DeltaOp::Reviewer(account, state));
    }

    pub fn remove_reviewer(&mut self, account: AccountId) {
        self.push(DeltaOp::Reviewer(account, ReviewerState::Removed));
    }

    /// Publish a comment. The batch also drops it from its author's drafts.
    pub fn put_comment(&mut self, comment: Comment) {
        self.push(DeltaOp::PutComment(comment));
    }

    pub fn delete_comment(&mut self, revision: ObjectId, key: CommentKey) {
        self.push(DeltaOp::DeleteComment { revision, key });
    }

    pub fn published_comments(&self) -> impl Iterator<Item = &Comment> {
        self.delta.ops().filter_map(|op| match op {
            DeltaOp::PutComment(comment) => Some(comment),
            _ => None,
        })
    }

    fn on_behalf(&self, account: AccountId) -> Option<AccountId> {
        (self.author != Some(account)).then_some(account)
    }
}

impl RefUpdater for ChangeUpdate {
    fn change(&self) -> ChangeId {
        self.change
    }

    fn ref_name(&self) -> String {
        refs::change_meta_ref(self.change)
    }

    /// Only the update that creates the change may create its ref.
    fn allows_create(&self) -> bool {
        self.delta.ops().any(|op| matches!(op, DeltaOp::ChangeKey(_)))
    }

    fn apply(
        &self,
        repo: &dyn Repository,
        inserter: &mut ObjectInserter,
        codec: &IdentityCodec,
        parent: ObjectId,
    ) -> Result<ApplyOutcome, NotesError> {
        if self.delta.is_empty() {
            return Ok(ApplyOutcome::Unchanged);
        }
        let ref_name = self.ref_name();

        let (parent_tree, notes) = {
            let reader = inserter.reader(repo);
            let parent_tree = read_parent(&reader, &ref_name, parent)?.map_or(ObjectId::ZERO, |c| c.tree);
            let notes = if self.delta.has_note_edits() {
                let mut notes = RevisionNoteMap::load(self.change, &reader, parent_tree)?;
                apply_note_edits(&mut notes, &reader, codec, self.delta.note_edits())?;
                Some(notes)
            } else {
                None
            };
            (parent_tree, notes)
        };
        let tree = match notes {
            Some(notes) => {
                let tree = notes.write_tree(inserter, repo, codec);
                inserter.insert_tree(repo, &tree)
            }
            None if parent_tree.is_zero() => inserter.insert_tree(repo, &Tree::new()),
            None => parent_tree,
        };

        let committer = codec.server_ident(self.when);
        let author = self
            .author
            .map_or_else(|| committer.clone(), |account| codec.account_ident(account, self.when));
        let commit = CommitData {
            tree,
            parents: parent.non_zero().into_iter().collect(),
            author,
            committer,
            message: self.delta.commit_message(self.patch_set, codec),
        };
        let id = inserter.insert_commit(repo, &commit);
        tracing::debug!(change_id = %self.change, commit = %id, "built change update");
        Ok(ApplyOutcome::Commit(id))
    }
}
