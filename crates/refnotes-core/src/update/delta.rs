//! The ordered set of mutations one update commit carries.
//!
//! Every mutation is a [`DeltaOp`]. An op knows which footer lines it
//! contributes and whether it edits the note tree; [`PendingDelta`] keeps the
//! ops in insertion order and replaces an earlier op that sets the same
//! thing.

use std::collections::BTreeSet;
use std::mem;

use chrono::{DateTime, Utc};

use crate::model::{
    AccountId, ChangeStatus, Comment, CommentKey, LabelVote, PatchSetId, PatchSetState,
    ReviewerState, SubmitRecord,
};
use crate::note::footer::{
    LabelFooter, format_hashtags, format_patch_set, format_submit_records, format_timestamp,
};
use crate::note::{FooterKey, IdentityCodec, MessageBuilder};
use crate::repo::ObjectId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    PatchSetState(PatchSetState),
    ChangeKey(String),
    Branch(String),
    Subject(String),
    Status(ChangeStatus),
    /// `None` clears the topic.
    Topic(Option<String>),
    Commit(ObjectId),
    Groups(Vec<String>),
    Hashtags(BTreeSet<String>),
    Tag(String),
    SubmissionId(String),
    SubmitRecords(Vec<SubmitRecord>),
    /// `None` clears the assignee.
    Assignee(Option<AccountId>),
    Private(bool),
    WorkInProgress(bool),
    ReadOnlyUntil(DateTime<Utc>),
    RealUser(AccountId),
    Current,
    PatchSetDescription(String),
    Message(String),
    PushCertificate {
        revision: ObjectId,
        certificate: String,
    },
    Vote {
        label: String,
        value: i16,
        on_behalf_of: Option<AccountId>,
    },
    RemoveVote {
        label: String,
        on_behalf_of: Option<AccountId>,
    },
    Reviewer(AccountId, ReviewerState),
    PutComment(Comment),
    DeleteComment {
        revision: ObjectId,
        key: CommentKey,
    },
}

/// Change to the note tree carried by an op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteEdit<'a> {
    Put(&'a Comment),
    Delete { revision: ObjectId, key: &'a CommentKey },
    PushCertificate { revision: ObjectId, certificate: &'a str },
}

impl DeltaOp {
    /// Whether a second op of the same kind replaces the first.
    fn replaces(&self, earlier: &Self) -> bool {
        match (self, earlier) {
            (
                Self::Vote { label, on_behalf_of, .. } | Self::RemoveVote { label, on_behalf_of },
                Self::Vote { label: l, on_behalf_of: o, .. } | Self::RemoveVote { label: l, on_behalf_of: o },
            ) => label == l && on_behalf_of == o,
            (Self::Reviewer(a, _), Self::Reviewer(b, _)) => a == b,
            (Self::PutComment(a), Self::PutComment(b)) => a.key == b.key,
            (Self::PutComment(a), Self::DeleteComment { key, .. })
            | (Self::DeleteComment { key, .. }, Self::PutComment(a)) => a.key == *key,
            (Self::DeleteComment { key: a, .. }, Self::DeleteComment { key: b, .. }) => a == b,
            (Self::PushCertificate { revision: a, .. }, Self::PushCertificate { revision: b, .. }) => a == b,
            _ => self.is_singleton() && mem::discriminant(self) == mem::discriminant(earlier),
        }
    }

    const fn is_singleton(&self) -> bool {
        !matches!(
            self,
            Self::Vote { .. }
                | Self::RemoveVote { .. }
                | Self::Reviewer(..)
                | Self::PutComment(_)
                | Self::DeleteComment { .. }
                | Self::PushCertificate { .. }
        )
    }

    /// Footer lines this op contributes.
    fn footers(&self, codec: &IdentityCodec, out: &mut Vec<(FooterKey, String)>) {
        let mut push = |key: FooterKey, value: String| out.push((key, value));
        match self {
            Self::PatchSetState(_)
            | Self::Message(_)
            | Self::PushCertificate { .. }
            | Self::PutComment(_)
            | Self::DeleteComment { .. } => {}
            Self::ChangeKey(key) => push(FooterKey::ChangeId, key.clone()),
            Self::Branch(branch) => push(FooterKey::Branch, branch.clone()),
            Self::Subject(subject) => push(FooterKey::Subject, subject.clone()),
            Self::Status(status) => push(FooterKey::Status, status.as_str().to_string()),
            Self::Topic(topic) => push(FooterKey::Topic, topic.clone().unwrap_or_default()),
            Self::Commit(revision) => push(FooterKey::Commit, revision.to_hex()),
            Self::Groups(groups) => push(FooterKey::Groups, groups.join(",")),
            Self::Hashtags(tags) => push(FooterKey::Hashtags, format_hashtags(tags)),
            Self::Tag(tag) => push(FooterKey::Tag, tag.clone()),
            Self::SubmissionId(id) => push(FooterKey::SubmissionId, id.clone()),
            Self::SubmitRecords(records) => {
                for line in format_submit_records(records, codec) {
                    push(FooterKey::SubmittedWith, line);
                }
            }
            Self::Assignee(assignee) => push(
                FooterKey::Assignee,
                assignee.map(|a| codec.format_footer(a)).unwrap_or_default(),
            ),
            Self::Private(flag) => push(FooterKey::Private, flag.to_string()),
            Self::WorkInProgress(flag) => push(FooterKey::WorkInProgress, flag.to_string()),
            Self::ReadOnlyUntil(until) => push(FooterKey::ReadOnlyUntil, format_timestamp(*until)),
            Self::RealUser(account) => push(FooterKey::RealUser, codec.format_footer(*account)),
            Self::Current => push(FooterKey::Current, "true".to_string()),
            Self::PatchSetDescription(text) => push(FooterKey::PatchSetDescription, text.clone()),
            Self::Vote { label, value, on_behalf_of } => push(
                FooterKey::Label,
                LabelFooter::Vote {
                    vote: LabelVote::new(label.clone(), *value),
                    account: *on_behalf_of,
                }
                .format(codec),
            ),
            Self::RemoveVote { label, on_behalf_of } => push(
                FooterKey::Label,
                LabelFooter::Removal {
                    label: label.clone(),
                    account: *on_behalf_of,
                }
                .format(codec),
            ),
            Self::Reviewer(account, state) => {
                push(FooterKey::for_reviewer_state(*state), codec.format_footer(*account));
            }
        }
    }

    /// Note tree edit this op makes, if any.
    #[must_use]
    pub fn note_edit(&self) -> Option<NoteEdit<'_>> {
        match self {
            Self::PutComment(comment) => Some(NoteEdit::Put(comment)),
            Self::DeleteComment { revision, key } => Some(NoteEdit::Delete {
                revision: *revision,
                key,
            }),
            Self::PushCertificate { revision, certificate } => Some(NoteEdit::PushCertificate {
                revision: *revision,
                certificate,
            }),
            _ => None,
        }
    }
}

/// Mutations accumulated for one commit, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingDelta {
    ops: Vec<DeltaOp>,
    subject: Option<String>,
}

impl PendingDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an op, dropping any earlier op it supersedes.
    pub fn push(&mut self, op: DeltaOp) {
        self.ops.retain(|earlier| !op.replaces(earlier));
        self.ops.push(op);
    }

    /// Override the generated commit subject.
    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.subject = Some(subject.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> impl Iterator<Item = &DeltaOp> {
        self.ops.iter()
    }

    pub fn note_edits(&self) -> impl Iterator<Item = NoteEdit<'_>> {
        self.ops.iter().filter_map(DeltaOp::note_edit)
    }

    #[must_use]
    pub fn has_note_edits(&self) -> bool {
        self.note_edits().next().is_some()
    }

    fn patch_set_state(&self) -> PatchSetState {
        self.ops
            .iter()
            .find_map(|op| match op {
                DeltaOp::PatchSetState(state) => Some(*state),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn default_subject(&self, patch_set: PatchSetId) -> String {
        let creates_patch_set = self.ops.iter().any(|op| matches!(op, DeltaOp::Commit(_)));
        let creates_change = self.ops.iter().any(|op| matches!(op, DeltaOp::ChangeKey(_)));
        match (creates_change, creates_patch_set) {
            (true, _) => "Create change".to_string(),
            (false, true) => format!("Create patch set {patch_set}"),
            (false, false) => format!("Update patch set {patch_set}"),
        }
    }

    /// Full commit message. Footers are ordered by key, then by insertion.
    #[must_use]
    pub fn commit_message(&self, patch_set: PatchSetId, codec: &IdentityCodec) -> String {
        let subject = self
            .subject
            .clone()
            .unwrap_or_else(|| self.default_subject(patch_set));
        let body = self.ops.iter().find_map(|op| match op {
            DeltaOp::Message(text) => Some(text.as_str()),
            _ => None,
        });

        let mut footers = vec![(FooterKey::PatchSet, format_patch_set(patch_set, self.patch_set_state()))];
        for op in &self.ops {
            op.footers(codec, &mut footers);
        }
        footers.sort_by_key(|(key, _)| FooterKey::ALL.iter().position(|k| k == key));

        let mut builder = MessageBuilder::new(&subject).body(body);
        for (key, value) in footers {
            builder.push(key, value);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::note::CommitMessage;
    use crate::model::ChangeId;

    fn codec() -> IdentityCodec {
        IdentityCodec::new(&IdentityConfig::default())
    }

    #[test]
    fn singletons_replace_and_repeatables_accumulate() {
        let mut delta = PendingDelta::new();
        delta.push(DeltaOp::Subject("one".to_string()));
        delta.push(DeltaOp::Reviewer(AccountId::new(1), ReviewerState::Reviewer));
        delta.push(DeltaOp::Reviewer(AccountId::new(2), ReviewerState::Cc));
        delta.push(DeltaOp::Subject("two".to_string()));
        delta.push(DeltaOp::Reviewer(AccountId::new(1), ReviewerState::Removed));
        let ops: Vec<_> = delta.ops().cloned().collect();
        assert_eq!(
            ops,
            vec![
                DeltaOp::Reviewer(AccountId::new(2), ReviewerState::Cc),
                DeltaOp::Subject("two".to_string()),
                DeltaOp::Reviewer(AccountId::new(1), ReviewerState::Removed),
            ]
        );
    }

    #[test]
    fn vote_then_removal_of_same_label_keeps_removal() {
        let mut delta = PendingDelta::new();
        delta.push(DeltaOp::Vote {
            label: "Code-Review".to_string(),
            value: 2,
            on_behalf_of: None,
        });
        delta.push(DeltaOp::Vote {
            label: "Verified".to_string(),
            value: 1,
            on_behalf_of: None,
        });
        delta.push(DeltaOp::RemoveVote {
            label: "Code-Review".to_string(),
            on_behalf_of: None,
        });
        assert_eq!(delta.ops().count(), 2);
    }

    #[test]
    fn message_has_patch_set_first_and_parses_back() {
        let codec = codec();
        let mut delta = PendingDelta::new();
        delta.push(DeltaOp::Status(ChangeStatus::Abandoned));
        delta.push(DeltaOp::Message("Abandoned".to_string()));
        delta.push(DeltaOp::Topic(None));
        delta.push(DeltaOp::PatchSetState(PatchSetState::Deleted));
        let text = delta.commit_message(PatchSetId::new(3), &codec);
        assert!(text.starts_with("Update patch set 3\n\nAbandoned\n\nPatch-set: 3 (deleted)\n"));

        let parsed = CommitMessage::parse(ChangeId::new(1), &text).expect("parse");
        assert_eq!(parsed.single(FooterKey::Status), Some("abandoned"));
        assert_eq!(parsed.single(FooterKey::Topic), Some(""));
        assert_eq!(parsed.body.as_deref(), Some("Abandoned"));
    }

    #[test]
    fn subject_reflects_what_the_commit_does() {
        let codec = codec();
        let mut delta = PendingDelta::new();
        delta.push(DeltaOp::Commit(ObjectId::from_bytes([1; 20])));
        assert!(delta.commit_message(PatchSetId::new(2), &codec).starts_with("Create patch set 2\n"));
        delta.push(DeltaOp::ChangeKey("I1".to_string()));
        assert!(delta.commit_message(PatchSetId::new(1), &codec).starts_with("Create change\n"));
        delta.set_subject("Final migration updates");
        assert!(delta.commit_message(PatchSetId::new(1), &codec).starts_with("Final migration updates\n"));
    }

    #[test]
    fn comment_ops_are_note_edits_without_footers() {
        let codec = codec();
        let when = DateTime::from_timestamp(1_700_000_000, 0).expect("ts");
        let key = CommentKey {
            patch_set: PatchSetId::new(1),
            filename: "a.rs".to_string(),
            uuid: "u1".to_string(),
        };
        let comment = Comment::new(key.clone(), AccountId::new(1), when, "hi", ObjectId::from_bytes([2; 20]));
        let mut delta = PendingDelta::new();
        delta.push(DeltaOp::PutComment(comment));
        assert!(delta.has_note_edits());
        delta.push(DeltaOp::DeleteComment {
            revision: ObjectId::from_bytes([2; 20]),
            key,
        });
        assert_eq!(delta.note_edits().count(), 1);
        assert_eq!(delta.commit_message(PatchSetId::new(1), &codec), "Update patch set 1\n\nPatch-set: 1\n");
    }
}
