use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::{
    AccountId, Change, ChangeMessage, Comment, CommentStatus, PatchSet, PatchSetApproval, PatchSetId,
    ReviewerState,
};

/// One `change_reviewers` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerRow {
    pub account: AccountId,
    pub state: ReviewerState,
    pub updated: DateTime<Utc>,
}

/// Every relational row belonging to one change.
///
/// Child rows come back in a stable order: patch sets by id, approvals by
/// grant time, messages by write time, comments by key, reviewers by
/// account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBundle {
    pub change: Change,
    pub patch_sets: Vec<PatchSet>,
    pub approvals: Vec<PatchSetApproval>,
    pub messages: Vec<ChangeMessage>,
    pub comments: Vec<(Comment, CommentStatus)>,
    pub reviewers: Vec<ReviewerRow>,
}

impl ChangeBundle {
    #[must_use]
    pub const fn new(change: Change) -> Self {
        Self {
            change,
            patch_sets: Vec::new(),
            approvals: Vec::new(),
            messages: Vec::new(),
            comments: Vec::new(),
            reviewers: Vec::new(),
        }
    }

    #[must_use]
    pub fn patch_set(&self, id: PatchSetId) -> Option<&PatchSet> {
        self.patch_sets.iter().find(|ps| ps.id == id)
    }

    pub fn published_comments(&self) -> impl Iterator<Item = &Comment> {
        self.comments
            .iter()
            .filter(|(_, status)| *status == CommentStatus::Published)
            .map(|(c, _)| c)
    }

    /// Draft comments grouped by their author.
    #[must_use]
    pub fn drafts_by_author(&self) -> BTreeMap<AccountId, Vec<&Comment>> {
        let mut drafts: BTreeMap<AccountId, Vec<&Comment>> = BTreeMap::new();
        for (comment, status) in &self.comments {
            if *status == CommentStatus::Draft {
                drafts.entry(comment.author).or_default().push(comment);
            }
        }
        drafts
    }
}
