//! Replacing the text of a published comment throughout a change's history.

use crate::config::RewriteConfig;
use crate::error::NotesError;
use crate::model::{AccountId, ChangeId, CommentKey};
use crate::note::{IdentityCodec, RevisionNoteMap};
use crate::repo::{CommitData, CommitWalk, ObjectId, ObjectInserter, Repository, refs};

use super::{ApplyOutcome, RefUpdater};

/// Rewrites every commit from the one that introduced a comment up to the
/// tip, swapping the comment's message. Older commits are reused as-is, so
/// their ids do not change.
#[derive(Debug, Clone)]
pub struct DeleteCommentRewriter {
    change: ChangeId,
    key: CommentKey,
    new_message: String,
}

impl DeleteCommentRewriter {
    /// # Errors
    ///
    /// [`NotesError::RewriteDisabled`] unless rewrites are allowed.
    pub fn new(
        config: &RewriteConfig,
        change: ChangeId,
        key: CommentKey,
        new_message: impl Into<String>,
    ) -> Result<Self, NotesError> {
        if !config.allow_comment_rewrite {
            return Err(NotesError::RewriteDisabled {
                ref_name: refs::change_meta_ref(change),
            });
        }
        Ok(Self {
            change,
            key,
            new_message: new_message.into(),
        })
    }

    /// Replacement text recording who removed a comment and why.
    #[must_use]
    pub fn removal_message(by: AccountId, reason: Option<&str>) -> String {
        match reason.map(str::trim).filter(|r| !r.is_empty()) {
            Some(reason) => format!("Comment removed by: {by}; Reason: {reason}"),
            None => format!("Comment removed by: {by}"),
        }
    }
}

impl RefUpdater for DeleteCommentRewriter {
    fn change(&self) -> ChangeId {
        self.change
    }

    fn ref_name(&self) -> String {
        refs::change_meta_ref(self.change)
    }

    fn allows_create(&self) -> bool {
        false
    }

    fn is_rewrite(&self) -> bool {
        true
    }

    fn apply(
        &self,
        repo: &dyn Repository,
        inserter: &mut ObjectInserter,
        codec: &IdentityCodec,
        parent: ObjectId,
    ) -> Result<ApplyOutcome, NotesError> {
        let ref_name = self.ref_name();

        // Oldest first; each entry carries the edited notes once the comment
        // exists.
        let mut history: Vec<(ObjectId, CommitData, Option<RevisionNoteMap>)> = Vec::new();
        {
            let reader = inserter.reader(repo);
            for step in CommitWalk::new(&reader, parent) {
                let (id, commit) = step.map_err(|e| NotesError::storage(&ref_name, e))?;
                history.push((id, commit, None));
            }
            history.reverse();
            for (_, commit, edited) in &mut history {
                let mut notes = RevisionNoteMap::load(self.change, &reader, commit.tree)?;
                notes.parse_all(&reader, codec)?;
                let Some(mut comment) = notes.comments().find(|c| c.key == self.key).cloned() else {
                    continue;
                };
                comment.message.clone_from(&self.new_message);
                notes.note(&reader, codec, comment.revision)?.put(comment);
                *edited = Some(notes);
            }
        }

        let Some(start) = history.iter().position(|(_, _, edited)| edited.is_some()) else {
            return Err(NotesError::InvalidUpdate(format!(
                "comment {} not found in {ref_name}",
                self.key
            )));
        };

        let mut tip = if start == 0 { ObjectId::ZERO } else { history[start - 1].0 };
        for (_, commit, edited) in history.into_iter().skip(start) {
            let tree = match edited {
                Some(notes) => {
                    let tree = notes.write_tree(inserter, repo, codec);
                    inserter.insert_tree(repo, &tree)
                }
                None => commit.tree,
            };
            let rewritten = CommitData {
                tree,
                parents: tip.non_zero().into_iter().collect(),
                ..commit
            };
            tip = inserter.insert_commit(repo, &rewritten);
        }
        tracing::info!(change_id = %self.change, key = %self.key, "rewrote comment history");
        Ok(ApplyOutcome::Commit(tip))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::config::IdentityConfig;
    use crate::model::{Comment, PatchSetId};
    use crate::notes::parse_change;
    use crate::repo::MemoryRepository;
    use crate::update::ChangeUpdate;

    const CHANGE: ChangeId = ChangeId::new(8);
    const ALICE: AccountId = AccountId::new(1);

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("ts")
    }

    #[test]
    fn disabled_by_default() {
        let key = CommentKey {
            patch_set: PatchSetId::new(1),
            filename: "f".to_string(),
            uuid: "u".to_string(),
        };
        let err = DeleteCommentRewriter::new(&RewriteConfig::default(), CHANGE, key, "x").unwrap_err();
        assert!(matches!(err, NotesError::RewriteDisabled { .. }));
    }

    #[test]
    fn rewrite_keeps_older_commits_and_replaces_message() {
        let repo = MemoryRepository::new("p");
        let codec = IdentityCodec::new(&IdentityConfig::default());
        let revision = ObjectId::from_bytes([0xaa; 20]);
        let key = CommentKey {
            patch_set: PatchSetId::new(1),
            filename: "a.rs".to_string(),
            uuid: "c1".to_string(),
        };

        let mut create = ChangeUpdate::new(CHANGE, PatchSetId::new(1), Some(ALICE), ts(0));
        create.set_change_key("I8");
        create.set_branch("refs/heads/main");
        create.set_subject("s");
        create.set_commit(revision);
        let mut publish = ChangeUpdate::new(CHANGE, PatchSetId::new(1), Some(ALICE), ts(10));
        publish.put_comment(Comment::new(key.clone(), ALICE, ts(10), "secret", revision));
        let mut later = ChangeUpdate::new(CHANGE, PatchSetId::new(1), Some(ALICE), ts(20));
        later.set_topic(Some("t"));

        let mut inserter = ObjectInserter::new();
        let mut tips = Vec::new();
        let mut tip = ObjectId::ZERO;
        for update in [&create, &publish, &later] {
            let ApplyOutcome::Commit(id) = update.apply(&repo, &mut inserter, &codec, tip).expect("apply") else {
                panic!("expected a commit");
            };
            tip = id;
            tips.push(id);
        }

        let config = RewriteConfig {
            allow_comment_rewrite: true,
        };
        let message = DeleteCommentRewriter::removal_message(ALICE, Some("leaked"));
        let rewriter = DeleteCommentRewriter::new(&config, CHANGE, key.clone(), message.clone()).expect("allowed");
        let ApplyOutcome::Commit(new_tip) = rewriter.apply(&repo, &mut inserter, &codec, tip).expect("rewrite") else {
            panic!("expected a commit");
        };
        inserter.flush(&repo).expect("flush");

        assert_ne!(new_tip, tip);
        let reader: &MemoryRepository = &repo;
        let history: Vec<ObjectId> = CommitWalk::new(reader, new_tip)
            .map(|step| step.expect("walk").0)
            .collect();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2], tips[0]);
        assert_ne!(history[1], tips[1]);

        let state = parse_change(CHANGE, &repo, new_tip, &codec).expect("parse");
        let comment = &state.comments[&revision][0];
        assert_eq!(comment.key, key);
        assert_eq!(comment.message, message);
        assert_eq!(state.columns.expect("exists").topic.as_deref(), Some("t"));
    }
}
