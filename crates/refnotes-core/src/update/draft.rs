use chrono::{DateTime, Utc};

use crate::error::NotesError;
use crate::model::{AccountId, ChangeId, Comment, CommentKey};
use crate::note::{IdentityCodec, MessageBuilder, RevisionNoteMap};
use crate::repo::{CommitData, ObjectId, ObjectInserter, Repository, refs};

use super::{ApplyOutcome, NoteEdit, RefUpdater, apply_note_edits, read_parent};

const DRAFT_SUBJECT: &str = "Update draft comments";

/// Edits to one author's draft comments on one change.
///
/// Drafts live only in the note tree; commit messages carry no footers.
/// When the last draft goes away the ref is deleted.
#[derive(Debug, Clone)]
pub struct DraftUpdate {
    change: ChangeId,
    author: AccountId,
    when: DateTime<Utc>,
    puts: Vec<Comment>,
    deletes: Vec<CommentKey>,
}

impl DraftUpdate {
    #[must_use]
    pub const fn new(change: ChangeId, author: AccountId, when: DateTime<Utc>) -> Self {
        Self {
            change,
            author,
            when,
            puts: Vec::new(),
            deletes: Vec::new(),
        }
    }

    #[must_use]
    pub const fn author(&self) -> AccountId {
        self.author
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    pub fn put_comment(&mut self, comment: Comment) {
        self.deletes.retain(|key| *key != comment.key);
        self.puts.retain(|c| c.key != comment.key);
        self.puts.push(comment);
    }

    /// Drop a draft by key, whichever revision it is on.
    pub fn delete_comment(&mut self, key: CommentKey) {
        self.puts.retain(|c| c.key != key);
        if !self.deletes.contains(&key) {
            self.deletes.push(key);
        }
    }
}

impl RefUpdater for DraftUpdate {
    fn change(&self) -> ChangeId {
        self.change
    }

    fn ref_name(&self) -> String {
        refs::draft_comments_ref(self.change, self.author)
    }

    fn allows_create(&self) -> bool {
        true
    }

    fn apply(
        &self,
        repo: &dyn Repository,
        inserter: &mut ObjectInserter,
        codec: &IdentityCodec,
        parent: ObjectId,
    ) -> Result<ApplyOutcome, NotesError> {
        if self.is_empty() {
            return Ok(ApplyOutcome::Unchanged);
        }
        let ref_name = self.ref_name();

        let (parent_tree, notes) = {
            let reader = inserter.reader(repo);
            let parent_tree = read_parent(&reader, &ref_name, parent)?.map_or(ObjectId::ZERO, |c| c.tree);
            let mut notes = RevisionNoteMap::load(self.change, &reader, parent_tree)?;
            if !self.deletes.is_empty() {
                notes.parse_all(&reader, codec)?;
            }
            let deletes: Vec<(ObjectId, &CommentKey)> = self
                .deletes
                .iter()
                .filter_map(|key| {
                    notes
                        .comments()
                        .find(|c| c.key == *key)
                        .map(|c| (c.revision, key))
                })
                .collect();
            let edits = deletes
                .into_iter()
                .map(|(revision, key)| NoteEdit::Delete { revision, key })
                .chain(self.puts.iter().map(NoteEdit::Put));
            apply_note_edits(&mut notes, &reader, codec, edits)?;
            (parent_tree, notes)
        };

        let tree = notes.write_tree(inserter, repo, codec);
        if tree.is_empty() {
            return Ok(if parent.is_zero() {
                ApplyOutcome::Unchanged
            } else {
                ApplyOutcome::DeleteRef
            });
        }
        let tree_id = inserter.insert_tree(repo, &tree);
        if tree_id == parent_tree {
            return Ok(ApplyOutcome::Unchanged);
        }

        let committer = codec.server_ident(self.when);
        let commit = CommitData {
            tree: tree_id,
            parents: parent.non_zero().into_iter().collect(),
            author: codec.account_ident(self.author, self.when),
            committer,
            message: MessageBuilder::new(DRAFT_SUBJECT).build(),
        };
        Ok(ApplyOutcome::Commit(inserter.insert_commit(repo, &commit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::model::PatchSetId;
    use crate::repo::MemoryRepository;

    const CHANGE: ChangeId = ChangeId::new(3);
    const ALICE: AccountId = AccountId::new(1);

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("ts")
    }

    fn draft(uuid: &str, rev: u8) -> Comment {
        let key = CommentKey {
            patch_set: PatchSetId::new(1),
            filename: "a.txt".to_string(),
            uuid: uuid.to_string(),
        };
        Comment::new(key, ALICE, ts(0), "draft", ObjectId::from_bytes([rev; 20]))
    }

    fn apply(repo: &MemoryRepository, update: &DraftUpdate, parent: ObjectId) -> ApplyOutcome {
        let codec = IdentityCodec::new(&IdentityConfig::default());
        let mut inserter = ObjectInserter::new();
        let outcome = update.apply(repo, &mut inserter, &codec, parent).expect("apply");
        inserter.flush(repo).expect("flush");
        outcome
    }

    #[test]
    fn deleting_the_last_draft_deletes_the_ref() {
        let repo = MemoryRepository::new("All-Users");
        let mut add = DraftUpdate::new(CHANGE, ALICE, ts(1));
        add.put_comment(draft("d1", 1));
        let ApplyOutcome::Commit(tip) = apply(&repo, &add, ObjectId::ZERO) else {
            panic!("expected a commit");
        };

        let mut remove = DraftUpdate::new(CHANGE, ALICE, ts(2));
        remove.delete_comment(draft("d1", 1).key);
        assert_eq!(apply(&repo, &remove, tip), ApplyOutcome::DeleteRef);
    }

    #[test]
    fn rewriting_identical_drafts_is_unchanged() {
        let repo = MemoryRepository::new("All-Users");
        let mut add = DraftUpdate::new(CHANGE, ALICE, ts(1));
        add.put_comment(draft("d1", 1));
        let ApplyOutcome::Commit(tip) = apply(&repo, &add, ObjectId::ZERO) else {
            panic!("expected a commit");
        };
        let mut again = DraftUpdate::new(CHANGE, ALICE, ts(5));
        again.put_comment(draft("d1", 1));
        assert_eq!(apply(&repo, &again, tip), ApplyOutcome::Unchanged);
    }

    #[test]
    fn deleting_a_missing_draft_without_a_ref_is_unchanged() {
        let repo = MemoryRepository::new("All-Users");
        let mut remove = DraftUpdate::new(CHANGE, ALICE, ts(2));
        remove.delete_comment(draft("nope", 1).key);
        assert_eq!(apply(&repo, &remove, ObjectId::ZERO), ApplyOutcome::Unchanged);
    }

    #[test]
    fn later_put_cancels_pending_delete() {
        let mut update = DraftUpdate::new(CHANGE, ALICE, ts(0));
        update.delete_comment(draft("d1", 1).key);
        update.put_comment(draft("d1", 1));
        assert_eq!(update.deletes.len(), 0);
        assert_eq!(update.puts.len(), 1);
    }
}
