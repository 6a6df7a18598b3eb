//! All revision notes of one change, as held in a commit's tree.
//!
//! Each tree entry is named by the revision's hex id and points at a note
//! blob. Notes are decoded on first access, so an update that touches one
//! revision never parses the others.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::error::NotesError;
use crate::model::{ChangeId, Comment};
use crate::repo::{ObjectId, ObjectInserter, ObjectReader, Repository, Tree};

use super::{IdentityCodec, RevisionNote};

#[derive(Debug, Clone)]
pub struct RevisionNoteMap {
    change: ChangeId,
    tree: Tree,
    parsed: BTreeMap<ObjectId, RevisionNote>,
}

impl RevisionNoteMap {
    #[must_use]
    pub fn empty(change: ChangeId) -> Self {
        Self {
            change,
            tree: Tree::new(),
            parsed: BTreeMap::new(),
        }
    }

    /// Read the note tree of a commit. A zero tree id yields an empty map.
    ///
    /// # Errors
    ///
    /// Storage failure, or a tree entry that is not named by a revision id.
    pub fn load<R: ObjectReader + ?Sized>(
        change: ChangeId,
        reader: &R,
        tree: ObjectId,
    ) -> Result<Self, NotesError> {
        if tree.is_zero() {
            return Ok(Self::empty(change));
        }
        let tree = reader
            .read_tree(tree)
            .map_err(|e| NotesError::storage(format!("notes of change {change}"), e))?;
        if let Some((path, _)) = tree.iter().find(|(path, _)| ObjectId::from_hex(path).is_err()) {
            return Err(NotesError::note(change, "tree", format!("unexpected entry {path:?}")));
        }
        Ok(Self {
            change,
            tree,
            parsed: BTreeMap::new(),
        })
    }

    /// Revisions that have a note, stored or pending.
    #[must_use]
    pub fn revisions(&self) -> Vec<ObjectId> {
        let mut revisions: Vec<ObjectId> = self
            .tree
            .iter()
            .filter_map(|(path, _)| ObjectId::from_hex(path).ok())
            .filter(|rev| !self.parsed.contains_key(rev))
            .collect();
        revisions.extend(
            self.parsed
                .iter()
                .filter(|(_, note)| !note.is_empty())
                .map(|(rev, _)| *rev),
        );
        revisions.sort_unstable();
        revisions
    }

    /// The note for `revision`, decoding it on first use. A revision with
    /// no stored note gets an empty one.
    ///
    /// # Errors
    ///
    /// Storage failure or a malformed note blob.
    pub fn note<R: ObjectReader + ?Sized>(
        &mut self,
        reader: &R,
        codec: &IdentityCodec,
        revision: ObjectId,
    ) -> Result<&mut RevisionNote, NotesError> {
        match self.parsed.entry(revision) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let note = match self.tree.get(&revision.to_hex()) {
                    Some(blob) => {
                        let bytes = reader.read_blob(blob).map_err(|e| {
                            NotesError::storage(format!("note {revision} of change {}", self.change), e)
                        })?;
                        RevisionNote::decode(self.change, &bytes, codec)?
                    }
                    None => RevisionNote::new(),
                };
                Ok(entry.insert(note))
            }
        }
    }

    /// Decode every stored note.
    ///
    /// # Errors
    ///
    /// As [`Self::note`].
    pub fn parse_all<R: ObjectReader + ?Sized>(
        &mut self,
        reader: &R,
        codec: &IdentityCodec,
    ) -> Result<(), NotesError> {
        for revision in self.revisions() {
            self.note(reader, codec, revision)?;
        }
        Ok(())
    }

    /// Comments of every decoded note, by revision.
    pub fn comments(&self) -> impl Iterator<Item = &Comment> {
        self.parsed.values().flat_map(RevisionNote::comments)
    }

    #[must_use]
    pub fn into_notes(self) -> BTreeMap<ObjectId, RevisionNote> {
        self.parsed
            .into_iter()
            .filter(|(_, note)| !note.is_empty())
            .collect()
    }

    /// Tree holding the current notes. Decoded notes are re-encoded into
    /// `inserter`; untouched entries keep their blob ids. Empty notes are
    /// dropped from the tree.
    #[must_use]
    pub fn write_tree(
        &self,
        inserter: &mut ObjectInserter,
        repo: &dyn Repository,
        codec: &IdentityCodec,
    ) -> Tree {
        let mut tree = self.tree.clone();
        for (revision, note) in &self.parsed {
            let path = revision.to_hex();
            match note.encode(codec) {
                Some(bytes) => tree.insert(path, inserter.insert_blob(repo, bytes)),
                None => {
                    tree.remove(&path);
                }
            }
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::config::IdentityConfig;
    use crate::model::{AccountId, CommentKey, PatchSetId};
    use crate::repo::MemoryRepository;

    const CHANGE: ChangeId = ChangeId::new(3);

    fn comment(rev: ObjectId, uuid: &str) -> Comment {
        Comment::new(
            CommentKey {
                patch_set: PatchSetId::new(1),
                filename: "src/lib.rs".to_string(),
                uuid: uuid.to_string(),
            },
            AccountId::new(5),
            DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp"),
            "nit",
            rev,
        )
    }

    #[test]
    fn write_then_load_sees_same_comments() {
        let repo = MemoryRepository::new("p");
        let codec = IdentityCodec::new(&IdentityConfig::default());
        let rev = ObjectId::from_bytes([1; 20]);

        let mut map = RevisionNoteMap::empty(CHANGE);
        map.note(&repo, &codec, rev).expect("note").put(comment(rev, "u1"));

        let mut ins = ObjectInserter::new();
        let tree = map.write_tree(&mut ins, &repo, &codec);
        let tree_id = ins.insert_tree(&repo, &tree);
        ins.flush(&repo).expect("flush");

        let mut loaded = RevisionNoteMap::load(CHANGE, &repo, tree_id).expect("load");
        assert_eq!(loaded.revisions(), vec![rev]);
        assert_eq!(loaded.comments().count(), 0);
        loaded.parse_all(&repo, &codec).expect("parse");
        let uuids: Vec<_> = loaded.comments().map(|c| c.key.uuid.as_str()).collect();
        assert_eq!(uuids, ["u1"]);
    }

    #[test]
    fn emptied_note_leaves_the_tree() {
        let repo = MemoryRepository::new("p");
        let codec = IdentityCodec::new(&IdentityConfig::default());
        let rev = ObjectId::from_bytes([2; 20]);

        let mut map = RevisionNoteMap::empty(CHANGE);
        let c = comment(rev, "u1");
        let note = map.note(&repo, &codec, rev).expect("note");
        note.put(c.clone());
        note.remove(&c.key);

        let mut ins = ObjectInserter::new();
        assert!(map.write_tree(&mut ins, &repo, &codec).is_empty());
        assert!(map.revisions().is_empty());
    }

    #[test]
    fn foreign_tree_entries_are_rejected() {
        let repo = MemoryRepository::new("p");
        let mut ins = ObjectInserter::new();
        let blob = ins.insert_blob(&repo, b"x".to_vec());
        let mut tree = Tree::new();
        tree.insert("README", blob);
        let tree_id = ins.insert_tree(&repo, &tree);
        ins.flush(&repo).expect("flush");

        let err = RevisionNoteMap::load(CHANGE, &repo, tree_id).expect_err("must fail");
        assert!(matches!(err, NotesError::Note { field: "tree", .. }));
    }
}
