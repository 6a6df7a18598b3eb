//! Writing a change: per-ref update builders and the batch that commits
//! them.
//!
//! A builder accumulates mutations and, given the ref's current tip,
//! produces at most one new commit (or a ref deletion). The
//! [`BatchUpdateManager`] threads tips through every builder queued on the
//! same ref and applies the result with one atomic transaction per
//! repository.

pub mod change;
pub mod delta;
pub mod draft;
pub mod manager;
pub mod rewrite;

pub use change::ChangeUpdate;
pub use delta::{DeltaOp, NoteEdit, PendingDelta};
pub use draft::DraftUpdate;
pub use manager::{BatchUpdateManager, StagedBatch};
pub use rewrite::DeleteCommentRewriter;

use crate::error::NotesError;
use crate::model::ChangeId;
use crate::note::{IdentityCodec, RevisionNoteMap};
use crate::repo::{CommitData, ObjectId, ObjectInserter, ObjectReader, Repository};

/// Result of applying one builder on top of a tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing to write; the tip stays.
    Unchanged,
    /// New tip.
    Commit(ObjectId),
    /// The ref should be deleted.
    DeleteRef,
}

/// One builder queued on one ref.
pub trait RefUpdater: Send {
    fn change(&self) -> ChangeId;

    fn ref_name(&self) -> String;

    /// Whether this builder may create its ref when it does not exist yet.
    fn allows_create(&self) -> bool;

    /// History rewrites must be alone on their ref.
    fn is_rewrite(&self) -> bool {
        false
    }

    /// Build on top of `parent` (zero when the ref is absent), buffering any
    /// new objects in `inserter`.
    ///
    /// # Errors
    ///
    /// Storage failures or malformed notes in the parent tree.
    fn apply(
        &self,
        repo: &dyn Repository,
        inserter: &mut ObjectInserter,
        codec: &IdentityCodec,
        parent: ObjectId,
    ) -> Result<ApplyOutcome, NotesError>;
}

/// The parent commit, or `None` for a zero id.
pub(crate) fn read_parent<R: ObjectReader + ?Sized>(
    reader: &R,
    ref_name: &str,
    parent: ObjectId,
) -> Result<Option<CommitData>, NotesError> {
    if parent.is_zero() {
        return Ok(None);
    }
    reader
        .read_commit(parent)
        .map(Some)
        .map_err(|e| NotesError::storage(ref_name, e))
}

/// Apply note edits to `notes`, decoding only the notes they touch.
pub(crate) fn apply_note_edits<'a, R: ObjectReader + ?Sized>(
    notes: &mut RevisionNoteMap,
    reader: &R,
    codec: &IdentityCodec,
    edits: impl IntoIterator<Item = NoteEdit<'a>>,
) -> Result<(), NotesError> {
    for edit in edits {
        match edit {
            NoteEdit::Put(comment) => notes.note(reader, codec, comment.revision)?.put(comment.clone()),
            NoteEdit::Delete { revision, key } => {
                notes.note(reader, codec, revision)?.remove(key);
            }
            NoteEdit::PushCertificate { revision, certificate } => {
                notes.note(reader, codec, revision)?.push_cert = Some(certificate.to_string());
            }
        }
    }
    Ok(())
}
