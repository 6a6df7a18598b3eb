//! Domain types shared by the codecs, the update pipeline and the rebuilder.
//!
//! These mirror the rows of the relational store closely enough that the
//! rebuilder can replay them without translation, while staying free of any
//! storage concern.

pub mod approval;
pub mod change;
pub mod comment;
pub mod ids;
pub mod message;
pub mod patch_set;
pub mod reviewer;
pub mod submit;

pub use approval::{LabelVote, PatchSetApproval};
pub use change::{Change, ChangeStatus};
pub use comment::{Comment, CommentKey, CommentRange, CommentStatus, Side};
pub use ids::{AccountId, ChangeId, PatchSetId};
pub use message::ChangeMessage;
pub use patch_set::{PatchSet, PatchSetState};
pub use reviewer::{ReviewerSet, ReviewerState};
pub use submit::{LabelStatus, SubmitLabel, SubmitRecord, SubmitStatus};

use std::fmt;

/// Error returned when parsing an unknown enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValue {
    /// What was being parsed (`status`, `reviewer state`, ...).
    pub kind: &'static str,
    /// The unrecognised input string.
    pub raw: String,
}

impl UnknownValue {
    pub(crate) fn new(kind: &'static str, raw: &str) -> Self {
        Self {
            kind,
            raw: raw.to_string(),
        }
    }
}

impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.raw)
    }
}

impl std::error::Error for UnknownValue {}
