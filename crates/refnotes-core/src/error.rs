use std::fmt;

use chrono::{DateTime, Utc};

use crate::model::ChangeId;
use crate::repo::RepoError;

/// Machine-readable error codes for operators and automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidFooter,
    InvalidNote,
    InvalidStateToken,
    MissingFooter,
    RefLockFailure,
    BackendFailure,
    CorruptSequence,
    RelationalFailure,
    ChangeReadOnly,
    WritesDisabled,
    MigrationAborted,
    RewriteDisabled,
    InconsistentBatch,
    InvalidUpdate,
    NoPatchSets,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidFooter => "E1001",
            Self::InvalidNote => "E1002",
            Self::InvalidStateToken => "E1003",
            Self::MissingFooter => "E1004",
            Self::RefLockFailure => "E2001",
            Self::BackendFailure => "E3001",
            Self::CorruptSequence => "E3002",
            Self::RelationalFailure => "E3003",
            Self::ChangeReadOnly => "E4001",
            Self::WritesDisabled => "E4002",
            Self::MigrationAborted => "E4003",
            Self::RewriteDisabled => "E4004",
            Self::InconsistentBatch => "E5001",
            Self::InvalidUpdate => "E5002",
            Self::NoPatchSets => "E5003",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::InvalidFooter => "Invalid commit footer",
            Self::InvalidNote => "Invalid revision note",
            Self::InvalidStateToken => "Invalid change state token",
            Self::MissingFooter => "Missing mandatory commit footer",
            Self::RefLockFailure => "Ref or state token changed concurrently",
            Self::BackendFailure => "Repository backend failure",
            Self::CorruptSequence => "Corrupt sequence blob",
            Self::RelationalFailure => "Relational store failure",
            Self::ChangeReadOnly => "Change is read-only",
            Self::WritesDisabled => "Change writes are disabled",
            Self::MigrationAborted => "Primary storage migration aborted",
            Self::RewriteDisabled => "History rewrite is disabled",
            Self::InconsistentBatch => "Batch update left refs inconsistent",
            Self::InvalidUpdate => "Invalid update request",
            Self::NoPatchSets => "Change has no patch sets",
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::InvalidFooter | Self::InvalidNote | Self::MissingFooter => {
                Some("Inspect the change ref history; rebuild the change from the relational store if it is primary.")
            }
            Self::InvalidStateToken => Some("Clear the note_db_state column and rebuild the change."),
            Self::RefLockFailure => {
                Some("Retry the operation against a fresh read of the change.")
            }
            Self::BackendFailure => Some("Check repository permissions and disk space, then retry."),
            Self::CorruptSequence => {
                Some("Repair the sequence blob by hand; never reset it below the highest issued id.")
            }
            Self::RelationalFailure => Some("Check the relational store connection and retry."),
            Self::ChangeReadOnly => Some("Wait for the migration lease to expire and retry."),
            Self::WritesDisabled => Some("Wait for the migration to finish or re-enable change writes."),
            Self::MigrationAborted => {
                Some("Re-run the migration for this change after the read-only lease expires.")
            }
            Self::RewriteDisabled => Some("Set rewrite.allow_comment_rewrite = true to permit history edits."),
            Self::InconsistentBatch => {
                Some("Operator attention required: compare ref tips with the recorded state tokens.")
            }
            Self::InvalidUpdate | Self::NoPatchSets => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors raised by the notes engine.
///
/// Every variant that concerns a specific change or ref names it, so a single
/// error line is enough to locate the failing entity.
#[derive(Debug, thiserror::Error)]
pub enum NotesError {
    /// Malformed commit message or footer content.
    #[error("invalid {field} in change {change}: {detail}")]
    Format {
        change: ChangeId,
        field: String,
        detail: String,
    },

    /// Malformed revision note blob.
    #[error("invalid note {field} in change {change}: {detail}")]
    Note {
        change: ChangeId,
        field: &'static str,
        detail: String,
    },

    /// Malformed state token stored on the relational row.
    #[error("invalid state token for change {change}: {value:?}")]
    Token { change: ChangeId, value: String },

    /// A mandatory footer never appeared anywhere in the history.
    #[error("missing {field} footer in change {change}")]
    MissingFooter { change: ChangeId, field: &'static str },

    /// Compare-and-swap mismatch on a ref or on a recorded token.
    #[error("concurrent update of {ref_name}: {detail}")]
    Concurrency { ref_name: String, detail: String },

    /// Backend unavailable or an object/ref operation failed.
    #[error("storage failure on {target}")]
    Storage {
        target: String,
        #[source]
        source: RepoError,
    },

    #[error("sequence {ref_name} holds a non-numeric value {value:?}")]
    CorruptSequence { ref_name: String, value: String },

    #[error("change {change} is read-only until {until}")]
    ReadOnly {
        change: ChangeId,
        until: DateTime<Utc>,
    },

    #[error("change writes are disabled")]
    WritesDisabled,

    #[error("migration of change {change} aborted: {detail}")]
    MigrationAborted { change: ChangeId, detail: String },

    #[error("history rewrite of {ref_name} is disabled")]
    RewriteDisabled { ref_name: String },

    /// A command failed after part of the batch became durable.
    #[error("batch update left {ref_name} inconsistent: {detail}")]
    Inconsistent { ref_name: String, detail: String },

    #[error("relational store failure")]
    Relational(#[from] rusqlite::Error),

    #[error("change {0} has no patch sets")]
    NoPatchSets(ChangeId),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

impl NotesError {
    pub fn format(change: ChangeId, field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Format {
            change,
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn note(change: ChangeId, field: &'static str, detail: impl Into<String>) -> Self {
        Self::Note {
            change,
            field,
            detail: detail.into(),
        }
    }

    pub fn storage(target: impl Into<String>, source: RepoError) -> Self {
        Self::Storage {
            target: target.into(),
            source,
        }
    }

    pub fn concurrency(ref_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Concurrency {
            ref_name: ref_name.into(),
            detail: detail.into(),
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Format { .. } => ErrorCode::InvalidFooter,
            Self::Note { .. } => ErrorCode::InvalidNote,
            Self::Token { .. } => ErrorCode::InvalidStateToken,
            Self::MissingFooter { .. } => ErrorCode::MissingFooter,
            Self::Concurrency { .. } => ErrorCode::RefLockFailure,
            Self::Storage { .. } => ErrorCode::BackendFailure,
            Self::CorruptSequence { .. } => ErrorCode::CorruptSequence,
            Self::ReadOnly { .. } => ErrorCode::ChangeReadOnly,
            Self::WritesDisabled => ErrorCode::WritesDisabled,
            Self::MigrationAborted { .. } => ErrorCode::MigrationAborted,
            Self::RewriteDisabled { .. } => ErrorCode::RewriteDisabled,
            Self::Inconsistent { .. } => ErrorCode::InconsistentBatch,
            Self::Relational(_) => ErrorCode::RelationalFailure,
            Self::NoPatchSets(_) => ErrorCode::NoPatchSets,
            Self::InvalidUpdate(_) => ErrorCode::InvalidUpdate,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether this error came from malformed stored content.
    #[must_use]
    pub const fn is_format(&self) -> bool {
        matches!(
            self,
            Self::Format { .. } | Self::Note { .. } | Self::Token { .. } | Self::MissingFooter { .. }
        )
    }

    /// Whether a caller should retry with a fresh read.
    ///
    /// Only compare-and-swap races are retryable. Read-only leases are
    /// surfaced immediately; the caller decides whether to wait.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, NotesError};
    use crate::model::ChangeId;
    use std::collections::HashSet;

    const ALL: [ErrorCode; 15] = [
        ErrorCode::InvalidFooter,
        ErrorCode::InvalidNote,
        ErrorCode::InvalidStateToken,
        ErrorCode::MissingFooter,
        ErrorCode::RefLockFailure,
        ErrorCode::BackendFailure,
        ErrorCode::CorruptSequence,
        ErrorCode::RelationalFailure,
        ErrorCode::ChangeReadOnly,
        ErrorCode::WritesDisabled,
        ErrorCode::MigrationAborted,
        ErrorCode::RewriteDisabled,
        ErrorCode::InconsistentBatch,
        ErrorCode::InvalidUpdate,
        ErrorCode::NoPatchSets,
    ];

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        for code in ALL {
            let s = code.code();
            assert_eq!(s.len(), 5);
            assert!(s.starts_with('E'));
            assert!(s.chars().skip(1).all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn only_concurrency_is_retryable() {
        assert!(NotesError::concurrency("refs/changes/01/1/meta", "lock").is_retryable());
        assert!(!NotesError::WritesDisabled.is_retryable());
        assert!(!NotesError::format(ChangeId::new(1), "Status", "bogus").is_retryable());
    }

    #[test]
    fn display_names_change_and_field() {
        let err = NotesError::format(ChangeId::new(42), "Patch-set", "not a number");
        let text = err.to_string();
        assert!(text.contains("42"));
        assert!(text.contains("Patch-set"));
    }
}
