//! Commit messages of a change history.
//!
//! Layout:
//!
//! ```text
//! <subject>
//!
//! [<change message body>
//!
//! ]<Footer-Name>: <value>
//! <Footer-Name>: <value>
//! ```
//!
//! The last paragraph is always the footer block. Footer names match
//! case-insensitively; an unknown name, a line that is not `Name: value`, or
//! a repeated singleton footer fails the whole commit.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::NotesError;
use crate::model::{
    AccountId, ChangeId, LabelStatus, LabelVote, PatchSetId, PatchSetState, ReviewerState,
    SubmitLabel, SubmitRecord, SubmitStatus,
};
use crate::model::approval::is_valid_label_name;

use super::IdentityCodec;

/// Timestamp format shared by footers and revision notes.
pub(crate) const TIMESTAMP_FORMAT: &str = "%a %b %d %H:%M:%S %Y %z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FooterKey {
    PatchSet,
    ChangeId,
    Subject,
    Branch,
    Status,
    Topic,
    Commit,
    Hashtags,
    Tag,
    Groups,
    Label,
    Reviewer,
    Cc,
    Removed,
    SubmissionId,
    SubmittedWith,
    Assignee,
    Private,
    WorkInProgress,
    ReadOnlyUntil,
    RealUser,
    Current,
    PatchSetDescription,
}

impl FooterKey {
    pub const ALL: [Self; 23] = [
        Self::PatchSet,
        Self::ChangeId,
        Self::Subject,
        Self::Branch,
        Self::Status,
        Self::Topic,
        Self::Commit,
        Self::Hashtags,
        Self::Tag,
        Self::Groups,
        Self::Label,
        Self::Reviewer,
        Self::Cc,
        Self::Removed,
        Self::SubmissionId,
        Self::SubmittedWith,
        Self::Assignee,
        Self::Private,
        Self::WorkInProgress,
        Self::ReadOnlyUntil,
        Self::RealUser,
        Self::Current,
        Self::PatchSetDescription,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PatchSet => "Patch-set",
            Self::ChangeId => "Change-id",
            Self::Subject => "Subject",
            Self::Branch => "Branch",
            Self::Status => "Status",
            Self::Topic => "Topic",
            Self::Commit => "Commit",
            Self::Hashtags => "Hashtags",
            Self::Tag => "Tag",
            Self::Groups => "Groups",
            Self::Label => "Label",
            Self::Reviewer => "Reviewer",
            Self::Cc => "CC",
            Self::Removed => "Removed",
            Self::SubmissionId => "Submission-id",
            Self::SubmittedWith => "Submitted-with",
            Self::Assignee => "Assignee",
            Self::Private => "Private",
            Self::WorkInProgress => "Work-in-progress",
            Self::ReadOnlyUntil => "Read-only-until",
            Self::RealUser => "Real-user",
            Self::Current => "Current",
            Self::PatchSetDescription => "Patch-set-description",
        }
    }

    /// Case-insensitive lookup.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(name))
    }

    /// Footers that may appear more than once in one commit.
    #[must_use]
    pub const fn is_repeatable(self) -> bool {
        matches!(
            self,
            Self::Label | Self::Reviewer | Self::Cc | Self::Removed | Self::SubmittedWith
        )
    }

    #[must_use]
    pub const fn for_reviewer_state(state: ReviewerState) -> Self {
        match state {
            ReviewerState::Reviewer => Self::Reviewer,
            ReviewerState::Cc => Self::Cc,
            ReviewerState::Removed => Self::Removed,
        }
    }
}

impl fmt::Display for FooterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FooterLine {
    pub key: FooterKey,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// A parsed commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub subject: String,
    /// Change message text, if the commit carried one.
    pub body: Option<String>,
    pub footers: Vec<FooterLine>,
}

impl CommitMessage {
    /// Parse a commit message.
    ///
    /// # Errors
    ///
    /// [`NotesError::Format`] for a message without a footer block, a
    /// malformed or unknown footer line, or a repeated singleton footer.
    pub fn parse(change: ChangeId, message: &str) -> Result<Self, NotesError> {
        let message = message.trim_end();
        let Some((subject, rest)) = message.split_once("\n\n") else {
            return Err(NotesError::format(change, "footer", "commit has no footer block"));
        };
        let (body, block) = match rest.rfind("\n\n") {
            Some(at) => (Some(rest[..at].to_string()), &rest[at + 2..]),
            None => (None, rest),
        };

        let mut footers: Vec<FooterLine> = Vec::new();
        for line in block.lines() {
            let Some((name, value)) = line.split_once(':') else {
                return Err(NotesError::format(
                    change,
                    "footer",
                    format!("not a footer line: {line:?}"),
                ));
            };
            let Some(key) = FooterKey::from_name(name.trim()) else {
                return Err(NotesError::format(
                    change,
                    "footer",
                    format!("unknown footer {:?}", name.trim()),
                ));
            };
            if !key.is_repeatable() && footers.iter().any(|f| f.key == key) {
                return Err(NotesError::format(change, key.as_str(), "duplicate footer"));
            }
            footers.push(FooterLine {
                key,
                value: value.trim().to_string(),
            });
        }

        Ok(Self {
            subject: subject.to_string(),
            body: body.filter(|b| !b.trim().is_empty()),
            footers,
        })
    }

    pub fn values(&self, key: FooterKey) -> impl Iterator<Item = &str> {
        self.footers
            .iter()
            .filter(move |f| f.key == key)
            .map(|f| f.value.as_str())
    }

    /// Value of a singleton footer.
    #[must_use]
    pub fn single(&self, key: FooterKey) -> Option<&str> {
        self.values(key).next()
    }

    #[must_use]
    pub fn has(&self, key: FooterKey) -> bool {
        self.single(key).is_some()
    }
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    subject: String,
    body: Option<String>,
    footers: Vec<FooterLine>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new(subject: &str) -> Self {
        Self {
            subject: single_line(subject),
            body: None,
            footers: Vec::new(),
        }
    }

    #[must_use]
    pub fn body(mut self, body: Option<&str>) -> Self {
        self.body = body
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        self
    }

    pub fn push(&mut self, key: FooterKey, value: impl AsRef<str>) {
        self.footers.push(FooterLine {
            key,
            value: single_line(value.as_ref()),
        });
    }

    #[must_use]
    pub fn build(&self) -> String {
        let mut out = String::with_capacity(128);
        out.push_str(&self.subject);
        out.push_str("\n\n");
        if let Some(body) = &self.body {
            out.push_str(body);
            out.push_str("\n\n");
        }
        for footer in &self.footers {
            out.push_str(footer.key.as_str());
            out.push(':');
            if !footer.value.is_empty() {
                out.push(' ');
                out.push_str(&footer.value);
            }
            out.push('\n');
        }
        out
    }
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ").trim().to_string()
}

// ---------------------------------------------------------------------------
// Value codecs
// ---------------------------------------------------------------------------

#[must_use]
pub fn format_patch_set(ps: PatchSetId, state: PatchSetState) -> String {
    match state {
        PatchSetState::Published => ps.to_string(),
        PatchSetState::Deleted => format!("{ps} ({})", state.as_str()),
    }
}

/// Parse `N` or `N (state)`.
///
/// # Errors
///
/// [`NotesError::Format`] on a non-numeric id or unknown state.
pub fn parse_patch_set(
    change: ChangeId,
    value: &str,
) -> Result<(PatchSetId, PatchSetState), NotesError> {
    let invalid = || NotesError::format(change, FooterKey::PatchSet.as_str(), value);
    let (number, state) = match value.split_once(' ') {
        Some((number, state)) => {
            let state = state
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .and_then(PatchSetState::parse)
                .ok_or_else(invalid)?;
            (number, state)
        }
        None => (value, PatchSetState::Published),
    };
    let id: PatchSetId = number.parse().map_err(|_| invalid())?;
    if id.get() == 0 {
        return Err(invalid());
    }
    Ok((id, state))
}

/// # Errors
///
/// [`NotesError::Format`] for anything other than `true`/`false`.
pub fn parse_bool(change: ChangeId, key: FooterKey, value: &str) -> Result<bool, NotesError> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(NotesError::format(change, key.as_str(), value))
    }
}

#[must_use]
pub fn format_timestamp(when: DateTime<Utc>) -> String {
    when.format(TIMESTAMP_FORMAT).to_string()
}

#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Hashtags footer value: comma-joined, sorted; empty means "cleared".
#[must_use]
pub fn format_hashtags<'a>(tags: impl IntoIterator<Item = &'a String>) -> String {
    let mut tags: Vec<&str> = tags.into_iter().map(String::as_str).collect();
    tags.sort_unstable();
    tags.join(",")
}

#[must_use]
pub fn parse_hashtags(value: &str) -> std::collections::BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// One `Label` footer: a vote or a removal, optionally on behalf of another
/// account than the commit author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFooter {
    Vote {
        vote: LabelVote,
        account: Option<AccountId>,
    },
    Removal {
        label: String,
        account: Option<AccountId>,
    },
}

impl LabelFooter {
    #[must_use]
    pub fn format(&self, codec: &IdentityCodec) -> String {
        let (mut out, account) = match self {
            Self::Vote { vote, account } => (vote.to_string(), account),
            Self::Removal { label, account } => (format!("-{label}"), account),
        };
        if let Some(account) = account {
            out.push(' ');
            out.push_str(&codec.format_footer(*account));
        }
        out
    }

    /// # Errors
    ///
    /// [`NotesError::Format`] on a malformed vote, label or identity.
    pub fn parse(change: ChangeId, value: &str, codec: &IdentityCodec) -> Result<Self, NotesError> {
        let invalid = || NotesError::format(change, FooterKey::Label.as_str(), value);
        let (vote_text, account) = match value.split_once(' ') {
            Some((vote, ident)) => (vote, Some(codec.parse_footer(ident).ok_or_else(invalid)?)),
            None => (value, None),
        };
        if let Some(label) = vote_text.strip_prefix('-') {
            if !is_valid_label_name(label) {
                return Err(invalid());
            }
            return Ok(Self::Removal {
                label: label.to_string(),
                account,
            });
        }
        let vote = LabelVote::parse(vote_text).ok_or_else(invalid)?;
        Ok(Self::Vote { vote, account })
    }
}

/// `Submitted-with` lines for a list of records, in order.
#[must_use]
pub fn format_submit_records(records: &[SubmitRecord], codec: &IdentityCodec) -> Vec<String> {
    let mut lines = Vec::new();
    for record in records {
        match &record.error_message {
            Some(message) => lines.push(format!("{} {}", record.status.as_str(), message)),
            None => lines.push(record.status.as_str().to_string()),
        }
        for label in &record.labels {
            let mut line = format!("{}: {}", label.status.as_str(), label.label);
            if let Some(account) = label.applied_by {
                line.push_str(": ");
                line.push_str(&codec.format_footer(account));
            }
            lines.push(line);
        }
    }
    lines
}

/// Inverse of [`format_submit_records`].
///
/// # Errors
///
/// [`NotesError::Format`] for an unknown status, a label line before any
/// status line, or a malformed identity.
pub fn parse_submit_records<'a>(
    change: ChangeId,
    lines: impl IntoIterator<Item = &'a str>,
    codec: &IdentityCodec,
) -> Result<Vec<SubmitRecord>, NotesError> {
    let mut records: Vec<SubmitRecord> = Vec::new();
    for line in lines {
        let invalid = || NotesError::format(change, FooterKey::SubmittedWith.as_str(), line);
        let token_end = line.find([' ', ':']).unwrap_or(line.len());
        let (token, rest) = line.split_at(token_end);

        if let Some(label_part) = rest.strip_prefix(':') {
            let status: LabelStatus = token.parse().map_err(|_| invalid())?;
            let label_part = label_part.trim();
            let (label, applied_by) = match label_part.split_once(": ") {
                Some((label, ident)) => {
                    (label, Some(codec.parse_footer(ident).ok_or_else(invalid)?))
                }
                None => (label_part, None),
            };
            let record = records.last_mut().ok_or_else(invalid)?;
            record.labels.push(SubmitLabel {
                label: label.to_string(),
                status,
                applied_by,
            });
        } else {
            let status: SubmitStatus = token.parse().map_err(|_| invalid())?;
            let mut record = SubmitRecord::new(status);
            let message = rest.trim();
            if !message.is_empty() {
                record.error_message = Some(message.to_string());
            }
            records.push(record);
        }
    }
    Ok(records)
}
