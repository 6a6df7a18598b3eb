use std::fmt;

use chrono::{DateTime, Utc};

use super::{AccountId, PatchSetId};

/// A vote by one account on one label of one patch set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSetApproval {
    pub patch_set: PatchSetId,
    pub account: AccountId,
    pub label: String,
    pub value: i16,
    pub granted: DateTime<Utc>,
    pub tag: Option<String>,
}

impl PatchSetApproval {
    #[must_use]
    pub fn new(
        patch_set: PatchSetId,
        account: AccountId,
        label: impl Into<String>,
        value: i16,
        granted: DateTime<Utc>,
    ) -> Self {
        Self {
            patch_set,
            account,
            label: label.into(),
            value,
            granted,
            tag: None,
        }
    }

    /// Key approvals are deduplicated under.
    #[must_use]
    pub fn key(&self) -> (PatchSetId, AccountId, String) {
        (self.patch_set, self.account, self.label.clone())
    }
}

/// `Label=+1` style vote as written in the `Label` footer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelVote {
    pub label: String,
    pub value: i16,
}

impl LabelVote {
    #[must_use]
    pub fn new(label: impl Into<String>, value: i16) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }

    /// Parse `Name=+2`, `Name=-1`, `Name=0` or a bare `Name` (meaning +1).
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (label, value) = match text.split_once('=') {
            Some((label, value)) => {
                let value = value.strip_prefix('+').unwrap_or(value);
                (label, value.parse::<i16>().ok()?)
            }
            None => (text, 1),
        };
        if !is_valid_label_name(label) {
            return None;
        }
        Some(Self::new(label, value))
    }
}

impl fmt::Display for LabelVote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value > 0 {
            write!(f, "{}=+{}", self.label, self.value)
        } else {
            write!(f, "{}={}", self.label, self.value)
        }
    }
}

/// Label names are ASCII letters, digits and dashes, not starting with a dash.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
