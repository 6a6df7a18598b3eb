use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, ChangeId, PatchSetId, UnknownValue};

/// Lifecycle status of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChangeStatus {
    #[default]
    New,
    Merged,
    Abandoned,
}

impl ChangeStatus {
    pub const ALL: [Self; 3] = [Self::New, Self::Merged, Self::Abandoned];

    /// Canonical lowercase form written to footers and the relational store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Merged => "merged",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::New)
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = UnknownValue;

    /// Case-insensitive: `MERGED`, `Merged` and `merged` all parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownValue::new("status", s))
    }
}

impl Serialize for ChangeStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChangeStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// The relational `changes` row.
///
/// `note_db_state` is the state token column: the expected tips of the
/// change's meta ref and draft refs, or a marker that versioned storage is
/// primary. See [`crate::token::StateToken`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub id: ChangeId,
    /// Repository (project) the change belongs to.
    pub project: String,
    /// User-visible `I...` change key.
    pub change_key: String,
    pub owner: AccountId,
    pub branch: String,
    pub subject: String,
    pub original_subject: String,
    pub topic: Option<String>,
    pub status: ChangeStatus,
    pub created_on: DateTime<Utc>,
    pub last_updated_on: DateTime<Utc>,
    pub current_patch_set: Option<PatchSetId>,
    pub submission_id: Option<String>,
    pub assignee: Option<AccountId>,
    pub is_private: bool,
    pub work_in_progress: bool,
    pub note_db_state: Option<String>,
}

impl Change {
    /// A new open change with one owner and no patch sets yet.
    #[must_use]
    pub fn new(
        id: ChangeId,
        project: impl Into<String>,
        change_key: impl Into<String>,
        owner: AccountId,
        branch: impl Into<String>,
        subject: impl Into<String>,
        created_on: DateTime<Utc>,
    ) -> Self {
        let subject = subject.into();
        Self {
            id,
            project: project.into(),
            change_key: change_key.into(),
            owner,
            branch: branch.into(),
            original_subject: subject.clone(),
            subject,
            topic: None,
            status: ChangeStatus::New,
            created_on,
            last_updated_on: created_on,
            current_patch_set: None,
            submission_id: None,
            assignee: None,
            is_private: false,
            work_in_progress: false,
            note_db_state: None,
        }
    }

    /// Branch names are stored fully qualified.
    #[must_use]
    pub fn dest_branch(&self) -> String {
        if self.branch.starts_with("refs/") {
            self.branch.clone()
        } else {
            format!("refs/heads/{}", self.branch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!("MERGED".parse::<ChangeStatus>(), Ok(ChangeStatus::Merged));
        assert_eq!("Abandoned".parse::<ChangeStatus>(), Ok(ChangeStatus::Abandoned));
        assert_eq!(" new ".parse::<ChangeStatus>(), Ok(ChangeStatus::New));
        assert!("draft".parse::<ChangeStatus>().is_err());
    }

    #[test]
    fn status_encodes_lowercase() {
        for status in ChangeStatus::ALL {
            assert_eq!(status.as_str(), status.as_str().to_ascii_lowercase());
        }
    }

    #[test]
    fn dest_branch_is_qualified() {
        let mut change = Change::new(
            ChangeId::new(1),
            "p",
            "I1",
            AccountId::new(1),
            "main",
            "s",
            Utc::now(),
        );
        assert_eq!(change.dest_branch(), "refs/heads/main");
        change.branch = "refs/heads/dev".to_string();
        assert_eq!(change.dest_branch(), "refs/heads/dev");
    }
}
