use std::fmt;
use std::str::FromStr;

use super::{AccountId, UnknownValue};

/// Overall outcome of evaluating submit rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitStatus {
    Ok,
    NotReady,
    Closed,
    Forced,
    RuleError,
}

impl SubmitStatus {
    pub const ALL: [Self; 5] = [
        Self::Ok,
        Self::NotReady,
        Self::Closed,
        Self::Forced,
        Self::RuleError,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotReady => "NOT_READY",
            Self::Closed => "CLOSED",
            Self::Forced => "FORCED",
            Self::RuleError => "RULE_ERROR",
        }
    }
}

impl fmt::Display for SubmitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmitStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownValue::new("submit status", s))
    }
}

/// Per-label outcome within a submit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelStatus {
    Ok,
    Reject,
    Need,
    May,
    Impossible,
}

impl LabelStatus {
    pub const ALL: [Self; 5] = [
        Self::Ok,
        Self::Reject,
        Self::Need,
        Self::May,
        Self::Impossible,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Reject => "REJECT",
            Self::Need => "NEED",
            Self::May => "MAY",
            Self::Impossible => "IMPOSSIBLE",
        }
    }
}

impl FromStr for LabelStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownValue::new("label status", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitLabel {
    pub label: String,
    pub status: LabelStatus,
    pub applied_by: Option<AccountId>,
}

/// Snapshot of the submit rule evaluation stored when a change merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub status: SubmitStatus,
    pub labels: Vec<SubmitLabel>,
    pub error_message: Option<String>,
}

impl SubmitRecord {
    #[must_use]
    pub const fn new(status: SubmitStatus) -> Self {
        Self {
            status,
            labels: Vec::new(),
            error_message: None,
        }
    }
}
