use chrono::{DateTime, Utc};

use super::{AccountId, PatchSetId};
use crate::repo::ObjectId;

/// Visibility state carried in the `Patch-set` footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PatchSetState {
    #[default]
    Published,
    Deleted,
}

impl PatchSetState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [Self::Published, Self::Deleted]
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
    }
}

/// One uploaded revision of a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSet {
    pub id: PatchSetId,
    pub revision: ObjectId,
    pub uploader: AccountId,
    pub created_on: DateTime<Utc>,
    pub groups: Vec<String>,
    pub push_certificate: Option<String>,
    pub description: Option<String>,
}

impl PatchSet {
    #[must_use]
    pub const fn new(
        id: PatchSetId,
        revision: ObjectId,
        uploader: AccountId,
        created_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            revision,
            uploader,
            created_on,
            groups: Vec::new(),
            push_certificate: None,
            description: None,
        }
    }
}
