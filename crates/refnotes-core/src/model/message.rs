use chrono::{DateTime, Utc};

use super::{AccountId, PatchSetId};

/// A free-text message posted on a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMessage {
    /// Stable key; for messages read back from a ref this is the commit id.
    pub key: String,
    /// `None` for messages written by the server itself.
    pub author: Option<AccountId>,
    /// Account that actually acted when `author` was impersonated.
    pub real_author: Option<AccountId>,
    pub written_on: DateTime<Utc>,
    pub message: String,
    pub patch_set: Option<PatchSetId>,
    pub tag: Option<String>,
}
