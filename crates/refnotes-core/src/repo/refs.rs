//! Ref naming for change metadata, draft comments and sequences.

use crate::model::{AccountId, ChangeId};

pub const CHANGES_PREFIX: &str = "refs/changes/";
pub const DRAFT_COMMENTS_PREFIX: &str = "refs/draft-comments/";
pub const SEQUENCES_PREFIX: &str = "refs/sequences/";

const META_SUFFIX: &str = "/meta";

/// `refs/changes/<nn>/<id>/meta`
#[must_use]
pub fn change_meta_ref(change: ChangeId) -> String {
    format!("{CHANGES_PREFIX}{}/{change}{META_SUFFIX}", change.shard())
}

/// `refs/draft-comments/<nn>/<id>/`, the prefix of every draft ref of one change.
#[must_use]
pub fn draft_comments_prefix(change: ChangeId) -> String {
    format!("{DRAFT_COMMENTS_PREFIX}{}/{change}/", change.shard())
}

/// `refs/draft-comments/<nn>/<id>/<account>`
#[must_use]
pub fn draft_comments_ref(change: ChangeId, account: AccountId) -> String {
    format!("{}{account}", draft_comments_prefix(change))
}

/// `refs/sequences/<name>`
#[must_use]
pub fn sequence_ref(name: &str) -> String {
    format!("{SEQUENCES_PREFIX}{name}")
}

/// Inverse of [`change_meta_ref`].
#[must_use]
pub fn parse_change_meta_ref(name: &str) -> Option<ChangeId> {
    let rest = name.strip_prefix(CHANGES_PREFIX)?.strip_suffix(META_SUFFIX)?;
    let (shard, id) = rest.split_once('/')?;
    let change: ChangeId = id.parse().ok()?;
    (change.shard() == shard).then_some(change)
}

/// Inverse of [`draft_comments_ref`].
#[must_use]
pub fn parse_draft_comments_ref(name: &str) -> Option<(ChangeId, AccountId)> {
    let rest = name.strip_prefix(DRAFT_COMMENTS_PREFIX)?;
    let mut parts = rest.split('/');
    let shard = parts.next()?;
    let change: ChangeId = parts.next()?.parse().ok()?;
    let account: AccountId = parts.next()?.parse().ok()?;
    if parts.next().is_some() || change.shard() != shard {
        return None;
    }
    Some((change, account))
}
