//! The change state token stored in the relational `note_db_state` column.
//!
//! While the relational store is primary, the token records the ref tips
//! the versioned copy of a change is expected to have:
//!
//! ```text
//! <meta-sha>[,<account>=<draft-sha>]*[=<read-only-until-ms>]
//! ```
//!
//! Drafts are sorted by numeric account id. Once versioned storage is
//! primary the token degrades to `N` (or `N=<read-only-until-ms>`) and no
//! longer tracks tips.
//!
//! Writers compare the token they read against live refs before writing
//! (optimistic concurrency) and record the new tips in the same relational
//! transaction as the row update.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::NotesError;
use crate::model::{AccountId, Change, ChangeId};
use crate::repo::{ObjectId, Repository, refs};

const VERSIONED_PRIMARY: &str = "N";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimaryStorage {
    Relational,
    Versioned,
}

/// Expected tips of a change's meta ref and its draft refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefState {
    pub change_meta: ObjectId,
    pub drafts: BTreeMap<AccountId, ObjectId>,
}

impl RefState {
    #[must_use]
    pub fn new(change_meta: ObjectId, drafts: BTreeMap<AccountId, ObjectId>) -> Self {
        Self {
            change_meta,
            drafts: drafts.into_iter().filter(|(_, id)| !id.is_zero()).collect(),
        }
    }

    #[must_use]
    pub fn is_change_up_to_date(&self, live_meta: ObjectId) -> bool {
        self.change_meta == live_meta
    }

    /// Every recorded draft tip matches, and no live draft ref is unrecorded.
    #[must_use]
    pub fn are_drafts_up_to_date(&self, live_drafts: &BTreeMap<AccountId, ObjectId>) -> bool {
        self.drafts == *live_drafts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateToken {
    primary: PrimaryStorage,
    refs: Option<RefState>,
    read_only_until: Option<DateTime<Utc>>,
}

impl StateToken {
    #[must_use]
    pub const fn relational(refs: RefState) -> Self {
        Self {
            primary: PrimaryStorage::Relational,
            refs: Some(refs),
            read_only_until: None,
        }
    }

    #[must_use]
    pub const fn versioned() -> Self {
        Self {
            primary: PrimaryStorage::Versioned,
            refs: None,
            read_only_until: None,
        }
    }

    /// Parse a stored token. An absent or blank column is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`NotesError::Token`] for anything that does not match the grammar.
    pub fn parse(change: ChangeId, value: Option<&str>) -> Result<Option<Self>, NotesError> {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let invalid = || NotesError::Token {
            change,
            value: value.to_string(),
        };

        // The lease suffix is the only `=`-separated part that is not a 40
        // character object id.
        let (body, read_only_until) = match value.rsplit_once('=') {
            Some((head, tail)) if tail.len() != ObjectId::LEN * 2 => {
                let millis: i64 = tail.parse().map_err(|_| invalid())?;
                let until = DateTime::from_timestamp_millis(millis).ok_or_else(invalid)?;
                (head, Some(until))
            }
            _ => (value, None),
        };

        if body == VERSIONED_PRIMARY {
            return Ok(Some(Self {
                primary: PrimaryStorage::Versioned,
                refs: None,
                read_only_until,
            }));
        }

        let mut parts = body.split(',');
        let meta = parts.next().ok_or_else(invalid)?;
        let change_meta = ObjectId::from_hex(meta).map_err(|_| invalid())?;
        let mut drafts = BTreeMap::new();
        for part in parts {
            let (account, sha) = part.split_once('=').ok_or_else(invalid)?;
            let account: AccountId = account.parse().map_err(|_| invalid())?;
            let sha = ObjectId::from_hex(sha).map_err(|_| invalid())?;
            if drafts.insert(account, sha).is_some() {
                return Err(invalid());
            }
        }
        Ok(Some(Self {
            primary: PrimaryStorage::Relational,
            refs: Some(RefState::new(change_meta, drafts)),
            read_only_until,
        }))
    }

    /// Parse the token column of a change row.
    ///
    /// # Errors
    ///
    /// As [`Self::parse`].
    pub fn of_change(change: &Change) -> Result<Option<Self>, NotesError> {
        Self::parse(change.id, change.note_db_state.as_deref())
    }

    #[must_use]
    pub const fn primary(&self) -> PrimaryStorage {
        self.primary
    }

    #[must_use]
    pub const fn refs(&self) -> Option<&RefState> {
        self.refs.as_ref()
    }

    #[must_use]
    pub const fn read_only_until(&self) -> Option<DateTime<Utc>> {
        self.read_only_until
    }

    #[must_use]
    pub fn with_read_only_until(mut self, until: DateTime<Utc>) -> Self {
        self.read_only_until = Some(until);
        self
    }

    /// Whether a lease is in force at `now`, allowing `skew` of clock drift
    /// between servers.
    #[must_use]
    pub fn is_read_only(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.read_only_until.is_some_and(|until| {
            let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
            now < until + skew
        })
    }

    /// # Errors
    ///
    /// [`NotesError::ReadOnly`] while a lease is in force.
    pub fn check_not_read_only(
        &self,
        change: ChangeId,
        now: DateTime<Utc>,
        skew: Duration,
    ) -> Result<(), NotesError> {
        match self.read_only_until {
            Some(until) if self.is_read_only(now, skew) => Err(NotesError::ReadOnly { change, until }),
            _ => Ok(()),
        }
    }

    /// Whether the live refs match the recorded tips. A versioned-primary
    /// token records no tips and is always current.
    #[must_use]
    pub fn is_up_to_date(&self, live: &LiveRefs) -> bool {
        self.refs.as_ref().is_none_or(|refs| {
            refs.is_change_up_to_date(live.change_meta) && refs.are_drafts_up_to_date(&live.drafts)
        })
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.primary, &self.refs) {
            (PrimaryStorage::Relational, Some(refs)) => {
                write!(f, "{}", refs.change_meta)?;
                for (account, sha) in &refs.drafts {
                    write!(f, ",{account}={sha}")?;
                }
            }
            _ => f.write_str(VERSIONED_PRIMARY)?,
        }
        if let Some(until) = self.read_only_until {
            write!(f, "={}", until.timestamp_millis())?;
        }
        Ok(())
    }
}

/// Live tips of one change's refs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveRefs {
    /// Zero when the meta ref is absent.
    pub change_meta: ObjectId,
    pub drafts: BTreeMap<AccountId, ObjectId>,
}

impl LiveRefs {
    /// Read the meta ref from the change repository and every draft ref of
    /// the change from the draft repository.
    ///
    /// # Errors
    ///
    /// Storage failure.
    pub fn read(
        change: ChangeId,
        change_repo: &dyn Repository,
        draft_repo: &dyn Repository,
    ) -> Result<Self, NotesError> {
        let meta_ref = refs::change_meta_ref(change);
        let change_meta = change_repo
            .read_ref(&meta_ref)
            .map_err(|e| NotesError::storage(&meta_ref, e))?
            .unwrap_or(ObjectId::ZERO);

        let prefix = refs::draft_comments_prefix(change);
        let drafts = draft_repo
            .scan_refs(&prefix)
            .map_err(|e| NotesError::storage(&prefix, e))?
            .into_iter()
            .filter_map(|(name, id)| {
                let (_, account) = refs::parse_draft_comments_ref(&name)?;
                Some((account, id))
            })
            .collect();
        Ok(Self {
            change_meta,
            drafts,
        })
    }
}

/// Ref tips produced by one batch for one change. `None` for the meta ref
/// means the batch did not touch it; a zero id means the ref was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenDelta {
    pub new_change_meta: Option<ObjectId>,
    pub new_drafts: BTreeMap<AccountId, ObjectId>,
    /// Forget every draft tip the old token carried before merging. Set by
    /// a full rebuild, which rewrites all of a change's refs.
    pub replace_drafts: bool,
}

impl TokenDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_change_meta.is_none() && self.new_drafts.is_empty()
    }
}

/// Fold a batch's ref tips into a change row's token, in memory.
///
/// - No stored token and no new meta tip: nothing is tracked yet, the row
///   is left alone.
/// - Versioned-primary token: unchanged.
/// - Zero meta tip: the change's versioned copy is gone, the token is cleared.
/// - Otherwise the meta tip is replaced (if given) and draft tips merged, a
///   zero draft tip removing that account's entry. With `replace_drafts`
///   the old draft tips are dropped first. The primary storage and
///   any read-only lease are kept.
///
/// Returns the token now stored on the row.
///
/// # Errors
///
/// The stored token is malformed.
pub fn apply_delta(change: &mut Change, delta: &TokenDelta) -> Result<Option<StateToken>, NotesError> {
    let old = StateToken::of_change(change)?;
    if old.is_none() && delta.new_change_meta.is_none() {
        return Ok(None);
    }
    if old.as_ref().is_some_and(|o| o.primary == PrimaryStorage::Versioned) {
        return Ok(old);
    }

    let change_meta = match delta.new_change_meta {
        Some(meta) if meta.is_zero() => {
            change.note_db_state = None;
            return Ok(None);
        }
        Some(meta) => meta,
        None => old
            .as_ref()
            .and_then(|o| o.refs.as_ref())
            .map_or(ObjectId::ZERO, |r| r.change_meta),
    };

    let mut drafts = old
        .as_ref()
        .filter(|_| !delta.replace_drafts)
        .and_then(|o| o.refs.as_ref())
        .map(|r| r.drafts.clone())
        .unwrap_or_default();
    for (account, tip) in &delta.new_drafts {
        if tip.is_zero() {
            drafts.remove(account);
        } else {
            drafts.insert(*account, *tip);
        }
    }

    let token = StateToken {
        primary: PrimaryStorage::Relational,
        refs: Some(RefState::new(change_meta, drafts)),
        read_only_until: old.and_then(|o| o.read_only_until),
    };
    change.note_db_state = Some(token.to_string());
    Ok(Some(token))
}
