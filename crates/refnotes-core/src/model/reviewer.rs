use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use super::{AccountId, UnknownValue};

/// Reviewer state as recorded by the `Reviewer`, `CC` and `Removed` footers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReviewerState {
    Reviewer,
    Cc,
    Removed,
}

impl ReviewerState {
    pub const ALL: [Self; 3] = [Self::Reviewer, Self::Cc, Self::Removed];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reviewer => "REVIEWER",
            Self::Cc => "CC",
            Self::Removed => "REMOVED",
        }
    }
}

impl fmt::Display for ReviewerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewerState {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownValue::new("reviewer state", s))
    }
}

/// Latest reviewer state per account, with the time it was set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewerSet {
    table: BTreeMap<AccountId, (ReviewerState, DateTime<Utc>)>,
}

impl ReviewerSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// Record a state. Returns `false` when the account already had a state,
    /// leaving the existing entry untouched (first write wins).
    pub fn put_if_absent(
        &mut self,
        account: AccountId,
        state: ReviewerState,
        when: DateTime<Utc>,
    ) -> bool {
        if self.table.contains_key(&account) {
            return false;
        }
        self.table.insert(account, (state, when));
        true
    }

    pub fn put(&mut self, account: AccountId, state: ReviewerState, when: DateTime<Utc>) {
        self.table.insert(account, (state, when));
    }

    #[must_use]
    pub fn state_of(&self, account: AccountId) -> Option<ReviewerState> {
        self.table.get(&account).map(|(state, _)| *state)
    }

    #[must_use]
    pub fn by_state(&self, state: ReviewerState) -> BTreeSet<AccountId> {
        self.table
            .iter()
            .filter(|(_, (s, _))| *s == state)
            .map(|(account, _)| *account)
            .collect()
    }

    /// Every account with any state.
    #[must_use]
    pub fn accounts(&self) -> BTreeSet<AccountId> {
        self.table.keys().copied().collect()
    }

    /// Drop every account whose latest state is `REMOVED`.
    pub fn prune_removed(&mut self) {
        self.table.retain(|_, (state, _)| *state != ReviewerState::Removed);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AccountId, ReviewerState, DateTime<Utc>)> + '_ {
        self.table
            .iter()
            .map(|(account, (state, when))| (*account, *state, *when))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_wins_and_prune_drops_removed() {
        let now = Utc::now();
        let mut set = ReviewerSet::new();
        assert!(set.put_if_absent(AccountId::new(1), ReviewerState::Removed, now));
        assert!(!set.put_if_absent(AccountId::new(1), ReviewerState::Reviewer, now));
        set.put_if_absent(AccountId::new(2), ReviewerState::Cc, now);

        assert_eq!(set.state_of(AccountId::new(1)), Some(ReviewerState::Removed));
        set.prune_removed();
        assert_eq!(set.accounts(), BTreeSet::from([AccountId::new(2)]));
        assert_eq!(set.by_state(ReviewerState::Cc).len(), 1);
    }

    #[test]
    fn state_parse_is_case_insensitive() {
        assert_eq!("cc".parse::<ReviewerState>(), Ok(ReviewerState::Cc));
        assert!("owner".parse::<ReviewerState>().is_err());
    }
}
