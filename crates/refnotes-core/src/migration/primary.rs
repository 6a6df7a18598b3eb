//! Per-change switch of the system of record.
//!
//! 1. Take a read-only lease by writing `=<until>` onto the row's token.
//! 2. Rebuild the versioned history until it matches the leased token,
//!    retrying with backoff for at most half the lease.
//! 3. Replace the token with `N` if it still equals the leased token and
//!    the lease has not expired.
//!
//! A failure after step 1 leaves the lease in place; it expires on its own
//! and the change becomes writable again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};

use crate::config::NotesConfig;
use crate::db::RelationalStore;
use crate::error::NotesError;
use crate::model::ChangeId;
use crate::rebuild::ChangeRebuilder;
use crate::retry::{Backoff, retry};
use crate::token::{PrimaryStorage, StateToken};

/// How a change left [`PrimaryStorageMigrator::migrate_to_versioned`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated,
    AlreadyVersioned,
}

pub struct PrimaryStorageMigrator {
    store: Arc<dyn RelationalStore>,
    rebuilder: Arc<ChangeRebuilder>,
    timeout: Duration,
    skew: Duration,
    retry_initial: Duration,
    retry_jitter: Duration,
}

impl PrimaryStorageMigrator {
    #[must_use]
    pub fn new(config: &NotesConfig, store: Arc<dyn RelationalStore>, rebuilder: Arc<ChangeRebuilder>) -> Self {
        Self {
            store,
            rebuilder,
            timeout: config.lease.migration_timeout(),
            skew: config.lease.read_only_skew(),
            retry_initial: Duration::from_millis(config.lease.retry_initial_ms),
            retry_jitter: Duration::from_millis(config.lease.retry_jitter_ms),
        }
    }

    /// Make versioned storage the system of record for `change`.
    ///
    /// # Errors
    ///
    /// - [`NotesError::InvalidUpdate`] if the change does not exist or has
    ///   never been rebuilt.
    /// - [`NotesError::ReadOnly`] if another migrator holds the lease.
    /// - [`NotesError::MigrationAborted`] if the token moved or the lease
    ///   expired before the final swap.
    /// - Rebuild failures that outlived the retry window.
    pub fn migrate_to_versioned(&self, change: ChangeId) -> Result<MigrationOutcome, NotesError> {
        let start = Instant::now();
        let Some(leased) = self.take_lease(change)? else {
            tracing::debug!(change_id = %change, "change already versioned-primary");
            return Ok(MigrationOutcome::AlreadyVersioned);
        };

        let budget = (self.timeout / 2).saturating_sub(start.elapsed());
        let mut backoff = Backoff::new(self.retry_initial, self.retry_jitter, budget);
        let rebuilt = retry(&mut backoff, "ensure rebuilt", || self.ensure_rebuilt(change, &leased))?;

        self.set_versioned_primary(change, &rebuilt)?;
        tracing::info!(
            change_id = %change,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "migrated change to versioned primary"
        );
        Ok(MigrationOutcome::Migrated)
    }

    /// Write the lease. `None` when the change is already versioned-primary.
    fn take_lease(&self, change: ChangeId) -> Result<Option<StateToken>, NotesError> {
        let timeout = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX / 1_000_000);
        let until = Utc::now() + TimeDelta::milliseconds(timeout);
        let mut leased = None;
        let row = self.store.atomic_update(change, &mut |row| {
            let token = StateToken::of_change(row)?.ok_or_else(|| {
                NotesError::InvalidUpdate(format!("change {change} has no state token; rebuild it first"))
            })?;
            token.check_not_read_only(change, Utc::now(), self.skew)?;
            if token.primary() == PrimaryStorage::Versioned {
                return Ok(false);
            }
            row.note_db_state = Some(token.with_read_only_until(until).to_string());
            // Re-read so the lease carries the stored precision.
            leased = StateToken::of_change(row)?;
            Ok(true)
        })?;
        if row.is_none() {
            return Err(NotesError::InvalidUpdate(format!("change {change} does not exist")));
        }
        Ok(leased)
    }

    /// Rebuild if the refs drifted from `leased`; return the token the row
    /// holds afterwards, which keeps the same lease.
    fn ensure_rebuilt(&self, change: ChangeId, leased: &StateToken) -> Result<StateToken, NotesError> {
        if !self.rebuilder.is_stale(change)? {
            return Ok(leased.clone());
        }
        let result = self.rebuilder.rebuild_even_if_read_only(change)?;
        let token = StateToken::parse(change, result.note_db_state.as_deref())?
            .ok_or_else(|| NotesError::InvalidUpdate(format!("rebuild of change {change} left no token")))?;
        if token.read_only_until() != leased.read_only_until() {
            return Err(NotesError::MigrationAborted {
                change,
                detail: format!("lease changed during rebuild: {token} != {leased}"),
            });
        }
        Ok(token)
    }

    fn set_versioned_primary(&self, change: ChangeId, expected: &StateToken) -> Result<(), NotesError> {
        let row = self.store.atomic_update(change, &mut |row| {
            let actual = StateToken::of_change(row)?;
            if actual.as_ref() != Some(expected) {
                return Err(NotesError::MigrationAborted {
                    change,
                    detail: format!(
                        "state changed unexpectedly: {} != {expected}",
                        actual.map_or_else(|| "none".to_string(), |t| t.to_string())
                    ),
                });
            }
            if let Some(until) = expected.read_only_until() {
                if Utc::now() > until {
                    return Err(NotesError::MigrationAborted {
                        change,
                        detail: format!("read-only lease expired at {until}"),
                    });
                }
            }
            row.note_db_state = Some(StateToken::versioned().to_string());
            Ok(true)
        })?;
        if row.is_none() {
            return Err(NotesError::MigrationAborted {
                change,
                detail: "change deleted during migration".to_string(),
            });
        }
        Ok(())
    }
}
