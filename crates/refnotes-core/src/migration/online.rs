//! Driving the global migration from relational-only to versioned-fused.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use anyhow::{Context, Result, bail};

use crate::config::NotesConfig;
use crate::db::RelationalStore;
use crate::model::ChangeId;
use crate::rebuild::ChangeRebuilder;
use crate::repo::RepoManager;
use crate::sequence::{self, RepoSequence};

use super::bulk::{BulkRebuilder, fan_out};
use super::primary::PrimaryStorageMigrator;
use super::state::{GlobalMigration, MigrationState};

pub struct OnlineMigrator {
    config: NotesConfig,
    repos: Arc<dyn RepoManager>,
    store: Arc<dyn RelationalStore>,
    rebuilder: Arc<ChangeRebuilder>,
    global: Arc<GlobalMigration>,
    stop_at: Option<MigrationState>,
    cancel: Arc<AtomicBool>,
}

impl OnlineMigrator {
    #[must_use]
    pub fn new(
        config: &NotesConfig,
        repos: Arc<dyn RepoManager>,
        store: Arc<dyn RelationalStore>,
        global: Arc<GlobalMigration>,
    ) -> Self {
        let rebuilder = Arc::new(ChangeRebuilder::new(config, Arc::clone(&repos), Arc::clone(&store)));
        Self {
            config: config.clone(),
            repos,
            store,
            rebuilder,
            global,
            stop_at: config.migration.stop_at,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop once the global state reaches `state`.
    #[must_use]
    pub const fn stopping_at(mut self, state: MigrationState) -> Self {
        self.stop_at = Some(state);
        self
    }

    /// Flag checked between changes by the bulk steps.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Advance one step at a time until the end state or the stop state.
    /// Each step is safe to re-run after a failure.
    ///
    /// # Errors
    ///
    /// The first step that fails, with the state it was leaving as context.
    pub fn migrate(&self) -> Result<MigrationState> {
        let start = Instant::now();
        loop {
            let state = self.global.get();
            if self.stop_at == Some(state) {
                tracing::info!(state = %state, "migration stopped at requested state");
                return Ok(state);
            }
            let next = match state {
                MigrationState::RelationalOnly => MigrationState::Write,
                MigrationState::Write => {
                    self.rebuild_all()?;
                    MigrationState::ReadWrite
                }
                MigrationState::ReadWrite => {
                    self.enable_sequence()?;
                    MigrationState::ReadWriteSequence
                }
                // New changes start versioned-primary before old ones move.
                MigrationState::ReadWriteSequence => MigrationState::ReadWriteVersionedPrimary,
                MigrationState::ReadWriteVersionedPrimary => {
                    self.migrate_primary_storage()?;
                    MigrationState::Versioned
                }
                MigrationState::Versioned => MigrationState::VersionedFused,
                MigrationState::VersionedFused => {
                    tracing::info!(
                        elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "migration complete"
                    );
                    return Ok(state);
                }
            };
            self.global
                .advance(state, next)
                .with_context(|| format!("leaving migration state {state}"))?;
        }
    }

    fn rebuild_all(&self) -> Result<()> {
        let bulk = BulkRebuilder::new(
            Arc::clone(&self.rebuilder),
            Arc::clone(&self.store),
            self.config.rebuild.threads,
        )
        .forced()
        .with_cancel(Arc::clone(&self.cancel));
        let report = bulk.rebuild_all()?;
        if !report.is_success() {
            for (change, err) in &report.failures {
                tracing::warn!(change_id = %change, error = %err, "change failed to rebuild");
            }
            bail!(
                "rebuilding failed for {} of {} changes{}",
                report.failures.len(),
                report.total(),
                if report.cancelled { " (cancelled)" } else { "" }
            );
        }
        Ok(())
    }

    /// Seed the change sequence above every id the relational store has
    /// handed out, plus a gap for ids allocated while this step runs.
    fn enable_sequence(&self) -> Result<()> {
        let next = self.store.next_change_id().context("reading relational change counter")?;
        let repo = self
            .repos
            .create(&self.config.repos.all_projects)
            .with_context(|| format!("opening {}", self.config.repos.all_projects))?;
        let seq = RepoSequence::new(&self.config.sequence, repo, sequence::CHANGES);
        let value = next.saturating_add(self.config.migration.sequence_gap);
        seq.advance_to(value)
            .with_context(|| format!("seeding {} to {value}", seq.ref_name()))?;
        Ok(())
    }

    fn migrate_primary_storage(&self) -> Result<()> {
        let migrator = PrimaryStorageMigrator::new(&self.config, Arc::clone(&self.store), Arc::clone(&self.rebuilder));
        let ids = self.store.change_ids().context("listing changes to migrate")?;
        let start = Instant::now();
        let results = fan_out(&ids, self.config.rebuild.threads, &self.cancel, |change| {
            match migrator.migrate_to_versioned(change) {
                Ok(_) => Ok(()),
                Err(err) if self.can_skip(change) => {
                    tracing::warn!(change_id = %change, error = %err, "skipping primary storage migration");
                    Ok(())
                }
                Err(err) => {
                    tracing::error!(change_id = %change, error = %err, "primary storage migration failed");
                    Err(err)
                }
            }
        });

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        tracing::info!(
            changes = ids.len(),
            failed,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "migrated primary storage"
        );
        if failed > 0 {
            bail!("migrating primary storage failed for {failed} of {} changes", ids.len());
        }
        if results.len() < ids.len() {
            bail!("primary storage migration cancelled after {} of {} changes", results.len(), ids.len());
        }
        Ok(())
    }

    /// A change that could never be rebuilt has nothing to migrate.
    fn can_skip(&self, change: ChangeId) -> bool {
        match self.store.bundle(change) {
            Ok(Some(bundle)) => bundle.patch_sets.is_empty(),
            Ok(None) => true,
            Err(err) => {
                tracing::error!(change_id = %change, error = %err, "cannot check whether change is skippable");
                false
            }
        }
    }
}
