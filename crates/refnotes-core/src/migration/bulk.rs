//! Rebuilding many changes on a bounded worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel;

use crate::db::RelationalStore;
use crate::error::NotesError;
use crate::model::ChangeId;
use crate::rebuild::ChangeRebuilder;

/// What a bulk run did, per change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub rebuilt: usize,
    /// Already matched their token; nothing written.
    pub up_to_date: usize,
    /// Changes that cannot be rebuilt at all (no patch sets), or were never
    /// reached because the run was cancelled.
    pub skipped: usize,
    /// `(change, error)` in completion order.
    pub failures: Vec<(ChangeId, String)>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl BulkReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.rebuilt + self.up_to_date + self.skipped + self.failures.len()
    }
}

enum Outcome {
    Rebuilt,
    UpToDate,
    Skipped,
    Failed(NotesError),
}

pub struct BulkRebuilder {
    rebuilder: Arc<ChangeRebuilder>,
    store: Arc<dyn RelationalStore>,
    threads: usize,
    force: bool,
    cancel: Arc<AtomicBool>,
}

impl BulkRebuilder {
    #[must_use]
    pub fn new(rebuilder: Arc<ChangeRebuilder>, store: Arc<dyn RelationalStore>, threads: usize) -> Self {
        Self {
            rebuilder,
            store,
            threads: threads.max(1),
            force: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Rebuild every change, not only stale ones.
    #[must_use]
    pub const fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Share a cancellation flag owned by a larger driver.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag checked by workers between changes. Setting it stops the run
    /// after the changes already in progress.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Rebuild every change in the relational store.
    ///
    /// # Errors
    ///
    /// Only if the change list cannot be read; per-change failures are
    /// collected in the report.
    pub fn rebuild_all(&self) -> Result<BulkReport> {
        let ids = self.store.change_ids().context("listing changes to rebuild")?;
        Ok(self.rebuild(&ids))
    }

    /// Rebuild `ids`, each change on exactly one worker.
    #[must_use]
    pub fn rebuild(&self, ids: &[ChangeId]) -> BulkReport {
        let start = Instant::now();
        let outcomes = fan_out(ids, self.threads, &self.cancel, |change| self.rebuild_one(change));

        let mut report = BulkReport::default();
        for (change, outcome) in outcomes {
            match outcome {
                Outcome::Rebuilt => report.rebuilt += 1,
                Outcome::UpToDate => report.up_to_date += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed(err) => report.failures.push((change, err.to_string())),
            }
        }
        report.cancelled = self.cancel.load(Ordering::Relaxed);
        report.skipped += ids.len().saturating_sub(report.total());
        report.elapsed = start.elapsed();

        tracing::info!(
            changes = ids.len(),
            rebuilt = report.rebuilt,
            up_to_date = report.up_to_date,
            skipped = report.skipped,
            failed = report.failures.len(),
            cancelled = report.cancelled,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "bulk rebuild finished"
        );
        report
    }

    fn rebuild_one(&self, change: ChangeId) -> Outcome {
        let result = if self.force {
            self.rebuilder.rebuild(change).map(|_| true)
        } else {
            self.rebuilder.is_stale(change).and_then(|stale| {
                if stale {
                    self.rebuilder.rebuild(change).map(|_| true)
                } else {
                    Ok(false)
                }
            })
        };
        match result {
            Ok(true) => Outcome::Rebuilt,
            Ok(false) => Outcome::UpToDate,
            Err(NotesError::NoPatchSets(_)) => {
                tracing::warn!(change_id = %change, "skipping change without patch sets");
                Outcome::Skipped
            }
            Err(err) => {
                tracing::error!(change_id = %change, error = %err, "rebuild failed");
                Outcome::Failed(err)
            }
        }
    }
}

/// Run `work` for each id on `threads` scoped workers fed through a bounded
/// channel. Ids not yet started when `cancel` is set are dropped; the
/// result holds only the ids that ran, in completion order.
pub(crate) fn fan_out<T, F>(ids: &[ChangeId], threads: usize, cancel: &AtomicBool, work: F) -> Vec<(ChangeId, T)>
where
    T: Send,
    F: Fn(ChangeId) -> T + Sync,
{
    let threads = threads.max(1);
    let (work_tx, work_rx) = channel::bounded::<ChangeId>(threads * 2);
    let (done_tx, done_rx) = channel::unbounded::<(ChangeId, T)>();
    let work = &work;

    thread::scope(|scope| {
        for _ in 0..threads {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                for change in work_rx {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    if done_tx.send((change, work(change))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);
        drop(work_rx);

        for &change in ids {
            if cancel.load(Ordering::Relaxed) || work_tx.send(change).is_err() {
                break;
            }
        }
        drop(work_tx);
    });

    done_rx.into_iter().collect()
}
