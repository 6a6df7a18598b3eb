//! Monotonic id allocation backed by a ref.
//!
//! `refs/sequences/<name>` points at a blob holding the next unreserved
//! value in decimal. A process reserves a batch by compare-and-swapping the
//! ref to a blob holding `value + batch`, then hands ids out of its local
//! `[counter, limit)` window without touching the repository.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::SequenceConfig;
use crate::error::NotesError;
use crate::repo::{ObjectId, ObjectKind, RefUpdate, RefUpdateOutcome, Repository, refs};
use crate::retry::{Backoff, retry};

/// Sequence that allocates change ids.
pub const CHANGES: &str = "changes";

#[derive(Debug, Default)]
struct Window {
    counter: u64,
    limit: u64,
}

impl Window {
    const fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.counter)
    }
}

pub struct RepoSequence {
    repo: Arc<dyn Repository>,
    ref_name: String,
    batch_size: u64,
    start: u64,
    retry_initial: Duration,
    retry_jitter: Duration,
    retry_deadline: Duration,
    window: Mutex<Window>,
}

impl RepoSequence {
    /// A sequence stored in `repo`, normally the server-wide repository.
    #[must_use]
    pub fn new(config: &SequenceConfig, repo: Arc<dyn Repository>, name: &str) -> Self {
        Self {
            repo,
            ref_name: refs::sequence_ref(name),
            batch_size: u64::from(config.batch_size.max(1)),
            start: config.start,
            retry_initial: Duration::from_millis(config.retry_initial_ms),
            retry_jitter: Duration::from_millis(config.retry_jitter_ms),
            retry_deadline: Duration::from_millis(config.retry_deadline_ms),
            window: Mutex::new(Window::default()),
        }
    }

    #[must_use]
    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    /// Next id. Ids from one instance strictly increase; ids across all
    /// instances sharing the ref are pairwise distinct.
    ///
    /// # Errors
    ///
    /// - [`NotesError::CorruptSequence`] if the stored value is not a number.
    /// - [`NotesError::Concurrency`] if the ref stayed contended past the
    ///   retry deadline.
    /// - [`NotesError::Storage`] on backend failure.
    pub fn next(&self) -> Result<u64, NotesError> {
        let mut window = self.lock();
        if window.remaining() == 0 {
            self.refill(&mut window, self.batch_size)?;
        }
        let id = window.counter;
        window.counter += 1;
        Ok(id)
    }

    /// `count` ids in increasing order. What is left of the local window is
    /// used first; the rest comes from one reservation of at least a batch.
    ///
    /// # Errors
    ///
    /// As [`Self::next`].
    pub fn next_n(&self, count: usize) -> Result<Vec<u64>, NotesError> {
        let mut ids = Vec::with_capacity(count);
        let wanted = u64::try_from(count).unwrap_or(u64::MAX);
        let mut window = self.lock();

        let local = window.remaining().min(wanted);
        ids.extend(window.counter..window.counter + local);
        window.counter += local;

        let missing = wanted - local;
        if missing > 0 {
            self.refill(&mut window, missing.max(self.batch_size))?;
            ids.extend(window.counter..window.counter + missing);
            window.counter += missing;
        }
        Ok(ids)
    }

    /// The stored next value, without reserving anything.
    ///
    /// # Errors
    ///
    /// [`NotesError::CorruptSequence`] or [`NotesError::Storage`].
    pub fn current(&self) -> Result<u64, NotesError> {
        Ok(self.read()?.1)
    }

    /// Raise the stored value to at least `value`. Returns whether the ref
    /// was written. Used to seed a sequence above ids handed out elsewhere.
    ///
    /// # Errors
    ///
    /// As [`Self::next`].
    pub fn advance_to(&self, value: u64) -> Result<bool, NotesError> {
        let mut backoff = self.backoff();
        retry(&mut backoff, "sequence advance", || {
            let (old, current) = self.read()?;
            if current >= value && !old.is_zero() {
                return Ok(false);
            }
            self.store(old, value.max(current))?;
            Ok(true)
        })
        .inspect(|written| {
            if *written {
                tracing::info!(ref_name = %self.ref_name, value, "advanced sequence");
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_initial, self.retry_jitter, self.retry_deadline)
    }

    /// Reserve `count` values from the ref and make them the local window.
    fn refill(&self, window: &mut Window, count: u64) -> Result<(), NotesError> {
        let mut backoff = self.backoff();
        let start = retry(&mut backoff, "sequence acquire", || {
            let (old, value) = self.read()?;
            let next = value.checked_add(count).ok_or_else(|| NotesError::CorruptSequence {
                ref_name: self.ref_name.clone(),
                value: format!("{value} + {count} overflows"),
            })?;
            self.store(old, next)?;
            Ok(value)
        })?;
        tracing::info!(
            ref_name = %self.ref_name,
            start,
            count,
            attempts = backoff.attempts(),
            "acquired sequence batch"
        );
        window.counter = start;
        window.limit = start + count;
        Ok(())
    }

    /// Current blob id (zero when absent) and parsed value.
    fn read(&self) -> Result<(ObjectId, u64), NotesError> {
        let storage = |e| NotesError::storage(&self.ref_name, e);
        let Some(id) = self.repo.read_ref(&self.ref_name).map_err(storage)? else {
            return Ok((ObjectId::ZERO, self.start));
        };
        let bytes = self.repo.read_blob(id).map_err(storage)?;
        let text = String::from_utf8_lossy(&bytes);
        let value = text.trim().parse::<u64>().map_err(|_| NotesError::CorruptSequence {
            ref_name: self.ref_name.clone(),
            value: text.trim().to_string(),
        })?;
        Ok((id, value))
    }

    fn store(&self, old: ObjectId, value: u64) -> Result<(), NotesError> {
        let storage = |e| NotesError::storage(&self.ref_name, e);
        let blob = self
            .repo
            .write_object(ObjectKind::Blob, value.to_string().as_bytes())
            .map_err(storage)?;
        let outcomes = self
            .repo
            .update_refs(&[RefUpdate::new(&self.ref_name, old, blob)])
            .map_err(storage)?;
        match outcomes.first() {
            Some(RefUpdateOutcome::Ok) => Ok(()),
            Some(outcome) => Err(NotesError::concurrency(&self.ref_name, outcome.to_string())),
            None => Err(NotesError::concurrency(&self.ref_name, "no outcome reported")),
        }
    }
}
