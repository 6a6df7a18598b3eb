use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::{load_config, save_migration_state};
use crate::model::UnknownValue;

/// Global migration state, in the order a migration moves through.
///
/// Comparisons follow declaration order: a later state is strictly "more
/// migrated" than an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MigrationState {
    /// Only the relational store is read and written.
    #[default]
    RelationalOnly,
    /// Relational primary; every write is mirrored into versioned storage.
    Write,
    /// Relational primary; reads also come from versioned storage.
    ReadWrite,
    /// As above, with change ids allocated from the ref-backed sequence.
    ReadWriteSequence,
    /// New changes are created versioned-primary; old ones are being moved.
    ReadWriteVersionedPrimary,
    /// Versioned storage primary for every change; ref updates not fused.
    Versioned,
    /// Versioned only; change and draft ref updates fused, relational disabled.
    VersionedFused,
}

impl MigrationState {
    pub const ALL: [Self; 7] = [
        Self::RelationalOnly,
        Self::Write,
        Self::ReadWrite,
        Self::ReadWriteSequence,
        Self::ReadWriteVersionedPrimary,
        Self::Versioned,
        Self::VersionedFused,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RelationalOnly => "relational-only",
            Self::Write => "write",
            Self::ReadWrite => "read-write",
            Self::ReadWriteSequence => "read-write-sequence",
            Self::ReadWriteVersionedPrimary => "read-write-versioned-primary",
            Self::Versioned => "versioned",
            Self::VersionedFused => "versioned-fused",
        }
    }

    /// Whether change updates are written to versioned storage.
    #[must_use]
    pub fn write_changes(self) -> bool {
        self >= Self::Write
    }

    /// Whether changes are read from versioned storage.
    #[must_use]
    pub fn read_changes(self) -> bool {
        self >= Self::ReadWrite
    }

    #[must_use]
    pub fn sequence_enabled(self) -> bool {
        self >= Self::ReadWriteSequence
    }

    /// Whether newly created changes start versioned-primary.
    #[must_use]
    pub fn new_changes_versioned_primary(self) -> bool {
        self >= Self::ReadWriteVersionedPrimary
    }

    /// Whether every change is versioned-primary.
    #[must_use]
    pub fn versioned_primary(self) -> bool {
        self >= Self::Versioned
    }

    /// Whether change and draft repository updates are fused.
    #[must_use]
    pub fn fuse_updates(self) -> bool {
        self == Self::VersionedFused
    }

    #[must_use]
    pub fn relational_disabled(self) -> bool {
        self == Self::VersionedFused
    }

    /// Next state in the migration, or `None` at the end.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        let index = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(index + 1).copied()
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownValue::new("migration state", s))
    }
}

impl Serialize for MigrationState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MigrationState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------
// Process-wide state
// ----------------------------------------------------------------------

/// The current migration state, shared by every component of a process and
/// optionally persisted to the configuration file on each transition.
#[derive(Debug)]
pub struct GlobalMigration {
    state: RwLock<MigrationState>,
    config_path: Option<PathBuf>,
}

impl GlobalMigration {
    /// In-memory only.
    #[must_use]
    pub const fn new(state: MigrationState) -> Self {
        Self {
            state: RwLock::new(state),
            config_path: None,
        }
    }

    /// Read the state from `path` and write every transition back to it.
    ///
    /// # Errors
    ///
    /// The file exists but cannot be read or parsed.
    pub fn persisted(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self {
            state: RwLock::new(config.migration.state),
            config_path: Some(path.to_path_buf()),
        })
    }

    #[must_use]
    pub fn get(&self) -> MigrationState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move from `expected` to `next`.
    ///
    /// # Errors
    ///
    /// The current state is not `expected`, `next` would move backwards, or
    /// the configuration file cannot be written.
    pub fn advance(&self, expected: MigrationState, next: MigrationState) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != expected {
            bail!("cannot move to {next}: expected state {expected}, found {}", *state);
        }
        if next < expected {
            bail!("migration state cannot move backwards from {expected} to {next}");
        }
        if let Some(path) = &self.config_path {
            save_migration_state(path, next)?;
        }
        *state = next;
        tracing::info!(from = %expected, to = %next, "migration state changed");
        Ok(())
    }
}
