//! Engine configuration.
//!
//! One [`NotesConfig`] is loaded at startup and passed by reference (or in an
//! `Arc`) to every component. Nothing reads configuration from ambient state.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::migration::MigrationState;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotesConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub rebuild: RebuildConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub repos: RepoNamesConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
}

/// Server identity used for committer lines and account emails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Host part of every `<account>@<server_id>` identity. Changing it makes
    /// existing histories unreadable.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_server_email")]
    pub server_email: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            server_name: default_server_name(),
            server_email: default_server_email(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub state: MigrationState,
    /// Reject every change write. Set while an offline step runs.
    #[serde(default)]
    pub disable_change_writes: bool,
    /// Rebuild stale changes on read while relational storage is primary.
    #[serde(default = "default_true")]
    pub auto_rebuild: bool,
    /// Ids skipped when seeding the change sequence from the relational
    /// counter, so in-flight relational allocations cannot collide.
    #[serde(default = "default_sequence_gap")]
    pub sequence_gap: u64,
    /// Stop the online migrator once this state is reached.
    #[serde(default)]
    pub stop_at: Option<MigrationState>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            state: MigrationState::default(),
            disable_change_writes: false,
            auto_rebuild: default_true(),
            sequence_gap: default_sequence_gap(),
            stop_at: None,
        }
    }
}

/// Event grouping windows and bulk parallelism for the rebuilder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Longest span between the first and last event of one commit.
    #[serde(default = "default_max_window_ms")]
    pub max_window_ms: u64,
    /// Longest gap between two consecutive events of one commit.
    #[serde(default = "default_max_delta_ms")]
    pub max_delta_ms: u64,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl RebuildConfig {
    #[must_use]
    pub const fn max_window(&self) -> Duration {
        Duration::from_millis(self.max_window_ms)
    }

    #[must_use]
    pub const fn max_delta(&self) -> Duration {
        Duration::from_millis(self.max_delta_ms)
    }
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            max_window_ms: default_max_window_ms(),
            max_delta_ms: default_max_delta_ms(),
            threads: default_threads(),
        }
    }
}

/// Read-only lease taken while one change's primary storage moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_migration_timeout_ms")]
    pub migration_timeout_ms: u64,
    /// Allowed clock skew between servers when checking lease expiry.
    #[serde(default = "default_read_only_skew_ms")]
    pub read_only_skew_ms: u64,
    #[serde(default = "default_lease_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub retry_jitter_ms: u64,
}

impl LeaseConfig {
    #[must_use]
    pub const fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }

    #[must_use]
    pub const fn read_only_skew(&self) -> Duration {
        Duration::from_millis(self.read_only_skew_ms)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            migration_timeout_ms: default_migration_timeout_ms(),
            read_only_skew_ms: default_read_only_skew_ms(),
            retry_initial_ms: default_lease_retry_initial_ms(),
            retry_jitter_ms: default_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Value assumed when the sequence ref does not exist yet.
    #[serde(default = "default_sequence_start")]
    pub start: u64,
    #[serde(default = "default_sequence_deadline_ms")]
    pub retry_deadline_ms: u64,
    #[serde(default = "default_sequence_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub retry_jitter_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            start: default_sequence_start(),
            retry_deadline_ms: default_sequence_deadline_ms(),
            retry_initial_ms: default_sequence_retry_initial_ms(),
            retry_jitter_ms: default_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoNamesConfig {
    /// Repository holding every user's draft comment refs.
    #[serde(default = "default_all_users")]
    pub all_users: String,
    /// Repository holding server-wide refs such as sequences.
    #[serde(default = "default_all_projects")]
    pub all_projects: String,
}

impl Default for RepoNamesConfig {
    fn default() -> Self {
        Self {
            all_users: default_all_users(),
            all_projects: default_all_projects(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RewriteConfig {
    /// Permit rewriting published history to replace a comment's text.
    #[serde(default)]
    pub allow_comment_rewrite: bool,
}

/// Load configuration from a TOML file. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<NotesConfig> {
    if !path.exists() {
        return Ok(NotesConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<NotesConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Rewrite `migration.state` in the TOML file at `path`, keeping every other
/// key. The file is created if absent.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or written.
pub fn save_migration_state(path: &Path, state: MigrationState) -> Result<()> {
    let mut doc = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        content
            .parse::<toml::Table>()
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        toml::Table::new()
    };

    let section = doc
        .entry("migration")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let Some(section) = section.as_table_mut() else {
        anyhow::bail!("[migration] in {} is not a table", path.display());
    };
    section.insert("state".to_string(), toml::Value::String(state.as_str().to_string()));

    let rendered = toml::to_string_pretty(&doc).context("Failed to render configuration")?;
    std::fs::write(path, rendered).with_context(|| format!("Failed to write {}", path.display()))
}

const fn default_true() -> bool {
    true
}

fn default_server_id() -> String {
    "refnotes".to_string()
}

fn default_server_name() -> String {
    "Code Review".to_string()
}

fn default_server_email() -> String {
    "noreply@refnotes".to_string()
}

const fn default_sequence_gap() -> u64 {
    1000
}

const fn default_max_window_ms() -> u64 {
    3000
}

const fn default_max_delta_ms() -> u64 {
    1000
}

const fn default_threads() -> usize {
    4
}

const fn default_migration_timeout_ms() -> u64 {
    60_000
}

const fn default_read_only_skew_ms() -> u64 {
    1000
}

const fn default_lease_retry_initial_ms() -> u64 {
    250
}

const fn default_jitter_ms() -> u64 {
    50
}

const fn default_batch_size() -> u32 {
    20
}

const fn default_sequence_start() -> u64 {
    1
}

const fn default_sequence_deadline_ms() -> u64 {
    30_000
}

const fn default_sequence_retry_initial_ms() -> u64 {
    5
}

fn default_all_users() -> String {
    "All-Users".to_string()
}

fn default_all_projects() -> String {
    "All-Projects".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = load_config(&dir.path().join("refnotes.toml")).expect("load should succeed");
        assert_eq!(cfg.identity.server_id, "refnotes");
        assert_eq!(cfg.migration.state, MigrationState::RelationalOnly);
        assert!(cfg.migration.auto_rebuild);
        assert_eq!(cfg.rebuild.max_window(), Duration::from_secs(3));
        assert_eq!(cfg.rebuild.max_delta(), Duration::from_secs(1));
        assert_eq!(cfg.lease.migration_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.repos.all_users, "All-Users");
        assert!(!cfg.rewrite.allow_comment_rewrite);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("refnotes.toml");
        std::fs::write(
            &path,
            r#"
[identity]
server_id = "review.example.com"

[migration]
state = "read-write"
disable_change_writes = true

[sequence]
batch_size = 10

[rewrite]
allow_comment_rewrite = true
"#,
        )
        .expect("write config");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.identity.server_id, "review.example.com");
        assert_eq!(cfg.identity.server_name, "Code Review");
        assert_eq!(cfg.migration.state, MigrationState::ReadWrite);
        assert!(cfg.migration.disable_change_writes);
        assert_eq!(cfg.sequence.batch_size, 10);
        assert_eq!(cfg.sequence.start, 1);
        assert!(cfg.rewrite.allow_comment_rewrite);
    }

    #[test]
    fn malformed_config_names_the_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("refnotes.toml");
        std::fs::write(&path, "[rebuild\nmax_window_ms = ").expect("write config");

        let err = load_config(&path).expect_err("parse should fail");
        assert!(format!("{err:#}").contains("refnotes.toml"));
    }
}
