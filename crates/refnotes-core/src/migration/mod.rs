//! Moving changes from relational to versioned storage.
//!
//! - [`state`]: the global, monotonic migration state.
//! - [`primary`]: flips one change's primary storage under a read-only lease.
//! - [`bulk`]: rebuilds many changes on a bounded worker pool.
//! - [`online`]: drives the global state from start to finish.

pub mod bulk;
pub mod online;
pub mod primary;
pub mod state;

pub use bulk::{BulkRebuilder, BulkReport};
pub use online::OnlineMigrator;
pub use primary::{MigrationOutcome, PrimaryStorageMigrator};
pub use state::{GlobalMigration, MigrationState};
