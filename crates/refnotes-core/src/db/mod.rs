//! Relational store for review rows.
//!
//! Runtime defaults for SQLite connections:
//! - `journal_mode = WAL` so readers do not block the writer
//! - `busy_timeout = 5s` to ride out short lock contention
//! - `foreign_keys = ON` so child rows cascade with their change

pub mod bundle;
pub mod columns;
pub mod migrations;
pub mod schema;
pub mod sqlite;

pub use bundle::{ChangeBundle, ReviewerRow};
pub use sqlite::SqliteStore;

use rusqlite::Connection;
use std::time::Duration;

use crate::error::NotesError;
use crate::model::{Change, ChangeId};

/// Busy timeout used for relational store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Read and compare-and-swap access to the relational rows.
///
/// "Not found" is `Ok(None)`, never an error.
pub trait RelationalStore: Send + Sync {
    /// # Errors
    ///
    /// [`NotesError::Relational`] if the store cannot be read.
    fn change(&self, id: ChangeId) -> Result<Option<Change>, NotesError>;

    /// Every change id, ascending.
    ///
    /// # Errors
    ///
    /// [`NotesError::Relational`] if the store cannot be read.
    fn change_ids(&self) -> Result<Vec<ChangeId>, NotesError>;

    /// The change row plus all of its child rows.
    ///
    /// # Errors
    ///
    /// [`NotesError::Relational`] if the store cannot be read.
    fn bundle(&self, id: ChangeId) -> Result<Option<ChangeBundle>, NotesError>;

    /// The next change id the relational side would hand out.
    ///
    /// # Errors
    ///
    /// [`NotesError::Relational`] if the store cannot be read.
    fn next_change_id(&self) -> Result<u64, NotesError>;

    /// Read one change row inside a per-row transaction and let `update`
    /// modify it. The row is written back only if `update` returns
    /// `Ok(true)`. Returns the stored row afterwards, or `None` if the change
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Whatever `update` returns, or [`NotesError::Relational`].
    fn atomic_update(
        &self,
        id: ChangeId,
        update: &mut dyn FnMut(&mut Change) -> Result<bool, NotesError>,
    ) -> Result<Option<Change>, NotesError>;
}

pub(crate) fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}
