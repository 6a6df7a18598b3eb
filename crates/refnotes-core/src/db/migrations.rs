//! Schema versions of the review store.
//!
//! The version lives in `PRAGMA user_version`. Opening a store written by a
//! newer build is refused rather than silently reading tables whose columns
//! no longer match [`super::columns`].

use rusqlite::{Connection, types::Type};

use super::schema;

/// One forward step of the review schema.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "review tables and change counter",
    sql: schema::MIGRATION_V1_SQL,
}];

/// Newest schema this build writes.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("review store is at schema version {found}; this build supports up to {supported}")]
    Newer { found: u32, supported: u32 },
}

/// # Errors
///
/// The pragma cannot be read, or holds a negative or oversized value.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let raw: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(e)))
}

/// Bring the review tables up to [`LATEST_SCHEMA_VERSION`]. Each step and
/// its version bump commit together, so a failed step leaves the store at
/// the previous version.
///
/// # Errors
///
/// - [`SchemaError::Newer`] for a store written by a newer build.
/// - [`SchemaError::Sqlite`] when a step fails.
pub fn migrate(conn: &mut Connection) -> Result<u32, SchemaError> {
    let found = current_schema_version(conn)?;
    if found > LATEST_SCHEMA_VERSION {
        return Err(SchemaError::Newer {
            found,
            supported: LATEST_SCHEMA_VERSION,
        });
    }

    let pending = MIGRATIONS.iter().filter(|m| m.version > found);
    let mut version = found;
    for step in pending {
        let tx = conn.transaction()?;
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", i64::from(step.version))?;
        tx.commit()?;
        tracing::info!(version = step.version, name = step.name, "migrated review store");
        version = step.version;
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::db::columns;

    fn names(conn: &Connection, kind: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = ?1 ORDER BY name")
            .expect("prepare");
        stmt.query_map([kind], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("names")
    }

    #[test]
    fn versions_ascend_and_end_at_latest() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(LATEST_SCHEMA_VERSION));
    }

    #[test]
    fn fresh_store_gets_every_table_and_index() {
        let mut conn = Connection::open_in_memory().expect("open");
        assert_eq!(migrate(&mut conn).expect("migrate"), LATEST_SCHEMA_VERSION);

        let tables = names(&conn, "table");
        for (table, _) in columns::TABLES {
            assert!(tables.iter().any(|t| t == table), "missing table {table}");
        }
        assert!(tables.iter().any(|t| t == "id_counters"));
        let indexes = names(&conn, "index");
        for index in schema::REQUIRED_INDEXES {
            assert!(indexes.iter().any(|i| i == index), "missing index {index}");
        }
    }

    #[test]
    fn second_run_changes_nothing() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("first");
        conn.execute("UPDATE id_counters SET next_value = 40 WHERE name = 'changes'", [])
            .expect("bump");
        assert_eq!(migrate(&mut conn).expect("second"), LATEST_SCHEMA_VERSION);
        let next: i64 = conn
            .query_row("SELECT next_value FROM id_counters WHERE name = 'changes'", [], |row| row.get(0))
            .expect("counter");
        assert_eq!(next, 40);
    }

    #[test]
    fn store_from_a_newer_build_is_refused() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.pragma_update(None, "user_version", i64::from(LATEST_SCHEMA_VERSION + 1))
            .expect("pragma");
        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(err, SchemaError::Newer { found, .. } if found == LATEST_SCHEMA_VERSION + 1));
    }

    #[test]
    fn negative_version_is_an_error() {
        let conn = Connection::open_in_memory().expect("open");
        conn.pragma_update(None, "user_version", -1_i64).expect("pragma");
        assert!(current_schema_version(&conn).is_err());
    }
}
