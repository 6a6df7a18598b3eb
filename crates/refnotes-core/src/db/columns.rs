//! Hand-maintained column lists, one per table.
//!
//! Every query in [`super::sqlite`] selects through these lists so row
//! mappers can read by position. [`verify`] compares them against the live
//! schema once, when a store is opened.

use anyhow::{Result, bail};
use rusqlite::Connection;

pub const CHANGES: &[&str] = &[
    "change_id",
    "project",
    "change_key",
    "owner_id",
    "branch",
    "subject",
    "original_subject",
    "topic",
    "status",
    "created_on_ms",
    "last_updated_on_ms",
    "current_patch_set",
    "submission_id",
    "assignee_id",
    "is_private",
    "work_in_progress",
    "note_db_state",
];

pub const PATCH_SETS: &[&str] = &[
    "change_id",
    "patch_set_id",
    "revision",
    "uploader_id",
    "created_on_ms",
    "groups",
    "push_certificate",
    "description",
];

pub const APPROVALS: &[&str] = &[
    "change_id",
    "patch_set_id",
    "account_id",
    "label",
    "value",
    "granted_ms",
    "tag",
];

pub const MESSAGES: &[&str] = &[
    "change_id",
    "message_key",
    "author_id",
    "real_author_id",
    "written_on_ms",
    "message",
    "patch_set_id",
    "tag",
];

pub const COMMENTS: &[&str] = &[
    "change_id",
    "patch_set_id",
    "filename",
    "uuid",
    "status",
    "line",
    "start_line",
    "start_char",
    "end_line",
    "end_char",
    "side",
    "parent_uuid",
    "author_id",
    "written_on_ms",
    "message",
    "revision",
];

pub const REVIEWERS: &[&str] = &["change_id", "account_id", "state", "updated_ms"];

/// Every table paired with its column list.
pub const TABLES: &[(&str, &[&str])] = &[
    ("changes", CHANGES),
    ("patch_sets", PATCH_SETS),
    ("patch_set_approvals", APPROVALS),
    ("change_messages", MESSAGES),
    ("patch_comments", COMMENTS),
    ("change_reviewers", REVIEWERS),
];

/// `a, b, c` for use in `SELECT` and `INSERT` statements.
#[must_use]
pub fn list(columns: &[&str]) -> String {
    columns.join(", ")
}

/// `?1, ?2, ...` placeholders matching `columns`.
#[must_use]
pub fn placeholders(columns: &[&str]) -> String {
    (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check that each table's live columns are exactly the expected list, in
/// order.
///
/// # Errors
///
/// Returns an error naming the first table whose columns differ, or if the
/// schema cannot be queried.
pub fn verify(conn: &Connection) -> Result<()> {
    for (table, expected) in TABLES {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let live = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if live.iter().map(String::as_str).ne(expected.iter().copied()) {
            bail!(
                "table {table} has columns [{}], expected [{}]",
                live.join(", "),
                list(expected)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;

    #[test]
    fn lists_match_migrated_schema() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrations::migrate(&mut conn).expect("migrate");
        verify(&conn).expect("columns match");
    }

    #[test]
    fn drift_is_reported_with_the_table_name() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrations::migrate(&mut conn).expect("migrate");
        conn.execute_batch("ALTER TABLE change_reviewers ADD COLUMN note TEXT")
            .expect("alter");
        let err = verify(&conn).unwrap_err();
        assert!(err.to_string().contains("change_reviewers"));
    }

    #[test]
    fn placeholders_are_numbered() {
        assert_eq!(placeholders(&["a", "b", "c"]), "?1, ?2, ?3");
    }
}
