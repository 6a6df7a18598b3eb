//! Relational schema for review rows.
//!
//! - `changes` is one row per change, including the `note_db_state` token
//! - child tables (`patch_sets`, `patch_set_approvals`, `change_messages`,
//!   `patch_comments`, `change_reviewers`) cascade with their change
//! - `id_counters` holds the next change id handed out by the relational side
//!
//! Timestamps are integer milliseconds since the Unix epoch (`_ms`).

/// Migration v1: all review tables.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS changes (
    change_id INTEGER PRIMARY KEY CHECK (change_id > 0),
    project TEXT NOT NULL CHECK (length(trim(project)) > 0),
    change_key TEXT NOT NULL,
    owner_id INTEGER NOT NULL,
    branch TEXT NOT NULL,
    subject TEXT NOT NULL,
    original_subject TEXT NOT NULL,
    topic TEXT,
    status TEXT NOT NULL DEFAULT 'new' CHECK (status IN ('new', 'merged', 'abandoned')),
    created_on_ms INTEGER NOT NULL,
    last_updated_on_ms INTEGER NOT NULL,
    current_patch_set INTEGER CHECK (current_patch_set IS NULL OR current_patch_set > 0),
    submission_id TEXT,
    assignee_id INTEGER,
    is_private INTEGER NOT NULL DEFAULT 0 CHECK (is_private IN (0, 1)),
    work_in_progress INTEGER NOT NULL DEFAULT 0 CHECK (work_in_progress IN (0, 1)),
    note_db_state TEXT
);

CREATE TABLE IF NOT EXISTS patch_sets (
    change_id INTEGER NOT NULL REFERENCES changes(change_id) ON DELETE CASCADE,
    patch_set_id INTEGER NOT NULL CHECK (patch_set_id > 0),
    revision TEXT NOT NULL CHECK (length(revision) = 40),
    uploader_id INTEGER NOT NULL,
    created_on_ms INTEGER NOT NULL,
    groups TEXT NOT NULL DEFAULT '',
    push_certificate TEXT,
    description TEXT,
    PRIMARY KEY (change_id, patch_set_id)
);

CREATE TABLE IF NOT EXISTS patch_set_approvals (
    change_id INTEGER NOT NULL REFERENCES changes(change_id) ON DELETE CASCADE,
    patch_set_id INTEGER NOT NULL,
    account_id INTEGER NOT NULL,
    label TEXT NOT NULL CHECK (length(trim(label)) > 0),
    value INTEGER NOT NULL CHECK (value BETWEEN -32768 AND 32767),
    granted_ms INTEGER NOT NULL,
    tag TEXT,
    PRIMARY KEY (change_id, patch_set_id, account_id, label)
);

CREATE TABLE IF NOT EXISTS change_messages (
    change_id INTEGER NOT NULL REFERENCES changes(change_id) ON DELETE CASCADE,
    message_key TEXT NOT NULL,
    author_id INTEGER,
    real_author_id INTEGER,
    written_on_ms INTEGER NOT NULL,
    message TEXT NOT NULL,
    patch_set_id INTEGER,
    tag TEXT,
    PRIMARY KEY (change_id, message_key)
);

CREATE TABLE IF NOT EXISTS patch_comments (
    change_id INTEGER NOT NULL REFERENCES changes(change_id) ON DELETE CASCADE,
    patch_set_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    uuid TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('P', 'D')),
    line INTEGER NOT NULL DEFAULT 0 CHECK (line >= 0),
    start_line INTEGER,
    start_char INTEGER,
    end_line INTEGER,
    end_char INTEGER,
    side INTEGER NOT NULL DEFAULT 1,
    parent_uuid TEXT,
    author_id INTEGER NOT NULL,
    written_on_ms INTEGER NOT NULL,
    message TEXT NOT NULL,
    revision TEXT NOT NULL CHECK (length(revision) = 40),
    PRIMARY KEY (change_id, patch_set_id, filename, uuid),
    CHECK (
        (start_line IS NULL AND start_char IS NULL AND end_line IS NULL AND end_char IS NULL)
        OR (start_line IS NOT NULL AND start_char IS NOT NULL AND end_line IS NOT NULL AND end_char IS NOT NULL)
    )
);

CREATE TABLE IF NOT EXISTS change_reviewers (
    change_id INTEGER NOT NULL REFERENCES changes(change_id) ON DELETE CASCADE,
    account_id INTEGER NOT NULL,
    state TEXT NOT NULL CHECK (state IN ('REVIEWER', 'CC', 'REMOVED')),
    updated_ms INTEGER NOT NULL,
    PRIMARY KEY (change_id, account_id)
);

CREATE TABLE IF NOT EXISTS id_counters (
    name TEXT PRIMARY KEY,
    next_value INTEGER NOT NULL CHECK (next_value > 0)
);

INSERT OR IGNORE INTO id_counters (name, next_value) VALUES ('changes', 1);

CREATE INDEX IF NOT EXISTS idx_changes_project_status
    ON changes(project, status);

CREATE INDEX IF NOT EXISTS idx_approvals_change_granted
    ON patch_set_approvals(change_id, granted_ms);

CREATE INDEX IF NOT EXISTS idx_messages_change_written
    ON change_messages(change_id, written_on_ms);

CREATE INDEX IF NOT EXISTS idx_comments_change_status_author
    ON patch_comments(change_id, status, author_id);
";

/// Indexes every migrated database must carry.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_changes_project_status",
    "idx_approvals_change_granted",
    "idx_messages_change_written",
    "idx_comments_change_status_author",
];

#[cfg(test)]
mod tests {
    use crate::db::migrations;
    use rusqlite::{Connection, params};

    fn conn() -> rusqlite::Result<Connection> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::migrate(&mut conn).expect("migrate");
        Ok(conn)
    }

    fn insert_change(conn: &Connection, id: i64) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO changes (change_id, project, change_key, owner_id, branch, subject,
                original_subject, created_on_ms, last_updated_on_ms)
             VALUES (?1, 'p', 'I1', 1, 'refs/heads/main', 's', 's', 0, 0)",
            params![id],
        )
    }

    #[test]
    fn status_check_rejects_unknown_values() -> rusqlite::Result<()> {
        let conn = conn()?;
        insert_change(&conn, 1)?;
        let err = conn
            .execute("UPDATE changes SET status = 'draft' WHERE change_id = 1", [])
            .unwrap_err();
        assert!(err.to_string().contains("CHECK"));
        Ok(())
    }

    #[test]
    fn partial_comment_range_is_rejected() -> rusqlite::Result<()> {
        let conn = conn()?;
        insert_change(&conn, 1)?;
        let result = conn.execute(
            "INSERT INTO patch_comments (change_id, patch_set_id, filename, uuid, status,
                start_line, author_id, written_on_ms, message, revision)
             VALUES (1, 1, 'a', 'u', 'P', 3, 1, 0, 'm', ?1)",
            params!["a".repeat(40)],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn deleting_a_change_cascades_to_children() -> rusqlite::Result<()> {
        let conn = conn()?;
        insert_change(&conn, 7)?;
        conn.execute(
            "INSERT INTO change_reviewers (change_id, account_id, state, updated_ms)
             VALUES (7, 2, 'CC', 0)",
            [],
        )?;
        conn.execute("DELETE FROM changes WHERE change_id = 7", [])?;
        let left: i64 = conn.query_row("SELECT COUNT(*) FROM change_reviewers", [], |row| row.get(0))?;
        assert_eq!(left, 0);
        Ok(())
    }

    #[test]
    fn change_counter_is_seeded() -> rusqlite::Result<()> {
        let conn = conn()?;
        let next: i64 = conn.query_row(
            "SELECT next_value FROM id_counters WHERE name = 'changes'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(next, 1);
        Ok(())
    }
}
