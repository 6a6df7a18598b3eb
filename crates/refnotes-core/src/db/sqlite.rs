//! SQLite implementation of [`RelationalStore`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};

use super::bundle::{ChangeBundle, ReviewerRow};
use super::{RelationalStore, columns, configure_connection, migrations};
use crate::error::NotesError;
use crate::model::{
    AccountId, Change, ChangeId, ChangeMessage, Comment, CommentKey, CommentRange, CommentStatus,
    PatchSet, PatchSetApproval, PatchSetId, ReviewerState, Side,
};
use crate::repo::ObjectId;

/// Relational rows in one SQLite database behind a single connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, apply pragmas, migrate and
    /// verify the column lists.
    ///
    /// # Errors
    ///
    /// Returns an error if opening, configuring, migrating or verifying the
    /// database fails.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open relational database {}", path.display()))?;
        Self::init(conn)
    }

    /// A private in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if migrating the fresh database fails.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory database")?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        configure_connection(&conn).context("configure sqlite pragmas")?;
        migrations::migrate(&mut conn).context("apply relational migrations")?;
        columns::verify(&conn).context("verify column lists")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Insert a change row. The change-id counter moves past `change.id`.
    ///
    /// # Errors
    ///
    /// [`NotesError::Relational`] on constraint violations (including a
    /// duplicate id).
    pub fn insert_change(&self, change: &Change) -> Result<(), NotesError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO changes ({}) VALUES ({})",
                columns::list(columns::CHANGES),
                columns::placeholders(columns::CHANGES)
            ),
            params_from_iter(change_values(change)),
        )?;
        tx.execute(
            "UPDATE id_counters SET next_value = MAX(next_value, ?1) WHERE name = 'changes'",
            [i64::from(change.id.get()) + 1],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Overwrite an existing change row. Returns whether the row existed.
    ///
    /// # Errors
    ///
    /// [`NotesError::Relational`] on constraint violations.
    pub fn update_change(&self, change: &Change) -> Result<bool, NotesError> {
        let conn = self.lock();
        let updated = conn.execute(&update_change_sql(), params_from_iter(change_values(change)))?;
        Ok(updated > 0)
    }

    /// # Errors
    ///
    /// [`NotesError::Relational`] on constraint violations.
    pub fn insert_patch_set(&self, change: ChangeId, ps: &PatchSet) -> Result<(), NotesError> {
        self.insert(
            "patch_sets",
            columns::PATCH_SETS,
            vec![
                id(change.get()),
                id(ps.id.get()),
                Value::Text(ps.revision.to_hex()),
                id(ps.uploader.get()),
                Value::Integer(ps.created_on.timestamp_millis()),
                Value::Text(ps.groups.join(",")),
                text(ps.push_certificate.as_deref()),
                text(ps.description.as_deref()),
            ],
        )
    }

    /// # Errors
    ///
    /// [`NotesError::Relational`] on constraint violations.
    pub fn insert_approval(&self, change: ChangeId, approval: &PatchSetApproval) -> Result<(), NotesError> {
        self.insert(
            "patch_set_approvals",
            columns::APPROVALS,
            vec![
                id(change.get()),
                id(approval.patch_set.get()),
                id(approval.account.get()),
                Value::Text(approval.label.clone()),
                Value::Integer(i64::from(approval.value)),
                Value::Integer(approval.granted.timestamp_millis()),
                text(approval.tag.as_deref()),
            ],
        )
    }

    /// # Errors
    ///
    /// [`NotesError::Relational`] on constraint violations.
    pub fn insert_message(&self, change: ChangeId, message: &ChangeMessage) -> Result<(), NotesError> {
        self.insert(
            "change_messages",
            columns::MESSAGES,
            vec![
                id(change.get()),
                Value::Text(message.key.clone()),
                opt_id(message.author.map(AccountId::get)),
                opt_id(message.real_author.map(AccountId::get)),
                Value::Integer(message.written_on.timestamp_millis()),
                Value::Text(message.message.clone()),
                opt_id(message.patch_set.map(PatchSetId::get)),
                text(message.tag.as_deref()),
            ],
        )
    }

    /// # Errors
    ///
    /// [`NotesError::Relational`] on constraint violations.
    pub fn insert_comment(
        &self,
        change: ChangeId,
        comment: &Comment,
        status: CommentStatus,
    ) -> Result<(), NotesError> {
        let range = comment.range;
        self.insert(
            "patch_comments",
            columns::COMMENTS,
            vec![
                id(change.get()),
                id(comment.key.patch_set.get()),
                Value::Text(comment.key.filename.clone()),
                Value::Text(comment.key.uuid.clone()),
                Value::Text(status.as_str().to_string()),
                id(comment.line),
                opt_id(range.map(|r| r.start_line)),
                opt_id(range.map(|r| r.start_char)),
                opt_id(range.map(|r| r.end_line)),
                opt_id(range.map(|r| r.end_char)),
                Value::Integer(i64::from(comment.side.as_i16())),
                text(comment.parent_uuid.as_deref()),
                id(comment.author.get()),
                Value::Integer(comment.written_on.timestamp_millis()),
                Value::Text(comment.message.clone()),
                Value::Text(comment.revision.to_hex()),
            ],
        )
    }

    /// Insert or replace the reviewer row for `account`.
    ///
    /// # Errors
    ///
    /// [`NotesError::Relational`] on constraint violations.
    pub fn insert_reviewer(
        &self,
        change: ChangeId,
        account: AccountId,
        state: ReviewerState,
        updated: DateTime<Utc>,
    ) -> Result<(), NotesError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO change_reviewers (change_id, account_id, state, updated_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (change_id, account_id)
             DO UPDATE SET state = excluded.state, updated_ms = excluded.updated_ms",
            params![change.get(), account.get(), state.as_str(), updated.timestamp_millis()],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// [`NotesError::Relational`] if `next` is zero or too large.
    pub fn set_next_change_id(&self, next: u64) -> Result<(), NotesError> {
        let value = i64::try_from(next).map_err(|e| {
            rusqlite::Error::ToSqlConversionFailure(Box::new(e))
        })?;
        self.lock().execute(
            "UPDATE id_counters SET next_value = ?1 WHERE name = 'changes'",
            [value],
        )?;
        Ok(())
    }

    fn insert(&self, table: &str, cols: &[&str], values: Vec<Value>) -> Result<(), NotesError> {
        debug_assert_eq!(cols.len(), values.len());
        self.lock().execute(
            &format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns::list(cols),
                columns::placeholders(cols)
            ),
            params_from_iter(values),
        )?;
        Ok(())
    }
}

impl RelationalStore for SqliteStore {
    fn change(&self, id: ChangeId) -> Result<Option<Change>, NotesError> {
        Ok(select_change(&self.lock(), id)?)
    }

    fn change_ids(&self) -> Result<Vec<ChangeId>, NotesError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT change_id FROM changes ORDER BY change_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, u32>(0).map(ChangeId::new))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn bundle(&self, id: ChangeId) -> Result<Option<ChangeBundle>, NotesError> {
        let conn = self.lock();
        let Some(change) = select_change(&conn, id)? else {
            return Ok(None);
        };
        let mut bundle = ChangeBundle::new(change);
        bundle.patch_sets = select_children(&conn, columns::PATCH_SETS, "patch_sets", "patch_set_id", id, patch_set_from_row)?;
        bundle.approvals = select_children(
            &conn,
            columns::APPROVALS,
            "patch_set_approvals",
            "granted_ms, patch_set_id, account_id, label",
            id,
            approval_from_row,
        )?;
        bundle.messages = select_children(
            &conn,
            columns::MESSAGES,
            "change_messages",
            "written_on_ms, message_key",
            id,
            message_from_row,
        )?;
        bundle.comments = select_children(
            &conn,
            columns::COMMENTS,
            "patch_comments",
            "patch_set_id, filename, uuid",
            id,
            comment_from_row,
        )?;
        bundle.reviewers = select_children(
            &conn,
            columns::REVIEWERS,
            "change_reviewers",
            "account_id",
            id,
            reviewer_from_row,
        )?;
        Ok(Some(bundle))
    }

    fn next_change_id(&self) -> Result<u64, NotesError> {
        let value: i64 = self.lock().query_row(
            "SELECT next_value FROM id_counters WHERE name = 'changes'",
            [],
            |row| row.get(0),
        )?;
        u64::try_from(value).map_err(|e| {
            NotesError::Relational(rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(e)))
        })
    }

    fn atomic_update(
        &self,
        id: ChangeId,
        update: &mut dyn FnMut(&mut Change) -> Result<bool, NotesError>,
    ) -> Result<Option<Change>, NotesError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(original) = select_change(&tx, id)? else {
            return Ok(None);
        };
        let mut row = original.clone();
        if !update(&mut row)? {
            return Ok(Some(original));
        }
        if row.id != id {
            return Err(NotesError::InvalidUpdate(format!(
                "atomic update of change {id} changed its id to {}",
                row.id
            )));
        }
        tx.execute(&update_change_sql(), params_from_iter(change_values(&row)))?;
        tx.commit()?;
        Ok(Some(row))
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn id(value: u32) -> Value {
    Value::Integer(i64::from(value))
}

fn opt_id(value: Option<u32>) -> Value {
    value.map_or(Value::Null, id)
}

fn text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn change_values(change: &Change) -> Vec<Value> {
    vec![
        id(change.id.get()),
        Value::Text(change.project.clone()),
        Value::Text(change.change_key.clone()),
        id(change.owner.get()),
        Value::Text(change.branch.clone()),
        Value::Text(change.subject.clone()),
        Value::Text(change.original_subject.clone()),
        text(change.topic.as_deref()),
        Value::Text(change.status.as_str().to_string()),
        Value::Integer(change.created_on.timestamp_millis()),
        Value::Integer(change.last_updated_on.timestamp_millis()),
        opt_id(change.current_patch_set.map(PatchSetId::get)),
        text(change.submission_id.as_deref()),
        opt_id(change.assignee.map(AccountId::get)),
        Value::Integer(i64::from(change.is_private)),
        Value::Integer(i64::from(change.work_in_progress)),
        text(change.note_db_state.as_deref()),
    ]
}

/// `UPDATE changes SET ... WHERE change_id = ?1`, bound with
/// [`change_values`].
fn update_change_sql() -> String {
    let assignments = columns::CHANGES
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, col)| format!("{col} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE changes SET {assignments} WHERE change_id = ?1")
}

fn select_change(conn: &Connection, id: ChangeId) -> rusqlite::Result<Option<Change>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM changes WHERE change_id = ?1",
            columns::list(columns::CHANGES)
        ),
        [id.get()],
        change_from_row,
    )
    .optional()
}

fn select_children<T>(
    conn: &Connection,
    cols: &[&str],
    table: &str,
    order_by: &str,
    change: ChangeId,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {table} WHERE change_id = ?1 ORDER BY {order_by}",
        columns::list(cols)
    ))?;
    let rows = stmt.query_map([change.get()], map)?;
    rows.collect()
}

fn conversion(idx: usize, ty: Type, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, err.into())
}

fn time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion(idx, Type::Integer, format!("timestamp {ms} out of range")))
}

fn object_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<ObjectId> {
    let hex: String = row.get(idx)?;
    ObjectId::from_hex(&hex).map_err(|e| conversion(idx, Type::Text, e))
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Change> {
    let status: String = row.get(8)?;
    Ok(Change {
        id: ChangeId::new(row.get(0)?),
        project: row.get(1)?,
        change_key: row.get(2)?,
        owner: AccountId::new(row.get(3)?),
        branch: row.get(4)?,
        subject: row.get(5)?,
        original_subject: row.get(6)?,
        topic: row.get(7)?,
        status: status.parse().map_err(|e| conversion(8, Type::Text, e))?,
        created_on: time(row, 9)?,
        last_updated_on: time(row, 10)?,
        current_patch_set: row.get::<_, Option<u32>>(11)?.map(PatchSetId::new),
        submission_id: row.get(12)?,
        assignee: row.get::<_, Option<u32>>(13)?.map(AccountId::new),
        is_private: row.get(14)?,
        work_in_progress: row.get(15)?,
        note_db_state: row.get(16)?,
    })
}

fn patch_set_from_row(row: &Row<'_>) -> rusqlite::Result<PatchSet> {
    let groups: String = row.get(5)?;
    let mut ps = PatchSet::new(
        PatchSetId::new(row.get(1)?),
        object_id(row, 2)?,
        AccountId::new(row.get(3)?),
        time(row, 4)?,
    );
    ps.groups = groups
        .split(',')
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect();
    ps.push_certificate = row.get(6)?;
    ps.description = row.get(7)?;
    Ok(ps)
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<PatchSetApproval> {
    let label: String = row.get(3)?;
    let mut approval = PatchSetApproval::new(
        PatchSetId::new(row.get(1)?),
        AccountId::new(row.get(2)?),
        label,
        row.get(4)?,
        time(row, 5)?,
    );
    approval.tag = row.get(6)?;
    Ok(approval)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeMessage> {
    Ok(ChangeMessage {
        key: row.get(1)?,
        author: row.get::<_, Option<u32>>(2)?.map(AccountId::new),
        real_author: row.get::<_, Option<u32>>(3)?.map(AccountId::new),
        written_on: time(row, 4)?,
        message: row.get(5)?,
        patch_set: row.get::<_, Option<u32>>(6)?.map(PatchSetId::new),
        tag: row.get(7)?,
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<(Comment, CommentStatus)> {
    let status: String = row.get(4)?;
    let status = CommentStatus::parse(&status)
        .ok_or_else(|| conversion(4, Type::Text, format!("unknown comment status {status:?}")))?;
    let key = CommentKey {
        patch_set: PatchSetId::new(row.get(1)?),
        filename: row.get(2)?,
        uuid: row.get(3)?,
    };
    let range = match (
        row.get::<_, Option<u32>>(6)?,
        row.get::<_, Option<u32>>(7)?,
        row.get::<_, Option<u32>>(8)?,
        row.get::<_, Option<u32>>(9)?,
    ) {
        (Some(start_line), Some(start_char), Some(end_line), Some(end_char)) => Some(CommentRange {
            start_line,
            start_char,
            end_line,
            end_char,
        }),
        _ => None,
    };
    let message: String = row.get(14)?;
    let mut comment = Comment::new(
        key,
        AccountId::new(row.get(12)?),
        time(row, 13)?,
        message,
        object_id(row, 15)?,
    )
    .with_line(row.get(5)?)
    .on_side(Side::from_i16(row.get(10)?));
    // The stored line wins over the range's end line.
    comment.range = range;
    comment.parent_uuid = row.get(11)?;
    Ok((comment, status))
}

fn reviewer_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewerRow> {
    let state: String = row.get(2)?;
    Ok(ReviewerRow {
        account: AccountId::new(row.get(1)?),
        state: state.parse().map_err(|e| conversion(2, Type::Text, e))?,
        updated: time(row, 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANGE: ChangeId = ChangeId::new(12);
    const ALICE: AccountId = AccountId::new(1);
    const BOB: AccountId = AccountId::new(2);

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("ts")
    }

    fn change() -> Change {
        Change::new(CHANGE, "project", "I12", ALICE, "refs/heads/main", "subject", ts(0))
    }

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open");
        store.insert_change(&change()).expect("insert change");
        store
    }

    #[test]
    fn open_file_sets_wal_and_migrates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("review.sqlite3");
        let store = SqliteStore::open(&path).expect("open");
        let conn = store.lock();
        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");
        assert_eq!(
            migrations::current_schema_version(&conn).expect("version"),
            migrations::LATEST_SCHEMA_VERSION
        );
    }

    #[test]
    fn change_round_trips_and_missing_is_none() {
        let store = seeded();
        let mut expected = change();
        assert_eq!(store.change(CHANGE).expect("read"), Some(expected.clone()));
        assert_eq!(store.change(ChangeId::new(99)).expect("read"), None);

        expected.topic = Some("t".to_string());
        expected.assignee = Some(BOB);
        expected.current_patch_set = Some(PatchSetId::new(2));
        expected.is_private = true;
        assert!(store.update_change(&expected).expect("update"));
        assert_eq!(store.change(CHANGE).expect("read"), Some(expected));
    }

    #[test]
    fn inserting_a_change_advances_the_counter() {
        let store = seeded();
        assert_eq!(store.next_change_id().expect("next"), 13);
        store.set_next_change_id(500).expect("set");
        assert_eq!(store.next_change_id().expect("next"), 500);
        assert_eq!(store.change_ids().expect("ids"), vec![CHANGE]);
    }

    #[test]
    fn bundle_returns_children_in_stable_order() {
        let store = seeded();
        let rev = ObjectId::from_bytes([0x11; 20]);
        let mut ps = PatchSet::new(PatchSetId::new(1), rev, ALICE, ts(0));
        ps.groups = vec!["g1".to_string(), "g2".to_string()];
        store.insert_patch_set(CHANGE, &ps).expect("ps");

        store
            .insert_approval(CHANGE, &PatchSetApproval::new(PatchSetId::new(1), BOB, "Code-Review", 2, ts(20)))
            .expect("approval");
        store
            .insert_approval(CHANGE, &PatchSetApproval::new(PatchSetId::new(1), ALICE, "Verified", -1, ts(10)))
            .expect("approval");

        let key = CommentKey {
            patch_set: PatchSetId::new(1),
            filename: "src/lib.rs".to_string(),
            uuid: "c1".to_string(),
        };
        let ranged = Comment::new(key, BOB, ts(5), "nit", rev)
            .with_range(CommentRange {
                start_line: 3,
                start_char: 0,
                end_line: 4,
                end_char: 7,
            })
            .with_parent("c0")
            .on_side(Side::Base);
        store.insert_comment(CHANGE, &ranged, CommentStatus::Draft).expect("comment");
        store.insert_reviewer(CHANGE, BOB, ReviewerState::Reviewer, ts(1)).expect("reviewer");
        store.insert_reviewer(CHANGE, BOB, ReviewerState::Cc, ts(2)).expect("reviewer");

        let bundle = store.bundle(CHANGE).expect("bundle").expect("exists");
        assert_eq!(bundle.patch_sets, vec![ps]);
        let labels: Vec<&str> = bundle.approvals.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, ["Verified", "Code-Review"]);
        assert_eq!(bundle.comments, vec![(ranged, CommentStatus::Draft)]);
        assert_eq!(bundle.reviewers.len(), 1);
        assert_eq!(bundle.reviewers[0].state, ReviewerState::Cc);
        assert_eq!(bundle.drafts_by_author()[&BOB].len(), 1);
        assert_eq!(bundle.published_comments().count(), 0);
    }

    #[test]
    fn atomic_update_writes_only_when_asked() {
        let store = seeded();

        let after = store
            .atomic_update(CHANGE, &mut |row| {
                row.note_db_state = Some("N".to_string());
                Ok(false)
            })
            .expect("aborted update")
            .expect("exists");
        assert_eq!(after.note_db_state, None);
        assert_eq!(store.change(CHANGE).expect("read").expect("exists").note_db_state, None);

        let after = store
            .atomic_update(CHANGE, &mut |row| {
                row.note_db_state = Some("N".to_string());
                Ok(true)
            })
            .expect("update")
            .expect("exists");
        assert_eq!(after.note_db_state.as_deref(), Some("N"));
        assert_eq!(
            store.change(CHANGE).expect("read").expect("exists").note_db_state.as_deref(),
            Some("N")
        );
    }

    #[test]
    fn atomic_update_propagates_closure_errors_and_missing_rows() {
        let store = seeded();
        let err = store
            .atomic_update(CHANGE, &mut |_| Err(NotesError::WritesDisabled))
            .unwrap_err();
        assert!(matches!(err, NotesError::WritesDisabled));
        assert!(store
            .atomic_update(ChangeId::new(404), &mut |_| Ok(true))
            .expect("missing")
            .is_none());
    }
}
