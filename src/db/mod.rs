pub mod schema;

use crate::message::{parse_canonical, to_canonical, Message, NewMessage};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} is already stored")]
    DuplicateKey(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Blocking(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorCount {
    pub author_id: String,
    /// Display name from the author's most recent stored message.
    pub author_display_name: String,
    pub message_count: i64,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets the reporting reader run alongside an ingestion run
        conn.pragma_update(None, "journal_mode", "WAL")?;

        info!("Database: opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` on the blocking pool with a clone of this handle.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))?
    }

    /// Creates the table and index if absent. Never touches existing rows.
    pub fn initialize(&self) -> Result<(), StoreError> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    pub fn exists(&self, external_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let found = conn
            .prepare_cached("SELECT 1 FROM messages WHERE external_id = ?1")?
            .exists([external_id])?;
        Ok(found)
    }

    /// Inserts one message inside its own transaction and returns its row id.
    ///
    /// Uniqueness is checked by SQLite as part of the INSERT, so two writers
    /// racing on one `external_id` yield one row and one `DuplicateKey`.
    pub fn insert(&self, message: &NewMessage) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO messages
                (external_id, channel_id, author_id, author_display_name,
                 content, captured_at, attachment_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.external_id,
                message.channel_id,
                message.author_id,
                message.author_display_name,
                message.content,
                to_canonical(&message.captured_at),
                message.attachment_count,
            ],
        );

        // Dropping `tx` without commit rolls back.
        match inserted {
            Ok(_) => {
                let row_id = tx.last_insert_rowid();
                tx.commit()?;
                debug!(
                    "Database: Saved message {} as row {}",
                    message.external_id, row_id
                );
                Ok(row_id)
            }
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::DuplicateKey(message.external_id.clone()))
            }
            Err(e) => Err(StoreError::Storage(e)),
        }
    }

    /// Most recent messages by authorship time, newest first.
    pub fn query_recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT row_id, external_id, channel_id, author_id, author_display_name,
                    content, captured_at, attachment_count, ingested_at
             FROM messages
             ORDER BY captured_at DESC, row_id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([sql_limit(limit)], message_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count_total(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Messages authored on or after UTC midnight of `date`.
    pub fn count_since(&self, date: NaiveDate) -> Result<i64, StoreError> {
        let midnight = date.and_time(NaiveTime::MIN).and_utc();
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE captured_at >= ?1",
            [to_canonical(&midnight)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn top_authors(&self, limit: usize) -> Result<Vec<AuthorCount>, StoreError> {
        let conn = self.conn()?;
        // Bare columns next to MAX() come from the row holding the maximum.
        let mut stmt = conn.prepare(
            "SELECT author_id, author_display_name, COUNT(*) AS message_count, MAX(captured_at)
             FROM messages
             GROUP BY author_id
             ORDER BY message_count DESC, author_display_name ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([sql_limit(limit)], |row| {
            Ok(AuthorCount {
                author_id: row.get(0)?,
                author_display_name: row.get(1)?,
                message_count: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// High-water mark: the newest authorship time stored so far.
    pub fn latest_captured_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn()?;
        let latest: Option<String> = conn
            .query_row("SELECT MAX(captured_at) FROM messages", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(latest.as_deref().and_then(parse_canonical))
    }
}

/// SQLite treats a negative LIMIT as unbounded, so saturate instead of wrapping.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        ),
        _ => false,
    }
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_canonical(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{}'", raw).into(),
        )
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        row_id: row.get(0)?,
        external_id: row.get(1)?,
        channel_id: row.get(2)?,
        author_id: row.get(3)?,
        author_display_name: row.get(4)?,
        content: row.get(5)?,
        captured_at: timestamp_column(row, 6)?,
        attachment_count: row.get(7)?,
        ingested_at: timestamp_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::Barrier;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn new_message(id: &str, author: &str, captured_at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            external_id: id.to_string(),
            channel_id: "c1".to_string(),
            author_id: format!("id-{}", author),
            author_display_name: author.to_string(),
            content: format!("message {}", id),
            captured_at,
            attachment_count: 0,
        }
    }

    fn jan1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_db_init_is_idempotent() {
        let db = test_db();
        db.insert(&new_message("1", "alice", jan1())).unwrap();

        db.initialize().unwrap();
        db.initialize().unwrap();
        assert_eq!(db.count_total().unwrap(), 1);
        assert!(db.exists("1").unwrap());
    }

    #[test]
    fn test_insert_and_exists() {
        let db = test_db();
        assert!(!db.exists("1").unwrap());

        let first = db.insert(&new_message("1", "alice", jan1())).unwrap();
        let second = db.insert(&new_message("2", "alice", jan1())).unwrap();
        assert!(second > first);
        assert!(db.exists("1").unwrap());
        assert!(db.exists("2").unwrap());
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let db = test_db();
        db.insert(&new_message("dup", "alice", jan1())).unwrap();

        let mut again = new_message("dup", "bob", jan1() + ChronoDuration::hours(1));
        again.content = "different body".to_string();
        let err = db.insert(&again).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(ref id) if id == "dup"));

        // Original row untouched
        let rows = db.query_recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].author_display_name, "alice");
        assert_eq!(rows[0].content, "message dup");
    }

    #[test]
    fn test_failed_insert_leaves_no_row() {
        let db = test_db();
        {
            let conn = db.conn().unwrap();
            conn.execute_batch("ALTER TABLE messages RENAME TO messages_moved")
                .unwrap();
        }
        let err = db.insert(&new_message("1", "alice", jan1())).unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));

        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages_moved", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_captured_at_round_trips_exactly() {
        let db = test_db();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + ChronoDuration::microseconds(123_456);
        db.insert(&new_message("1", "alice", at)).unwrap();

        let stored = &db.query_recent(1).unwrap()[0];
        assert_eq!(stored.captured_at, at);
        assert_ne!(stored.ingested_at, at);
    }

    #[test]
    fn test_captured_at_keeps_nanoseconds() {
        let db = test_db();
        let record = crate::message::RawRecord {
            id: "ns".to_string(),
            channel_id: "c1".to_string(),
            author_id: "u1".to_string(),
            author_display_name: "alice".to_string(),
            content: String::new(),
            authored_at: "2024-01-01T00:00:00.123456789Z".to_string(),
            attachment_count: 0,
        };
        let msg = crate::message::normalize(&record).unwrap();
        db.insert(&msg).unwrap();

        let stored = &db.query_recent(1).unwrap()[0];
        assert_eq!(stored.captured_at, msg.captured_at);
        assert_eq!(
            to_canonical(&stored.captured_at),
            "2024-01-01T00:00:00.123456789Z"
        );
    }

    #[test]
    fn test_sql_limit_saturates() {
        assert_eq!(sql_limit(10), 10);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);

        let db = test_db();
        db.insert(&new_message("1", "alice", jan1())).unwrap();
        assert_eq!(db.query_recent(usize::MAX).unwrap().len(), 1);
        assert_eq!(db.top_authors(usize::MAX).unwrap().len(), 1);
    }

    #[test]
    fn test_query_recent_orders_by_captured_at() {
        let db = test_db();
        // Inserted out of order on purpose
        db.insert(&new_message("b", "alice", jan1() + ChronoDuration::hours(2))).unwrap();
        db.insert(&new_message("a", "alice", jan1())).unwrap();
        db.insert(&new_message("c", "alice", jan1() + ChronoDuration::hours(5))).unwrap();

        let ids: Vec<String> = db
            .query_recent(2)
            .unwrap()
            .into_iter()
            .map(|m| m.external_id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_counts_and_top_authors() {
        let db = test_db();
        let day2 = jan1() + ChronoDuration::days(1);
        db.insert(&new_message("1", "alice", jan1())).unwrap();
        db.insert(&new_message("2", "bob", day2)).unwrap();
        db.insert(&new_message("3", "bob", day2 + ChronoDuration::hours(3))).unwrap();

        let mut renamed = new_message("4", "bob", day2 + ChronoDuration::hours(4));
        renamed.author_display_name = "robert".to_string();
        db.insert(&renamed).unwrap();

        assert_eq!(db.count_total().unwrap(), 4);
        assert_eq!(db.count_since(day2.date_naive()).unwrap(), 3);
        assert_eq!(db.count_since(jan1().date_naive()).unwrap(), 4);

        let top = db.top_authors(5).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].author_id, "id-bob");
        assert_eq!(top[0].author_display_name, "robert");
        assert_eq!(top[0].message_count, 3);
        assert_eq!(top[1].message_count, 1);
    }

    #[test]
    fn test_latest_captured_at() {
        let db = test_db();
        assert_eq!(db.latest_captured_at().unwrap(), None);

        let later = jan1() + ChronoDuration::minutes(30);
        db.insert(&new_message("2", "alice", later)).unwrap();
        db.insert(&new_message("1", "alice", jan1())).unwrap();
        assert_eq!(db.latest_captured_at().unwrap(), Some(later));
    }

    #[test]
    fn test_concurrent_inserts_on_separate_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        let setup = Database::open(&path).unwrap();
        setup.initialize().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let db = Database::open(&path).unwrap();
                    barrier.wait();
                    db.insert(&new_message("race", "alice", jan1()))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let dups = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::DuplicateKey(_))))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(dups, 1);
        assert_eq!(setup.count_total().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = test_db();
        let msg = new_message("1", "alice", jan1());
        db.run_blocking(move |db| db.insert(&msg)).await.unwrap();
        let found = db.run_blocking(|db| db.exists("1")).await.unwrap();
        assert!(found);
    }
}
