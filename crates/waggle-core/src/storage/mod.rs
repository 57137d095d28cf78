//! Persistence layer.
//!
//! SQLite-backed storage for sessions, tasks, events, conversation messages
//! and the blackboard. One writer connection (all mutations, transactional)
//! plus a small pool of read-only connections so status observers never
//! contend with the write path. The store is a projection: in-memory state
//! leads it by at most one completed transition.

mod blackboard;
mod events;
mod messages;
mod sessions;
mod tasks;

pub use blackboard::BlackboardStore;
pub use events::{EventRow, EventStore};
pub use messages::{MessageStore, StoredMessage};
pub use sessions::{SessionRow, SessionStore};
pub use tasks::TaskStore;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

const READER_POOL_SIZE: usize = 3;
const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Done,
    Failed,
    Cancelled,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Done => "done",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SessionStatus::Running),
            "done" => Some(SessionStatus::Done),
            "failed" => Some(SessionStatus::Failed),
            "cancelled" => Some(SessionStatus::Cancelled),
            "interrupted" => Some(SessionStatus::Interrupted),
            _ => None,
        }
    }

    /// Terminal outcomes. An interrupted session is resumable, so it does
    /// not count.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Done | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ReaderPool {
    conns: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

/// Handle to the hive database. Cheap to clone; all clones share the writer
/// and the reader pool.
#[derive(Clone)]
pub struct Database {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<ReaderPool>,
}

impl Database {
    /// Open (creating if needed) the store under the given hive directory.
    pub fn open(hive_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(hive_dir)
            .with_context(|| format!("create {}", hive_dir.display()))?;
        let db_path = hive_dir.join(crate::paths::DB_FILE);

        let writer = Connection::open(&db_path)
            .with_context(|| format!("open {}", db_path.display()))?;
        writer.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&writer)?;

        let mut conns = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open(&db_path)?;
            conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
            conn.pragma_update(None, "query_only", "ON")?;
            conns.push(Mutex::new(conn));
        }

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(ReaderPool {
                conns,
                next: AtomicUsize::new(0),
            }),
        })
    }

    pub(crate) fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().expect("db writer lock poisoned")
    }

    pub(crate) fn reader(&self) -> MutexGuard<'_, Connection> {
        let idx = self.readers.next.fetch_add(1, Ordering::Relaxed) % self.readers.conns.len();
        self.readers.conns[idx]
            .lock()
            .expect("db reader lock poisoned")
    }

    /// Run mutations in one transaction, rolled back on error.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // tx rolls back on drop
                Err(e)
            }
        }
    }

    pub fn sessions(&self) -> SessionStore {
        SessionStore::new(self.clone())
    }

    pub fn tasks(&self) -> TaskStore {
        TaskStore::new(self.clone())
    }

    pub fn events(&self) -> EventStore {
        EventStore::new(self.clone())
    }

    pub fn messages(&self) -> MessageStore {
        MessageStore::new(self.clone())
    }

    pub fn blackboard(&self) -> BlackboardStore {
        BlackboardStore::new(self.clone())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id         TEXT PRIMARY KEY,
            objective  TEXT NOT NULL,
            status     TEXT NOT NULL,
            phase      TEXT NOT NULL DEFAULT '',
            iteration  INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id              TEXT NOT NULL,
            session_id      TEXT NOT NULL,
            type            TEXT NOT NULL,
            status          TEXT NOT NULL,
            priority        INTEGER NOT NULL DEFAULT 1,
            title           TEXT NOT NULL,
            description     TEXT NOT NULL,
            constraints     TEXT,
            context         TEXT,
            allowed_paths   TEXT,
            worker_id       TEXT,
            result_json     TEXT,
            max_retries     INTEGER NOT NULL DEFAULT 0,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            last_error      TEXT,
            last_error_type TEXT,
            depends_on      TEXT,
            created_at      TEXT NOT NULL,
            started_at      TEXT,
            completed_at    TEXT,
            timeout_secs    INTEGER NOT NULL DEFAULT 0,
            retry_after     TEXT,
            PRIMARY KEY (session_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id);
        CREATE TABLE IF NOT EXISTS events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id   TEXT NOT NULL,
            type         TEXT NOT NULL,
            task_id      TEXT,
            worker_id    TEXT,
            payload_json TEXT,
            ts           TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
        CREATE TABLE IF NOT EXISTS messages (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id   TEXT NOT NULL,
            seq          INTEGER NOT NULL,
            role         TEXT NOT NULL,
            content_json TEXT NOT NULL,
            usage_json   TEXT,
            excluded     INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL,
            UNIQUE(session_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq);
        CREATE TABLE IF NOT EXISTS blackboard (
            session_id TEXT NOT NULL,
            key        TEXT NOT NULL,
            value      TEXT NOT NULL,
            posted_by  TEXT NOT NULL,
            ts         TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS kv (
            session_id TEXT NOT NULL,
            key        TEXT NOT NULL,
            value      TEXT NOT NULL,
            PRIMARY KEY (session_id, key)
        );",
    )
    .context("initialise schema")?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_db() -> (Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open db");
    (db, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema() {
        let (db, _dir) = test_db();
        let count: i64 = db
            .reader()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('sessions','tasks','events','messages','blackboard','kv')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn readers_are_query_only() {
        let (db, _dir) = test_db();
        let err = db
            .reader()
            .execute("INSERT INTO kv (session_id, key, value) VALUES ('s','k','v')", []);
        assert!(err.is_err());
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let (db, _dir) = test_db();
        let result: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO kv (session_id, key, value) VALUES ('s','k','v')",
                [],
            )?;
            anyhow::bail!("abort");
        });
        assert!(result.is_err());

        let count: i64 = db
            .reader()
            .query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Done.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Interrupted.is_terminal());
    }
}
