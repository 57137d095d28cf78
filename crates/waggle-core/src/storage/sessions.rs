//! Session rows: create, terminalise, find resumable.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, SessionStatus};

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub objective: String,
    pub status: SessionStatus,
    pub phase: String,
    pub iteration: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            objective: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Interrupted),
            phase: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            iteration: row.get::<_, Option<u32>>(4)?.unwrap_or(0),
            created_at: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            updated_at: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        })
    }
}

const SELECT: &str =
    "SELECT id, objective, status, phase, iteration, created_at, updated_at FROM sessions";

pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, id: &str, objective: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.db.writer().execute(
            "INSERT OR IGNORE INTO sessions (id, objective, status, phase, iteration, created_at, updated_at)
             VALUES (?1, ?2, ?3, '', 0, ?4, ?4)",
            params![id, objective, SessionStatus::Running.as_str(), now],
        )?;
        if inserted == 0 {
            return Err(anyhow!("session id collision: {id}"));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<SessionRow>> {
        let conn = self.db.reader();
        let row = conn
            .query_row(
                &format!("{SELECT} WHERE id = ?1"),
                [id],
                SessionRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Unconditional status write, used while the session is live.
    pub fn set_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.writer().execute(
            "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
        Ok(())
    }

    /// Write a terminal (or interrupted) status only if no terminal status
    /// has been recorded yet. Returns whether the write happened, so close
    /// paths can stay idempotent without a read-modify-write race.
    pub fn set_status_if_not_terminal(&self, id: &str, status: SessionStatus) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.writer().execute(
            "UPDATE sessions SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status NOT IN ('done', 'failed', 'cancelled')",
            params![status.as_str(), now, id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_phase(&self, id: &str, phase: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.writer().execute(
            "UPDATE sessions SET phase = ?1, updated_at = ?2 WHERE id = ?3",
            params![phase, now, id],
        )?;
        Ok(())
    }

    pub fn set_iteration(&self, id: &str, iteration: u32) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.writer().execute(
            "UPDATE sessions SET iteration = ?1, updated_at = ?2 WHERE id = ?3",
            params![iteration, now, id],
        )?;
        Ok(())
    }

    pub fn latest(&self) -> Result<Option<SessionRow>> {
        let conn = self.db.reader();
        let row = conn
            .query_row(
                &format!("{SELECT} ORDER BY created_at DESC, id DESC LIMIT 1"),
                [],
                SessionRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent session that can be picked up again (running or
    /// interrupted).
    pub fn find_resumable(&self) -> Result<Option<SessionRow>> {
        let conn = self.db.reader();
        let row = conn
            .query_row(
                &format!(
                    "{SELECT} WHERE status IN ('running', 'interrupted')
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                [],
                SessionRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All sessions, newest first. Tolerates null columns from older
    /// schema versions.
    pub fn list(&self) -> Result<Vec<SessionRow>> {
        let conn = self.db.reader();
        let mut stmt = conn.prepare(&format!("{SELECT} ORDER BY created_at DESC, id DESC"))?;
        let rows = stmt.query_map([], SessionRow::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_db;

    #[test]
    fn create_and_get() {
        let (db, _dir) = test_db();
        let store = db.sessions();
        store.create("s1", "build the thing").unwrap();

        let row = store.get("s1").unwrap().unwrap();
        assert_eq!(row.objective, "build the thing");
        assert_eq!(row.status, SessionStatus::Running);
        assert_eq!(row.iteration, 0);
    }

    #[test]
    fn duplicate_id_rejected() {
        let (db, _dir) = test_db();
        let store = db.sessions();
        store.create("s1", "a").unwrap();
        assert!(store.create("s1", "b").is_err());
    }

    #[test]
    fn terminal_status_is_not_overwritten() {
        let (db, _dir) = test_db();
        let store = db.sessions();
        store.create("s1", "obj").unwrap();

        assert!(store
            .set_status_if_not_terminal("s1", SessionStatus::Done)
            .unwrap());
        // a later interrupted close must not downgrade the outcome
        assert!(!store
            .set_status_if_not_terminal("s1", SessionStatus::Interrupted)
            .unwrap());
        assert_eq!(store.get("s1").unwrap().unwrap().status, SessionStatus::Done);
    }

    #[test]
    fn interrupted_can_still_be_terminalised() {
        let (db, _dir) = test_db();
        let store = db.sessions();
        store.create("s1", "obj").unwrap();
        store
            .set_status_if_not_terminal("s1", SessionStatus::Interrupted)
            .unwrap();
        assert!(store
            .set_status_if_not_terminal("s1", SessionStatus::Done)
            .unwrap());
    }

    #[test]
    fn find_resumable_skips_terminal_sessions() {
        let (db, _dir) = test_db();
        let store = db.sessions();
        store.create("old", "finished").unwrap();
        store.set_status("old", SessionStatus::Done).unwrap();
        store.create("new", "interrupted work").unwrap();
        store
            .set_status("new", SessionStatus::Interrupted)
            .unwrap();

        let found = store.find_resumable().unwrap().unwrap();
        assert_eq!(found.id, "new");
    }

    #[test]
    fn list_returns_newest_first() {
        let (db, _dir) = test_db();
        let store = db.sessions();
        store.create("a", "one").unwrap();
        store.create("b", "two").unwrap();
        let rows = store.list().unwrap();
        assert_eq!(rows.len(), 2);
    }
}
