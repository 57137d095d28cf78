//! Append-only event log. Rows are never mutated or deleted.

use anyhow::Result;
use rusqlite::{params, Row};

use super::Database;
use crate::bus::BusMessage;

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub session_id: String,
    pub event_type: String,
    pub task_id: Option<String>,
    pub worker_id: Option<String>,
    pub payload_json: Option<String>,
    pub ts: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            event_type: row.get(2)?,
            task_id: row.get(3)?,
            worker_id: row.get(4)?,
            payload_json: row.get(5)?,
            ts: row.get(6)?,
        })
    }
}

pub struct EventStore {
    db: Database,
}

impl EventStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(&self, session_id: &str, msg: &BusMessage) -> Result<()> {
        let payload = if msg.payload.is_null() {
            None
        } else {
            Some(serde_json::to_string(&msg.payload)?)
        };
        self.db.writer().execute(
            "INSERT INTO events (session_id, type, task_id, worker_id, payload_json, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                msg.event_type.as_str(),
                msg.task_id,
                msg.worker_id,
                payload,
                msg.time.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn count(&self, session_id: &str) -> Result<u64> {
        let count: i64 = self.db.reader().query_row(
            "SELECT COUNT(*) FROM events WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Events after `since_id` in insertion order; drives `waggle logs`.
    pub fn list_since(&self, session_id: &str, since_id: i64) -> Result<Vec<EventRow>> {
        let conn = self.db.reader();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, type, task_id, worker_id, payload_json, ts
             FROM events WHERE session_id = ?1 AND id > ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id, since_id], EventRow::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }
}
