//! Blackboard and kv persistence.
//!
//! The blackboard table is append-only history; kv is last-writer-wins.
//! Neither is rehydrated on resume.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::blackboard::Entry;

pub struct BlackboardStore {
    db: Database,
}

impl BlackboardStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn put(&self, session_id: &str, entry: &Entry) -> Result<()> {
        self.db.writer().execute(
            "INSERT INTO blackboard (session_id, key, value, posted_by, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                entry.key,
                entry.value,
                entry.posted_by,
                entry.time.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn put_kv(&self, session_id: &str, key: &str, value: &str) -> Result<()> {
        self.db.writer().execute(
            "INSERT INTO kv (session_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id, key) DO UPDATE SET value = excluded.value",
            params![session_id, key, value],
        )?;
        Ok(())
    }

    pub fn get_kv(&self, session_id: &str, key: &str) -> Result<Option<String>> {
        let value = self
            .db
            .reader()
            .query_row(
                "SELECT value FROM kv WHERE session_id = ?1 AND key = ?2",
                params![session_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}
