//! Conversation persistence, ordered by a per-session sequence number.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Row};

use super::Database;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub seq: u64,
    pub role: String,
    pub content_json: String,
    pub usage_json: Option<String>,
    pub excluded: bool,
}

impl StoredMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            role: row.get(1)?,
            content_json: row.get(2)?,
            usage_json: row.get(3)?,
            excluded: row.get::<_, i64>(4)? != 0,
        })
    }
}

pub struct MessageStore {
    db: Database,
}

impl MessageStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one message at the given sequence number. The UNIQUE
    /// constraint on (session_id, seq) rejects accidental double-appends.
    pub fn append(
        &self,
        session_id: &str,
        seq: u64,
        role: &str,
        content_json: &str,
        usage_json: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.writer().execute(
            "INSERT INTO messages (session_id, seq, role, content_json, usage_json, excluded, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![session_id, seq, role, content_json, usage_json, now],
        )?;
        Ok(())
    }

    /// Messages in sequence order, excluded ones filtered out.
    pub fn load(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.db.reader();
        let mut stmt = conn.prepare(
            "SELECT seq, role, content_json, usage_json, excluded
             FROM messages WHERE session_id = ?1 AND excluded = 0 ORDER BY seq",
        )?;
        let rows = stmt.query_map([session_id], StoredMessage::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Drop a range of messages from future loads without deleting history.
    /// Used by compaction to retire the summarised middle.
    pub fn mark_excluded(&self, session_id: &str, from_seq: u64, to_seq: u64) -> Result<()> {
        self.db.writer().execute(
            "UPDATE messages SET excluded = 1
             WHERE session_id = ?1 AND seq >= ?2 AND seq <= ?3",
            params![session_id, from_seq, to_seq],
        )?;
        Ok(())
    }

    /// Next free sequence number for a session.
    pub fn next_seq(&self, session_id: &str) -> Result<u64> {
        let max: Option<i64> = self.db.reader().query_row(
            "SELECT MAX(seq) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(max.map(|m| m as u64 + 1).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_db;

    #[test]
    fn append_then_load_round_trips_in_order() {
        let (db, _dir) = test_db();
        db.sessions().create("s1", "obj").unwrap();
        let store = db.messages();

        store
            .append("s1", 0, "user", r#"[{"type":"text","text":"objective"}]"#, None)
            .unwrap();
        store
            .append(
                "s1",
                1,
                "assistant",
                r#"[{"type":"text","text":"on it"}]"#,
                Some(r#"{"input_tokens":10}"#),
            )
            .unwrap();

        let msgs = store.load("s1").unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].seq, 0);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[1].role, "assistant");
        assert!(msgs[1].usage_json.is_some());
    }

    #[test]
    fn duplicate_seq_rejected() {
        let (db, _dir) = test_db();
        db.sessions().create("s1", "obj").unwrap();
        let store = db.messages();
        store.append("s1", 0, "user", "[]", None).unwrap();
        assert!(store.append("s1", 0, "user", "[]", None).is_err());
    }

    #[test]
    fn excluded_messages_are_filtered() {
        let (db, _dir) = test_db();
        db.sessions().create("s1", "obj").unwrap();
        let store = db.messages();
        for seq in 0..5 {
            store.append("s1", seq, "user", "[]", None).unwrap();
        }
        store.mark_excluded("s1", 1, 3).unwrap();

        let msgs = store.load("s1").unwrap();
        let seqs: Vec<u64> = msgs.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 4]);
    }

    #[test]
    fn next_seq_advances() {
        let (db, _dir) = test_db();
        db.sessions().create("s1", "obj").unwrap();
        let store = db.messages();
        assert_eq!(store.next_seq("s1").unwrap(), 0);
        store.append("s1", 0, "user", "[]", None).unwrap();
        store.append("s1", 1, "assistant", "[]", None).unwrap();
        assert_eq!(store.next_seq("s1").unwrap(), 2);
    }
}
