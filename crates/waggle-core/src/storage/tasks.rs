//! Durable task projection.
//!
//! Collection fields (constraints, context, depends_on, result) are stored
//! as JSON text columns; everything queryable lives in its own column.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::Database;
use crate::task::{Priority, Task, TaskResult, TaskStatus, TaskType};

pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub(super) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or refresh a task row.
    pub fn upsert(&self, session_id: &str, task: &Task) -> Result<()> {
        self.db.with_tx(|tx| upsert_in_tx(tx, session_id, task))
    }

    /// Persist a batch atomically: all rows or none.
    pub fn upsert_batch(&self, session_id: &str, tasks: &[Task]) -> Result<()> {
        self.db.with_tx(|tx| {
            for task in tasks {
                upsert_in_tx(tx, session_id, task)?;
            }
            Ok(())
        })
    }

    pub fn get_tasks(&self, session_id: &str) -> Result<Vec<Task>> {
        let conn = self.db.reader();
        let mut stmt = conn.prepare(
            "SELECT id, type, status, priority, title, description, constraints, context,
                    allowed_paths, worker_id, result_json, max_retries, retry_count,
                    last_error, last_error_type, depends_on, created_at, started_at,
                    completed_at, timeout_secs, retry_after
             FROM tasks WHERE session_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([session_id], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn count_by_status(&self, session_id: &str) -> Result<HashMap<String, u32>> {
        let conn = self.db.reader();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM tasks WHERE session_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

pub(crate) fn upsert_in_tx(
    tx: &rusqlite::Transaction<'_>,
    session_id: &str,
    task: &Task,
) -> Result<()> {
    let result_json = task
        .result
        .as_ref()
        .map(serde_json::to_string::<TaskResult>)
        .transpose()?;
    tx.execute(
        "INSERT INTO tasks (id, session_id, type, status, priority, title, description,
                            constraints, context, allowed_paths, worker_id, result_json,
                            max_retries, retry_count, last_error, last_error_type,
                            depends_on, created_at, started_at, completed_at,
                            timeout_secs, retry_after)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20, ?21, ?22)
         ON CONFLICT(session_id, id) DO UPDATE SET
            status = excluded.status,
            priority = excluded.priority,
            worker_id = excluded.worker_id,
            result_json = excluded.result_json,
            max_retries = excluded.max_retries,
            retry_count = excluded.retry_count,
            last_error = excluded.last_error,
            last_error_type = excluded.last_error_type,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            timeout_secs = excluded.timeout_secs,
            retry_after = excluded.retry_after",
        params![
            task.id,
            session_id,
            task.task_type.as_str(),
            task.status.as_str(),
            u8::from(task.priority),
            task.title,
            task.description,
            serde_json::to_string(&task.constraints)?,
            serde_json::to_string(&task.context)?,
            serde_json::to_string(&task.allowed_paths)?,
            task.worker_id,
            result_json,
            task.max_retries,
            task.retry_count,
            task.last_error,
            task.last_error_type,
            serde_json::to_string(&task.depends_on)?,
            task.created_at.to_rfc3339(),
            task.started_at.map(|t| t.to_rfc3339()),
            task.completed_at.map(|t| t.to_rfc3339()),
            task.timeout_secs,
            task.retry_after.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let parse_time = |s: Option<String>| -> Option<DateTime<Utc>> {
        s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
    };
    let json_vec = |s: Option<String>| -> Vec<String> {
        s.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
    };

    let task_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let priority: u8 = row.get::<_, Option<u8>>(3)?.unwrap_or(1);
    let created_at: Option<String> = row.get(16)?;

    Ok(Task {
        id: row.get(0)?,
        task_type: TaskType::parse(&task_type).unwrap_or(TaskType::Generic),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        priority: Priority::try_from(priority).unwrap_or_default(),
        title: row.get(4)?,
        description: row.get(5)?,
        constraints: json_vec(row.get(6)?),
        context: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        allowed_paths: json_vec(row.get(8)?),
        worker_id: row.get(9)?,
        result: row
            .get::<_, Option<String>>(10)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        max_retries: row.get::<_, Option<u32>>(11)?.unwrap_or(0),
        retry_count: row.get::<_, Option<u32>>(12)?.unwrap_or(0),
        last_error: row.get(13)?,
        last_error_type: row.get(14)?,
        depends_on: json_vec(row.get(15)?),
        created_at: parse_time(created_at).unwrap_or_else(Utc::now),
        started_at: parse_time(row.get(17)?),
        completed_at: parse_time(row.get(18)?),
        timeout_secs: row.get::<_, Option<u64>>(19)?.unwrap_or(0),
        retry_after: parse_time(row.get(20)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_db;

    fn sample_task(id: &str) -> Task {
        let mut t = Task::new(id, TaskType::Code, "build it", "do the work");
        t.depends_on = vec!["other".to_string()];
        t.constraints = vec!["no tests".to_string()];
        t.context.insert("branch".to_string(), "main".to_string());
        t.max_retries = 2;
        t.timeout_secs = 120;
        t
    }

    #[test]
    fn round_trips_a_task() {
        let (db, _dir) = test_db();
        db.sessions().create("s1", "obj").unwrap();
        let store = db.tasks();
        store.upsert("s1", &sample_task("t1")).unwrap();

        let tasks = store.get_tasks("s1").unwrap();
        assert_eq!(tasks.len(), 1);
        let t = &tasks[0];
        assert_eq!(t.id, "t1");
        assert_eq!(t.task_type, TaskType::Code);
        assert_eq!(t.depends_on, vec!["other".to_string()]);
        assert_eq!(t.context.get("branch").map(String::as_str), Some("main"));
        assert_eq!(t.timeout_secs, 120);
    }

    #[test]
    fn upsert_refreshes_mutable_fields() {
        let (db, _dir) = test_db();
        db.sessions().create("s1", "obj").unwrap();
        let store = db.tasks();
        let mut task = sample_task("t1");
        store.upsert("s1", &task).unwrap();

        task.status = TaskStatus::Failed;
        task.retry_count = 1;
        task.last_error = Some("connection reset".to_string());
        store.upsert("s1", &task).unwrap();

        let tasks = store.get_tasks("s1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].retry_count, 1);
    }

    #[test]
    fn batch_upsert_is_atomic() {
        let (db, _dir) = test_db();
        db.sessions().create("s1", "obj").unwrap();
        let store = db.tasks();
        store
            .upsert_batch("s1", &[sample_task("a"), sample_task("b")])
            .unwrap();
        assert_eq!(store.get_tasks("s1").unwrap().len(), 2);
    }

    #[test]
    fn counts_by_status() {
        let (db, _dir) = test_db();
        db.sessions().create("s1", "obj").unwrap();
        let store = db.tasks();
        let mut done = sample_task("a");
        done.status = TaskStatus::Complete;
        store.upsert("s1", &done).unwrap();
        store.upsert("s1", &sample_task("b")).unwrap();
        store.upsert("s1", &sample_task("c")).unwrap();

        let counts = store.count_by_status("s1").unwrap();
        assert_eq!(counts.get("complete"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&2));
    }
}
