use anyhow::Context as _;
use rusqlite::{OptionalExtension as _, params};

use super::Db;
use crate::model::{TaskLogLine, TaskRecord};

pub const TASK_EXECUTING: &str = "Executing";
pub const TASK_SUCCESS: &str = "Success";
pub const TASK_FAILED: &str = "Failed";

const TASK_COLUMNS: &str =
    "id, name, kind, scope, resource_id, current_step, status, error_msg, created_at, updated_at";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        scope: row.get(3)?,
        resource_id: row.get(4)?,
        current_step: row.get(5)?,
        status: row.get(6)?,
        error_msg: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl Db {
    pub async fn insert_task(&self, task: TaskRecord) -> anyhow::Result<()> {
        self.call(move |conn| {
            conn.execute(
                r#"
INSERT INTO tasks (id, name, kind, scope, resource_id, current_step, status, error_msg, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
"#,
                params![
                    task.id,
                    task.name,
                    task.kind,
                    task.scope,
                    task.resource_id,
                    task.current_step,
                    task.status,
                    task.error_msg,
                    task.created_at,
                    task.updated_at,
                ],
            )
            .context("insert task")?;
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> anyhow::Result<Option<TaskRecord>> {
        let id = id.to_string();
        self.call(move |conn| {
            let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id], task_from_row)
                .optional()
                .context("get task")?)
        })
        .await
    }

    /// Re-opens a finished task for another run.
    pub async fn reopen_task(&self, id: &str, now: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        let now = now.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE tasks SET status = ?2, error_msg = '', updated_at = ?3 WHERE id = ?1",
                params![id, TASK_EXECUTING, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_task_step(&self, id: &str, step: &str, now: &str) -> anyhow::Result<()> {
        let (id, step, now) = (id.to_string(), step.to_string(), now.to_string());
        self.call(move |conn| {
            conn.execute(
                "UPDATE tasks SET current_step = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, step, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Terminal update. A successful task clears its step; a failed one keeps it.
    pub async fn finish_task(
        &self,
        id: &str,
        status: &str,
        error_msg: &str,
        now: &str,
    ) -> anyhow::Result<()> {
        let (id, status, error_msg, now) = (
            id.to_string(),
            status.to_string(),
            error_msg.to_string(),
            now.to_string(),
        );
        self.call(move |conn| {
            if status == TASK_SUCCESS {
                conn.execute(
                    "UPDATE tasks SET status = ?2, current_step = '', error_msg = '', updated_at = ?3 WHERE id = ?1",
                    params![id, status, now],
                )?;
            } else {
                conn.execute(
                    "UPDATE tasks SET status = ?2, error_msg = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, status, error_msg, now],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Marks every task still `Executing` as failed; returns how many were touched.
    pub async fn fail_executing_tasks(&self, message: &str, now: &str) -> anyhow::Result<usize> {
        let (message, now) = (message.to_string(), now.to_string());
        self.call(move |conn| {
            Ok(conn.execute(
                "UPDATE tasks SET status = ?1, error_msg = ?2, updated_at = ?3 WHERE status = ?4",
                params![TASK_FAILED, message, now, TASK_EXECUTING],
            )?)
        })
        .await
    }

    pub async fn list_tasks(&self, limit: u32) -> anyhow::Result<Vec<TaskRecord>> {
        self.call(move |conn| {
            let sql =
                format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC LIMIT ?1");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], task_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn append_task_log(&self, task_id: &str, line: TaskLogLine) -> anyhow::Result<()> {
        let task_id = task_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO task_logs (task_id, ts, level, msg) VALUES (?1, ?2, ?3, ?4)",
                params![task_id, line.ts, line.level, line.msg],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_task_logs(&self, task_id: &str) -> anyhow::Result<Vec<TaskLogLine>> {
        let task_id = task_id.to_string();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT ts, level, msg FROM task_logs WHERE task_id = ?1 ORDER BY id ASC")?;
            let rows = stmt.query_map(params![task_id], |row| {
                Ok(TaskLogLine {
                    ts: row.get(0)?,
                    level: row.get(1)?,
                    msg: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}
