//! Scheduled task persistence and run logging.

use super::{
    ContextMode, NewTask, RunStatus, ScheduleType, ScheduledTask, Store, TaskRunLog, TaskStatus,
};
use crate::error::DbError;
use chrono::{DateTime, Utc};
use sqlx::Row as _;

/// `last_result` is clamped to this many characters before storage.
pub const MAX_LAST_RESULT_CHARS: usize = 200;

impl Store {
    /// Insert a task and return it with its supervisor-issued id.
    pub async fn create_task(&self, task: NewTask) -> Result<ScheduledTask, DbError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO scheduled_tasks \
             (chat_id, topic_id, folder, prompt, schedule_type, schedule_value, \
              context_mode, next_run, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        )
        .bind(task.chat_id)
        .bind(task.topic_id)
        .bind(&task.folder)
        .bind(&task.prompt)
        .bind(task.schedule_type.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(task.next_run)
        .bind(created_at)
        .execute(self.pool())
        .await?;

        Ok(ScheduledTask {
            id: result.last_insert_rowid(),
            chat_id: task.chat_id,
            topic_id: task.topic_id,
            folder: task.folder,
            prompt: task.prompt,
            schedule_type: task.schedule_type,
            schedule_value: task.schedule_value,
            context_mode: task.context_mode,
            next_run: task.next_run,
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at,
        })
    }

    pub async fn task(&self, id: i64) -> Result<Option<ScheduledTask>, DbError> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(task_from_row))
    }

    pub async fn tasks_for_folder(&self, folder: &str) -> Result<Vec<ScheduledTask>, DbError> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks WHERE folder = ? ORDER BY id")
            .bind(folder)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(task_from_row).collect())
    }

    pub async fn all_tasks(&self) -> Result<Vec<ScheduledTask>, DbError> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(task_from_row).collect())
    }

    /// Active tasks whose next_run is due at `now`, soonest first.
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, DbError> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_tasks \
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ? \
             ORDER BY next_run",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(task_from_row).collect())
    }

    pub async fn set_task_status(
        &self,
        id: i64,
        status: TaskStatus,
    ) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE scheduled_tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the outcome of a run: last_run, clamped last_result, the new
    /// next_run, and the `completed` transition when no next run exists.
    pub async fn update_after_run(
        &self,
        id: i64,
        next_run: Option<DateTime<Utc>>,
        summary: &str,
    ) -> Result<(), DbError> {
        let clamped: String = summary.chars().take(MAX_LAST_RESULT_CHARS).collect();
        let status = if next_run.is_none() {
            TaskStatus::Completed
        } else {
            TaskStatus::Active
        };
        sqlx::query(
            "UPDATE scheduled_tasks \
             SET last_run = ?, last_result = ?, next_run = ?, status = ? \
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(&clamped)
        .bind(next_run)
        .bind(status.as_str())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Append to the run log. The log is append-only; nothing reads it on the
    /// hot path.
    pub async fn log_run(&self, log: &TaskRunLog) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(log.task_id)
        .bind(log.run_at)
        .bind(log.duration_ms)
        .bind(log.status.as_str())
        .bind(&log.result)
        .bind(&log.error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn run_logs_for_task(&self, task_id: i64) -> Result<Vec<TaskRunLog>, DbError> {
        let rows = sqlx::query(
            "SELECT task_id, run_at, duration_ms, status, result, error \
             FROM task_run_logs WHERE task_id = ? ORDER BY run_at",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TaskRunLog {
                task_id: row.try_get("task_id").unwrap_or_default(),
                run_at: row.try_get("run_at").unwrap_or_else(|_| Utc::now()),
                duration_ms: row.try_get("duration_ms").unwrap_or_default(),
                status: match row.try_get::<String, _>("status").as_deref() {
                    Ok("success") => RunStatus::Success,
                    _ => RunStatus::Error,
                },
                result: row.try_get("result").ok().flatten(),
                error: row.try_get("error").ok().flatten(),
            })
            .collect())
    }
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> ScheduledTask {
    ScheduledTask {
        id: row.try_get("id").unwrap_or_default(),
        chat_id: row.try_get("chat_id").unwrap_or_default(),
        topic_id: row.try_get("topic_id").unwrap_or_default(),
        folder: row.try_get("folder").unwrap_or_default(),
        prompt: row.try_get("prompt").unwrap_or_default(),
        schedule_type: row
            .try_get::<String, _>("schedule_type")
            .ok()
            .and_then(|v| ScheduleType::parse(&v))
            .unwrap_or(ScheduleType::Once),
        schedule_value: row.try_get("schedule_value").unwrap_or_default(),
        context_mode: row
            .try_get::<String, _>("context_mode")
            .ok()
            .and_then(|v| ContextMode::parse(&v))
            .unwrap_or(ContextMode::Group),
        next_run: row.try_get("next_run").ok().flatten(),
        last_run: row.try_get("last_run").ok().flatten(),
        last_result: row.try_get("last_result").ok().flatten(),
        status: row
            .try_get::<String, _>("status")
            .ok()
            .and_then(|v| TaskStatus::parse(&v))
            .unwrap_or(TaskStatus::Active),
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
    }
}
