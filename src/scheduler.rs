//! Timer-driven task scheduling: tick, drain due tasks, compute next runs.

use crate::dispatch::Dispatch;
use crate::sessions::SessionStore;
use crate::store::{ContextMode, RunStatus, ScheduleType, ScheduledTask, Store, TaskRunLog, TaskStatus};
use crate::{ContainerJob, MAIN_WORKSPACE};
use anyhow::{Context as _, anyhow};
use chrono::{DateTime, NaiveDateTime, TimeZone as _, Utc};
use chrono_tz::Tz;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

/// Drains due tasks through the worker pool on a fixed tick.
pub struct Scheduler {
    store: Store,
    sessions: Arc<SessionStore>,
    dispatch: Arc<Dispatch>,
    timezone: Tz,
    poll: Duration,
}

impl Scheduler {
    pub fn new(
        store: Store,
        sessions: Arc<SessionStore>,
        dispatch: Arc<Dispatch>,
        timezone: Tz,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            sessions,
            dispatch,
            timezone,
            poll,
        }
    }

    /// Spawn the tick loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick(Utc::now()).await;
            }
        })
    }

    /// One scheduler pass. Tasks run sequentially so a workspace never sees
    /// two scheduled runs at once.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let due = match self.store.due_tasks(now).await {
            Ok(due) => due,
            Err(error) => {
                tracing::warn!(%error, "failed to query due tasks");
                return;
            }
        };

        for task in due {
            // Re-read the row: a pause or cancel may have landed since the
            // due query, and this re-check closes that race.
            let current = match self.store.task(task.id).await {
                Ok(Some(current)) => current,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(%error, task_id = task.id, "failed to re-read task");
                    continue;
                }
            };
            if current.status != TaskStatus::Active {
                continue;
            }

            self.run_task(&current).await;
        }
    }

    async fn run_task(&self, task: &ScheduledTask) {
        tracing::info!(task_id = task.id, folder = %task.folder, "running scheduled task");

        let session_id = match task.context_mode {
            ContextMode::Group => self.sessions.session_for(&task.folder).await,
            ContextMode::Isolated => None,
        };

        let job = ContainerJob {
            prompt: task.prompt.clone(),
            session_id,
            folder: task.folder.clone(),
            session_key: task.folder.clone(),
            is_main: task.folder == MAIN_WORKSPACE,
            is_scheduled_task: true,
            chat_type: None,
        };

        let run_at = Utc::now();
        let started = std::time::Instant::now();
        let output = self
            .dispatch
            .execute_in_workspace(&task.folder, task.chat_id, job)
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let completed_at = Utc::now();

        // Cron advances from the completion instant, never from the due time,
        // so a slow run cannot schedule a second immediate fire.
        let next_run = match next_run_after(
            task.schedule_type,
            &task.schedule_value,
            self.timezone,
            completed_at,
        ) {
            Ok(next_run) => next_run,
            Err(error) => {
                tracing::warn!(%error, task_id = task.id, "failed to compute next run");
                None
            }
        };

        let (status, summary) = if output.is_success() {
            (
                RunStatus::Success,
                output.result.clone().unwrap_or_default(),
            )
        } else {
            (
                RunStatus::Error,
                output
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown worker error".to_string()),
            )
        };

        let log = TaskRunLog {
            task_id: task.id,
            run_at,
            duration_ms,
            status,
            result: output.result.clone(),
            error: output.error.clone(),
        };
        if let Err(error) = self.store.log_run(&log).await {
            tracing::warn!(%error, task_id = task.id, "failed to append run log");
        }
        if let Err(error) = self
            .store
            .update_after_run(task.id, next_run, &summary)
            .await
        {
            tracing::warn!(%error, task_id = task.id, "failed to update task after run");
        }
    }
}

/// Validate a schedule value for its type. Returns a human-readable reason
/// on rejection; used at mailbox ingest before a task row is written.
pub fn validate_schedule(
    schedule_type: ScheduleType,
    value: &str,
    timezone: Tz,
) -> Result<(), String> {
    match schedule_type {
        ScheduleType::Cron => {
            let normalized = normalize_cron(value).map_err(|error| error.to_string())?;
            cron::Schedule::from_str(&normalized)
                .map(|_| ())
                .map_err(|error| format!("unparseable cron expression '{value}': {error}"))
        }
        ScheduleType::Interval => match value.parse::<i64>() {
            Ok(ms) if ms > 0 => Ok(()),
            Ok(_) => Err("interval must be a positive number of milliseconds".to_string()),
            Err(_) => Err(format!("unparseable interval '{value}'")),
        },
        ScheduleType::Once => parse_once(value, timezone).map(|_| ()).map_err(|error| {
            format!("unparseable timestamp '{value}': {error}")
        }),
    }
}

/// First run instant for a newly created task.
pub fn initial_next_run(
    schedule_type: ScheduleType,
    value: &str,
    timezone: Tz,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    match schedule_type {
        ScheduleType::Cron => next_cron_occurrence(value, timezone, now).map(Some),
        ScheduleType::Interval => {
            let ms: i64 = value.parse().context("unparseable interval")?;
            anyhow::ensure!(ms > 0, "interval must be positive");
            Ok(Some(now + chrono::Duration::milliseconds(ms)))
        }
        ScheduleType::Once => parse_once(value, timezone).map(Some),
    }
}

/// Next run after a completed run, per schedule type. `once` never reruns.
pub fn next_run_after(
    schedule_type: ScheduleType,
    value: &str,
    timezone: Tz,
    completed_at: DateTime<Utc>,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    match schedule_type {
        ScheduleType::Cron => next_cron_occurrence(value, timezone, completed_at).map(Some),
        ScheduleType::Interval => {
            let ms: i64 = value.parse().context("unparseable interval")?;
            anyhow::ensure!(ms > 0, "interval must be positive");
            Ok(Some(completed_at + chrono::Duration::milliseconds(ms)))
        }
        ScheduleType::Once => Ok(None),
    }
}

/// First cron occurrence strictly after `after`, evaluated in `timezone`.
fn next_cron_occurrence(
    expr: &str,
    timezone: Tz,
    after: DateTime<Utc>,
) -> anyhow::Result<DateTime<Utc>> {
    let normalized = normalize_cron(expr)?;
    let schedule =
        cron::Schedule::from_str(&normalized).context("unparseable cron expression")?;
    let next = schedule
        .after(&after.with_timezone(&timezone))
        .next()
        .ok_or_else(|| anyhow!("cron expression has no upcoming occurrence"))?;
    Ok(next.with_timezone(&Utc))
}

/// Accept standard five-field cron by prepending a seconds field; the parser
/// wants six or seven fields.
fn normalize_cron(expr: &str) -> anyhow::Result<String> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {}", expr.trim())),
        6 | 7 => Ok(expr.trim().to_string()),
        _ => Err(anyhow!("cron expression must have 5-7 fields, got {fields}")),
    }
}

/// Parse a `once` schedule value: RFC3339, or a naive local timestamp
/// interpreted in the configured timezone.
fn parse_once(value: &str, timezone: Tz) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
        .context("unrecognized timestamp format")?;

    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("timestamp does not exist in timezone {timezone}"))
}
