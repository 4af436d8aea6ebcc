//! Durable collections: chats, topics, messages, scheduled tasks, run logs.
//!
//! The store is the only component that touches SQLite. All writes are single
//! statements; the scheduler's per-tick batches are deliberately
//! non-transactional.

mod chats;
mod messages;
mod tasks;

use crate::{ChatId, ChatType, TopicId, TriggerMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Handle over the supervisor's SQLite collections. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A chat as observed from the platform.
#[derive(Debug, Clone)]
pub struct Chat {
    pub chat_id: ChatId,
    pub chat_type: ChatType,
    pub title: String,
    pub last_activity: Option<DateTime<Utc>>,
}

/// A topic inside a chat, bound forever to its workspace folder.
#[derive(Debug, Clone)]
pub struct Topic {
    pub chat_id: ChatId,
    pub topic_id: TopicId,
    pub name: String,
    pub folder: String,
    pub trigger_mode: Option<TriggerMode>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Message kinds stored in the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Reaction,
    AgentResponse,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Reaction => "reaction",
            MessageKind::AgentResponse => "agent_response",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageKind::Text),
            "reaction" => Some(MessageKind::Reaction),
            "agent_response" => Some(MessageKind::AgentResponse),
            _ => None,
        }
    }
}

/// One stored message. `(chat_id, topic_id, id)` is the primary key.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub chat_id: ChatId,
    pub topic_id: TopicId,
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub is_bot: bool,
    pub reply_to: Option<String>,
    pub reaction_emoji: Option<String>,
    pub reaction_action: Option<String>,
    pub target_message_id: Option<String>,
    pub worker_session_id: Option<String>,
}

/// How a scheduled task recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cron" => Some(ScheduleType::Cron),
            "interval" => Some(ScheduleType::Interval),
            "once" => Some(ScheduleType::Once),
            _ => None,
        }
    }
}

/// Whether a task run resumes the workspace's worker session or starts fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Group,
    Isolated,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextMode::Group => "group",
            ContextMode::Isolated => "isolated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "group" => Some(ContextMode::Group),
            "isolated" => Some(ContextMode::Isolated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(TaskStatus::Active),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

/// A timer-driven task owned by a workspace.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: i64,
    pub chat_id: ChatId,
    pub topic_id: TopicId,
    pub folder: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a task; the store issues the id.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub chat_id: ChatId,
    pub topic_id: TopicId,
    pub folder: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<DateTime<Utc>>,
}

/// Outcome of one task run, appended to the run log.
#[derive(Debug, Clone)]
pub struct TaskRunLog {
    pub task_id: i64,
    pub run_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}
