//! Supervisor process brokering a chat messaging platform and a pool of
//! sandboxed agent containers.
//!
//! Each conversation (chat, optionally subdivided into topics) is bound to an
//! isolated workspace folder. Inbound messages and timer-driven tasks are
//! dispatched as jobs to warm or cold container workers; their textual results
//! flow back to the conversation. Workers talk back through a file-system
//! mailbox that the supervisor polls, authorizes, and applies.

pub mod config;
pub mod db;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod mailbox;
pub mod messaging;
pub mod mounts;
pub mod pool;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod sessions;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Platform chat identifier (negative for groups on some platforms).
pub type ChatId = i64;

/// Topic identifier inside a chat; `0` means "no topic / general".
pub type TopicId = i64;

pub const GENERAL_TOPIC: TopicId = 0;

/// The privileged admin workspace.
pub const MAIN_WORKSPACE: &str = "main";

/// Shared read-only memory source for non-privileged workspaces.
pub const GLOBAL_WORKSPACE: &str = "global";

/// Kind of chat on the platform side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatType::Private => "private",
            ChatType::Group => "group",
            ChatType::Supergroup => "supergroup",
            ChatType::Channel => "channel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "private" => Some(ChatType::Private),
            "group" => Some(ChatType::Group),
            "supergroup" => Some(ChatType::Supergroup),
            "channel" => Some(ChatType::Channel),
            _ => None,
        }
    }
}

/// Policy deciding whether a chat message causes a worker dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Always,
    Mention,
    Disabled,
}

impl TriggerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerMode::Always => "always",
            TriggerMode::Mention => "mention",
            TriggerMode::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "always" => Some(TriggerMode::Always),
            "mention" => Some(TriggerMode::Mention),
            "disabled" => Some(TriggerMode::Disabled),
            _ => None,
        }
    }
}

/// An additional host directory a registered chat asks to have mounted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraMount {
    /// Host path; `~` is expanded against the supervisor's home directory.
    pub host_path: String,
    /// Subdirectory under `/workspace/extra/` inside the container.
    pub container_sub: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Per-chat container overrides carried by a registered chat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub mounts: Vec<ExtraMount>,
    /// Per-request deadline override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Extra environment passed to the container as `-e KEY=VALUE`.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One line of JSON written to a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerJob {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub folder: String,
    pub session_key: String,
    pub is_main: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_scheduled_task: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<ChatType>,
}

/// Worker response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Success,
    Error,
}

/// The JSON object a worker emits between its output markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOutput {
    pub status: OutputStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ContainerOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutputStatus::Success
    }
}

/// A single host→container bind mount, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Bind {
    pub fn rw(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn ro(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    /// Render as a `-v` argument for the container runtime.
    pub fn to_volume_arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host.display(), self.container)
        } else {
            format!("{}:{}", self.host.display(), self.container)
        }
    }
}
