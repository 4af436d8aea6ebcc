//! File-system mailbox: workers drop JSON action files, the supervisor polls,
//! authorizes, and applies them.
//!
//! Layout per workspace: `<ipc>/<folder>/messages/` for outbound speech and
//! reactions, `<ipc>/<folder>/tasks/` for task mutations and admin actions,
//! `<ipc>/<folder>/errors/` for rejected files. Workers write via temp file
//! and rename, so a poll never sees a partial document.

use crate::config::Config;
use crate::error::MailboxError;
use crate::files::write_json_atomic;
use crate::messaging::ChatClient;
use crate::registry::{ChatRegistry, RegisteredChat, TriggerConfig};
use crate::scheduler::{initial_next_run, validate_schedule};
use crate::store::{ContextMode, NewTask, ScheduleType, Store, TaskStatus};
use crate::{ChatId, ChatType, MAIN_WORKSPACE, TopicId, TriggerMode};
use chrono::Utc;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Admin actions a `main` worker can ask of the supervisor process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Restart,
    Rebuild,
}

/// Service-control request surfaced to the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCommand {
    Restart,
    Rebuild,
}

fn default_context_mode() -> ContextMode {
    ContextMode::Group
}

/// Everything a worker may drop in its mailbox. Unknown tags fail to parse
/// and land in `errors/`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MailboxAction {
    Message {
        chat_id: ChatId,
        #[serde(default)]
        topic_id: TopicId,
        text: String,
        #[serde(default)]
        folder: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Reaction {
        chat_id: ChatId,
        message_id: String,
        emoji: String,
        #[serde(default)]
        folder: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ScheduleTask {
        prompt: String,
        schedule_type: ScheduleType,
        schedule_value: String,
        #[serde(default = "default_context_mode")]
        context_mode: ContextMode,
        #[serde(default)]
        chat_id: Option<ChatId>,
        #[serde(default)]
        topic_id: TopicId,
        /// Owner-folder override; honored for `main` only.
        #[serde(default)]
        folder: Option<String>,
        #[serde(default)]
        created_by: Option<String>,
    },
    PauseTask {
        task_id: i64,
    },
    ResumeTask {
        task_id: i64,
    },
    CancelTask {
        task_id: i64,
    },
    RegisterChat {
        chat_id: ChatId,
        chat_type: ChatType,
        chat_title: String,
        trigger_mode: TriggerMode,
    },
    ServiceControl {
        action: ServiceAction,
    },
}

/// Mailbox poller and applier.
pub struct Mailbox {
    config: Arc<Config>,
    store: Store,
    registry: Arc<ChatRegistry>,
    platform: Arc<dyn ChatClient>,
    service_tx: mpsc::Sender<ServiceCommand>,
}

impl Mailbox {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        registry: Arc<ChatRegistry>,
        platform: Arc<dyn ChatClient>,
        service_tx: mpsc::Sender<ServiceCommand>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            registry,
            platform,
            service_tx,
        })
    }

    /// Spawn the poll loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mailbox = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mailbox.config.mailbox_poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                mailbox.poll_once().await;
            }
        })
    }

    /// One poll pass over every workspace's mailbox directories.
    pub async fn poll_once(&self) {
        let ipc_root = self.config.data_dir.join("ipc");
        let folders = match std::fs::read_dir(&ipc_root) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_dir())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect::<Vec<_>>(),
            Err(_) => return,
        };

        for folder in folders {
            for sub in ["messages", "tasks"] {
                self.drain_directory(&folder, sub).await;
            }
        }
    }

    async fn drain_directory(&self, source: &str, sub: &str) {
        let dir = self.config.ipc_dir(source).join(sub);
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.is_file() && path.extension().is_some_and(|ext| ext == "json")
                })
                .collect(),
            Err(_) => return,
        };
        files.sort();

        for file in files {
            match self.ingest_file(source, &file).await {
                Ok(()) => {
                    if let Err(error) = std::fs::remove_file(&file) {
                        tracing::warn!(%error, file = %file.display(), "failed to remove applied mailbox file");
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        source,
                        file = %file.display(),
                        "mailbox file rejected"
                    );
                    self.quarantine(source, &file);
                }
            }
        }
    }

    /// Move a rejected file into the workspace's `errors/` directory.
    fn quarantine(&self, source: &str, file: &Path) {
        let errors_dir = self.config.ipc_dir(source).join("errors");
        let _ = std::fs::create_dir_all(&errors_dir);
        let target = errors_dir.join(
            file.file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "unnamed.json".into()),
        );
        if let Err(error) = std::fs::rename(file, &target) {
            tracing::warn!(%error, file = %file.display(), "failed to quarantine mailbox file");
            let _ = std::fs::remove_file(file);
        }
    }

    async fn ingest_file(&self, source: &str, file: &Path) -> Result<(), MailboxError> {
        let raw = std::fs::read_to_string(file)
            .map_err(|error| MailboxError::Parse(error.to_string()))?;
        let action: MailboxAction =
            serde_json::from_str(&raw).map_err(|error| MailboxError::Parse(error.to_string()))?;
        self.apply(source, action).await
    }

    /// Authorize and apply one action originating from workspace `source`.
    pub async fn apply(&self, source: &str, action: MailboxAction) -> Result<(), MailboxError> {
        let is_main = source == MAIN_WORKSPACE;

        match action {
            MailboxAction::Message {
                chat_id,
                topic_id,
                text,
                ..
            } => {
                self.authorize_chat_target(source, is_main, chat_id).await?;
                let prefixed = format!("{}: {}", self.config.assistant_name, text);
                if let Err(error) = self
                    .platform
                    .send_message(chat_id, topic_id, &prefixed, None)
                    .await
                {
                    tracing::warn!(%error, chat_id, "mailbox message egress failed");
                }
                Ok(())
            }

            MailboxAction::Reaction {
                chat_id,
                message_id,
                emoji,
                ..
            } => {
                self.authorize_chat_target(source, is_main, chat_id).await?;
                if let Err(error) = self
                    .platform
                    .send_reaction(chat_id, &message_id, &emoji)
                    .await
                {
                    tracing::warn!(%error, chat_id, "mailbox reaction egress failed");
                }
                Ok(())
            }

            MailboxAction::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                chat_id,
                topic_id,
                folder,
                created_by,
            } => {
                self.schedule_task(
                    source,
                    is_main,
                    prompt,
                    schedule_type,
                    schedule_value,
                    context_mode,
                    chat_id,
                    topic_id,
                    folder,
                    created_by,
                )
                .await
            }

            MailboxAction::PauseTask { task_id } => {
                self.mutate_task(source, is_main, task_id, TaskStatus::Paused)
                    .await
            }
            MailboxAction::ResumeTask { task_id } => {
                self.mutate_task(source, is_main, task_id, TaskStatus::Active)
                    .await
            }
            MailboxAction::CancelTask { task_id } => {
                self.authorize_task_owner(source, is_main, task_id).await?;
                self.store
                    .delete_task(task_id)
                    .await
                    .map_err(|error| MailboxError::Parse(error.to_string()))?;
                tracing::info!(task_id, source, "task cancelled via mailbox");
                Ok(())
            }

            MailboxAction::RegisterChat {
                chat_id,
                chat_type,
                chat_title,
                trigger_mode,
            } => {
                if !is_main {
                    return Err(MailboxError::Unauthorized {
                        source_workspace: source.to_string(),
                        detail: "register_chat is main-only".to_string(),
                    });
                }
                let chat = RegisteredChat {
                    chat_id,
                    chat_type,
                    title: chat_title,
                    trigger: TriggerConfig {
                        mode: trigger_mode,
                        mention_pattern: None,
                    },
                    added_at: Utc::now(),
                    added_by: source.to_string(),
                    container: Default::default(),
                };
                self.registry
                    .register(chat)
                    .await
                    .map_err(|error| MailboxError::Parse(error.to_string()))?;
                tracing::info!(chat_id, "chat registered via mailbox");
                Ok(())
            }

            MailboxAction::ServiceControl { action } => {
                if !is_main {
                    return Err(MailboxError::Unauthorized {
                        source_workspace: source.to_string(),
                        detail: "service_control is main-only".to_string(),
                    });
                }
                let command = match action {
                    ServiceAction::Restart => ServiceCommand::Restart,
                    ServiceAction::Rebuild => ServiceCommand::Rebuild,
                };
                tracing::warn!(?command, "service control requested via mailbox");
                let _ = self.service_tx.send(command).await;
                Ok(())
            }
        }
    }

    /// `main` may target any chat; other workspaces only the registered chat
    /// their folder belongs to.
    async fn authorize_chat_target(
        &self,
        source: &str,
        is_main: bool,
        chat_id: ChatId,
    ) -> Result<(), MailboxError> {
        if is_main {
            return Ok(());
        }

        let owns_chat = match self.store.topic_by_folder(source).await {
            Ok(Some(topic)) => topic.chat_id == chat_id,
            _ => false,
        };
        if owns_chat && self.registry.is_registered(chat_id).await {
            return Ok(());
        }

        Err(MailboxError::Unauthorized {
            source_workspace: source.to_string(),
            detail: format!("workspace does not own chat {chat_id}"),
        })
    }

    async fn authorize_task_owner(
        &self,
        source: &str,
        is_main: bool,
        task_id: i64,
    ) -> Result<(), MailboxError> {
        if is_main {
            return Ok(());
        }
        let task = self
            .store
            .task(task_id)
            .await
            .map_err(|error| MailboxError::Parse(error.to_string()))?;
        match task {
            Some(task) if task.folder == source => Ok(()),
            Some(_) => Err(MailboxError::Unauthorized {
                source_workspace: source.to_string(),
                detail: format!("task {task_id} belongs to another workspace"),
            }),
            None => Err(MailboxError::Parse(format!("task {task_id} not found"))),
        }
    }

    async fn mutate_task(
        &self,
        source: &str,
        is_main: bool,
        task_id: i64,
        status: TaskStatus,
    ) -> Result<(), MailboxError> {
        self.authorize_task_owner(source, is_main, task_id).await?;
        self.store
            .set_task_status(task_id, status)
            .await
            .map_err(|error| MailboxError::Parse(error.to_string()))?;
        tracing::info!(task_id, status = status.as_str(), source, "task status changed via mailbox");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn schedule_task(
        &self,
        source: &str,
        is_main: bool,
        prompt: String,
        schedule_type: ScheduleType,
        schedule_value: String,
        context_mode: ContextMode,
        chat_id: Option<ChatId>,
        topic_id: TopicId,
        folder: Option<String>,
        created_by: Option<String>,
    ) -> Result<(), MailboxError> {
        validate_schedule(schedule_type, &schedule_value, self.config.timezone)
            .map_err(MailboxError::InvalidSchedule)?;

        // Non-main submissions own their tasks no matter what folder the
        // file claims.
        let owner_folder = if is_main {
            folder.unwrap_or_else(|| source.to_string())
        } else {
            source.to_string()
        };

        let (task_chat_id, task_topic_id) =
            match self.store.topic_by_folder(&owner_folder).await {
                Ok(Some(topic)) => (topic.chat_id, topic.topic_id),
                _ => (chat_id.unwrap_or_default(), topic_id),
            };

        let next_run = initial_next_run(
            schedule_type,
            &schedule_value,
            self.config.timezone,
            Utc::now(),
        )
        .map_err(|error| MailboxError::InvalidSchedule(error.to_string()))?;

        let task = self
            .store
            .create_task(NewTask {
                chat_id: task_chat_id,
                topic_id: task_topic_id,
                folder: owner_folder,
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                next_run,
            })
            .await
            .map_err(|error| MailboxError::Parse(error.to_string()))?;

        tracing::info!(
            task_id = task.id,
            folder = %task.folder,
            schedule_type = schedule_type.as_str(),
            created_by = created_by.as_deref().unwrap_or(source),
            "task scheduled via mailbox"
        );
        Ok(())
    }
}

/// Snapshot row for `current_tasks.json`, camelCase on the wire.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskSnapshot {
    id: i64,
    folder: String,
    prompt: String,
    schedule_type: String,
    schedule_value: String,
    status: String,
    next_run: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatsSnapshot {
    chats: Vec<RegisteredChat>,
    last_sync: chrono::DateTime<Utc>,
}

/// Write the task and chat snapshots a worker sees, scoped by privilege:
/// `main` sees everything, other workspaces only their own tasks and no
/// registry.
pub async fn write_snapshots(
    config: &Config,
    store: &Store,
    registry: &ChatRegistry,
    folder: &str,
) -> anyhow::Result<()> {
    let is_main = folder == MAIN_WORKSPACE;

    let tasks = if is_main {
        store.all_tasks().await?
    } else {
        store.tasks_for_folder(folder).await?
    };
    let task_rows: Vec<TaskSnapshot> = tasks
        .into_iter()
        .map(|task| TaskSnapshot {
            id: task.id,
            folder: task.folder,
            prompt: task.prompt,
            schedule_type: task.schedule_type.as_str().to_string(),
            schedule_value: task.schedule_value,
            status: task.status.as_str().to_string(),
            next_run: task.next_run,
        })
        .collect();

    let chats = ChatsSnapshot {
        chats: if is_main {
            registry.list().await
        } else {
            Vec::new()
        },
        last_sync: Utc::now(),
    };

    let ipc_dir = config.ipc_dir(folder);
    write_json_atomic(&ipc_dir.join("current_tasks.json"), &task_rows)?;
    write_json_atomic(&ipc_dir.join("available_chats.json"), &chats)?;
    Ok(())
}

/// Generate a mailbox filename: `<epoch_ms>-<rand6>.json`. Used by tests and
/// by any in-process producer; workers generate the same shape themselves.
pub fn mailbox_filename() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| {
            let n = rng.random_range(0..36u32);
            char::from_digit(n, 36).unwrap_or('0')
        })
        .collect();
    format!("{}-{}.json", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use tokio::sync::Mutex;

    /// Platform stub recording egress calls.
    struct RecordingClient {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatClient for RecordingClient {
        async fn send_message(
            &self,
            chat_id: ChatId,
            _topic_id: TopicId,
            text: &str,
            _reply_to: Option<&str>,
        ) -> anyhow::Result<()> {
            self.sent.lock().await.push(format!("msg:{chat_id}:{text}"));
            Ok(())
        }

        async fn send_reaction(
            &self,
            chat_id: ChatId,
            message_id: &str,
            emoji: &str,
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .await
                .push(format!("react:{chat_id}:{message_id}:{emoji}"));
            Ok(())
        }
    }

    struct Fixture {
        mailbox: Arc<Mailbox>,
        store: Store,
        registry: Arc<ChatRegistry>,
        client: Arc<RecordingClient>,
        service_rx: mpsc::Receiver<ServiceCommand>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env().unwrap();
        config.data_dir = dir.path().to_path_buf();
        let config = Arc::new(config);

        let db = Db::connect_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        let registry =
            Arc::new(ChatRegistry::load(config.registered_chats_file()).unwrap());
        let client = RecordingClient::new();
        let (service_tx, service_rx) = mpsc::channel(4);

        let mailbox = Mailbox::new(
            Arc::clone(&config),
            store.clone(),
            Arc::clone(&registry),
            client.clone() as Arc<dyn ChatClient>,
            service_tx,
        );

        Fixture {
            mailbox,
            store,
            registry,
            client,
            service_rx,
            _dir: dir,
        }
    }

    async fn register_family_chat(fixture: &Fixture) {
        fixture
            .registry
            .register(RegisteredChat {
                chat_id: 100,
                chat_type: ChatType::Group,
                title: "Family Chat".to_string(),
                trigger: TriggerConfig {
                    mode: TriggerMode::Mention,
                    mention_pattern: None,
                },
                added_at: Utc::now(),
                added_by: "main".to_string(),
                container: Default::default(),
            })
            .await
            .unwrap();
        fixture
            .store
            .upsert_topic(100, 0, "Family Chat", "family-chat", Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn message_from_owner_workspace_is_prefixed_and_sent() {
        let fixture = fixture().await;
        register_family_chat(&fixture).await;

        fixture
            .mailbox
            .apply(
                "family-chat",
                MailboxAction::Message {
                    chat_id: 100,
                    topic_id: 0,
                    text: "dinner is ready".to_string(),
                    folder: None,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        let sent = fixture.client.sent.lock().await;
        assert_eq!(sent.as_slice(), ["msg:100:Nanomi: dinner is ready"]);
    }

    #[tokio::test]
    async fn message_to_foreign_chat_is_rejected() {
        let fixture = fixture().await;
        register_family_chat(&fixture).await;

        let error = fixture
            .mailbox
            .apply(
                "family-chat",
                MailboxAction::Message {
                    chat_id: -999,
                    topic_id: 0,
                    text: "sneaky".to_string(),
                    folder: None,
                    timestamp: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(error, MailboxError::Unauthorized { .. }));
        assert!(fixture.client.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn schedule_task_coerces_owner_folder_for_non_main() {
        let fixture = fixture().await;
        register_family_chat(&fixture).await;

        fixture
            .mailbox
            .apply(
                "family-chat",
                MailboxAction::ScheduleTask {
                    prompt: "take over main".to_string(),
                    schedule_type: ScheduleType::Interval,
                    schedule_value: "60000".to_string(),
                    context_mode: ContextMode::Group,
                    chat_id: None,
                    topic_id: 0,
                    folder: Some("main".to_string()),
                    created_by: None,
                },
            )
            .await
            .unwrap();

        let tasks = fixture.store.all_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].folder, "family-chat");
        assert_eq!(tasks[0].chat_id, 100);
        assert!(tasks[0].next_run.is_some());
    }

    #[tokio::test]
    async fn schedule_task_rejects_invalid_values() {
        let fixture = fixture().await;

        let error = fixture
            .mailbox
            .apply(
                "family-chat",
                MailboxAction::ScheduleTask {
                    prompt: "p".to_string(),
                    schedule_type: ScheduleType::Cron,
                    schedule_value: "every tuesday".to_string(),
                    context_mode: ContextMode::Group,
                    chat_id: None,
                    topic_id: 0,
                    folder: None,
                    created_by: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(error, MailboxError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn task_mutations_require_ownership() {
        let fixture = fixture().await;
        register_family_chat(&fixture).await;

        let task = fixture
            .store
            .create_task(NewTask {
                chat_id: 100,
                topic_id: 0,
                folder: "family-chat".to_string(),
                prompt: "p".to_string(),
                schedule_type: ScheduleType::Interval,
                schedule_value: "60000".to_string(),
                context_mode: ContextMode::Group,
                next_run: Some(Utc::now()),
            })
            .await
            .unwrap();

        // A foreign workspace cannot pause it.
        let error = fixture
            .mailbox
            .apply("other-folder", MailboxAction::PauseTask { task_id: task.id })
            .await
            .unwrap_err();
        assert!(matches!(error, MailboxError::Unauthorized { .. }));

        // The owner can; main can cancel anything.
        fixture
            .mailbox
            .apply("family-chat", MailboxAction::PauseTask { task_id: task.id })
            .await
            .unwrap();
        assert_eq!(
            fixture.store.task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Paused
        );

        fixture
            .mailbox
            .apply("main", MailboxAction::CancelTask { task_id: task.id })
            .await
            .unwrap();
        assert!(fixture.store.task(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn register_chat_is_main_only() {
        let mut fixture = fixture().await;

        let action = MailboxAction::RegisterChat {
            chat_id: -1001,
            chat_type: ChatType::Supergroup,
            chat_title: "Dev".to_string(),
            trigger_mode: TriggerMode::Mention,
        };

        let error = fixture
            .mailbox
            .apply("family-chat", action.clone())
            .await
            .unwrap_err();
        assert!(matches!(error, MailboxError::Unauthorized { .. }));
        assert!(!fixture.registry.is_registered(-1001).await);

        fixture.mailbox.apply("main", action).await.unwrap();
        assert!(fixture.registry.is_registered(-1001).await);

        // Service control follows the same rule.
        let error = fixture
            .mailbox
            .apply(
                "family-chat",
                MailboxAction::ServiceControl {
                    action: ServiceAction::Restart,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(error, MailboxError::Unauthorized { .. }));

        fixture
            .mailbox
            .apply(
                "main",
                MailboxAction::ServiceControl {
                    action: ServiceAction::Restart,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            fixture.service_rx.recv().await,
            Some(ServiceCommand::Restart)
        );
    }

    #[tokio::test]
    async fn unknown_action_type_fails_parse_and_is_quarantined() {
        let fixture = fixture().await;
        let dir = fixture.mailbox.config.ipc_dir("family-chat").join("tasks");
        std::fs::create_dir_all(&dir).unwrap();

        let file = dir.join(mailbox_filename());
        std::fs::write(&file, r#"{"type":"rm_rf_everything","path":"/"}"#).unwrap();

        fixture.mailbox.poll_once().await;

        assert!(!file.exists());
        let errors_dir = fixture.mailbox.config.ipc_dir("family-chat").join("errors");
        assert_eq!(std::fs::read_dir(errors_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn snapshots_scope_by_privilege() {
        let fixture = fixture().await;
        register_family_chat(&fixture).await;
        fixture
            .store
            .create_task(NewTask {
                chat_id: 1,
                topic_id: 0,
                folder: "other".to_string(),
                prompt: "secret".to_string(),
                schedule_type: ScheduleType::Interval,
                schedule_value: "60000".to_string(),
                context_mode: ContextMode::Isolated,
                next_run: Some(Utc::now()),
            })
            .await
            .unwrap();

        for folder in ["main", "family-chat"] {
            fixture.mailbox.config.ensure_workspace_dirs(folder).unwrap();
            write_snapshots(
                &fixture.mailbox.config,
                &fixture.store,
                &fixture.registry,
                folder,
            )
            .await
            .unwrap();
        }

        let main_tasks: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(
                fixture.mailbox.config.ipc_dir("main").join("current_tasks.json"),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(main_tasks.as_array().unwrap().len(), 1);
        assert!(main_tasks[0].get("scheduleType").is_some());

        let group_tasks: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(
                fixture
                    .mailbox
                    .config
                    .ipc_dir("family-chat")
                    .join("current_tasks.json"),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(group_tasks.as_array().unwrap().len(), 0);

        let group_chats: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(
                fixture
                    .mailbox
                    .config
                    .ipc_dir("family-chat")
                    .join("available_chats.json"),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(group_chats["chats"].as_array().unwrap().len(), 0);
        let main_chats: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(
                fixture.mailbox.config.ipc_dir("main").join("available_chats.json"),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(main_chats["chats"].as_array().unwrap().len(), 1);
    }
}
