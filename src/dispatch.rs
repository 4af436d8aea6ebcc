//! Dispatch core: chat event → debounce → prompt assembly → worker pool →
//! platform egress. Owns the per-workspace session tokens and last-agent
//! timestamps.

use crate::config::{Config, materialize_env_dir};
use crate::debounce::{Debouncer, FlushBatch, PendingMessage};
use crate::messaging::{ChatClient, ChatEvent, IncomingMessage, IncomingReaction, ReactionAction};
use crate::mounts::{MountAllowlist, WorkspacePaths, plan_mounts};
use crate::pool::WorkerPool;
use crate::registry::{ChatRegistry, TriggerDecision, evaluate_trigger};
use crate::router::SessionRouter;
use crate::sessions::SessionStore;
use crate::store::{MessageKind, Store, StoredMessage};
use crate::{
    ChatId, ChatType, ContainerConfig, ContainerJob, ContainerOutput, MAIN_WORKSPACE,
};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

/// Orchestrates the full dispatch flow. One instance per supervisor.
pub struct Dispatch {
    config: Arc<Config>,
    store: Store,
    registry: Arc<ChatRegistry>,
    router: SessionRouter,
    pool: Arc<WorkerPool>,
    sessions: Arc<SessionStore>,
    platform: Arc<dyn ChatClient>,
    allowlist: MountAllowlist,
}

impl Dispatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Store,
        registry: Arc<ChatRegistry>,
        router: SessionRouter,
        pool: Arc<WorkerPool>,
        sessions: Arc<SessionStore>,
        platform: Arc<dyn ChatClient>,
        allowlist: MountAllowlist,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            registry,
            router,
            pool,
            sessions,
            platform,
            allowlist,
        })
    }

    /// Ingress: one platform event. Messages are stored and (when the trigger
    /// fires) debounced; added reactions may dispatch immediately.
    pub async fn handle_event(&self, event: ChatEvent, debouncer: &Debouncer) {
        let result = match event {
            ChatEvent::Message(message) => self.handle_message(message, debouncer).await,
            ChatEvent::Reaction(reaction) => self.handle_reaction(reaction).await,
        };
        if let Err(error) = result {
            tracing::warn!(%error, "failed to handle chat event");
        }
    }

    async fn handle_message(
        &self,
        message: IncomingMessage,
        debouncer: &Debouncer,
    ) -> crate::error::Result<()> {
        let registered = self.registry.get(message.chat_id).await;
        let is_main_chat = self.config.main_chat_id == Some(message.chat_id);
        if registered.is_none() && !is_main_chat {
            tracing::debug!(chat_id = message.chat_id, "message from unregistered chat ignored");
            return Ok(());
        }

        self.store
            .upsert_chat(
                message.chat_id,
                message.chat_type,
                &message.chat_title,
                message.timestamp,
            )
            .await?;
        let topic = self
            .router
            .workspace_for(
                message.chat_id,
                message.topic_id,
                &message.chat_title,
                &message.topic_name,
            )
            .await?;

        let decision = match &registered {
            _ if topic.folder == MAIN_WORKSPACE => TriggerDecision::Fire {
                content: message.text.clone(),
            },
            Some(chat) => evaluate_trigger(
                &topic.folder,
                &chat.trigger,
                &message.text,
                &self.config.assistant_name,
            ),
            None => TriggerDecision::Skip,
        };

        // Mention-stripped content is what both the store and the prompt see.
        let content = match &decision {
            TriggerDecision::Fire { content } => content.clone(),
            TriggerDecision::Skip => message.text.clone(),
        };

        self.store
            .store_message(&StoredMessage {
                chat_id: message.chat_id,
                topic_id: message.topic_id,
                id: message.message_id.clone(),
                sender_id: message.sender_id.clone(),
                sender_name: message.sender_name.clone(),
                content: content.clone(),
                kind: MessageKind::Text,
                timestamp: message.timestamp,
                is_bot: message.is_bot,
                reply_to: message.reply_to.clone(),
                reaction_emoji: None,
                reaction_action: None,
                target_message_id: None,
                worker_session_id: None,
            })
            .await?;

        if message.is_bot {
            return Ok(());
        }

        if let TriggerDecision::Fire { content } = decision {
            debouncer
                .push(PendingMessage {
                    chat_id: message.chat_id,
                    topic_id: message.topic_id,
                    folder: topic.folder,
                    sender_id: message.sender_id,
                    sender_name: message.sender_name,
                    content,
                    message_id: message.message_id,
                    reply_to: message.reply_to,
                    timestamp: message.timestamp,
                })
                .await;
        }

        Ok(())
    }

    async fn handle_reaction(&self, reaction: IncomingReaction) -> crate::error::Result<()> {
        let registered = self.registry.get(reaction.chat_id).await;
        if registered.is_none() && self.config.main_chat_id != Some(reaction.chat_id) {
            tracing::debug!(chat_id = reaction.chat_id, "reaction from unregistered chat ignored");
            return Ok(());
        }

        let topic = self
            .router
            .workspace_for(
                reaction.chat_id,
                reaction.topic_id,
                &reaction.chat_title,
                &reaction.topic_name,
            )
            .await?;

        self.store
            .store_message(&StoredMessage {
                chat_id: reaction.chat_id,
                topic_id: reaction.topic_id,
                id: reaction.event_id.clone(),
                sender_id: reaction.sender_id.clone(),
                sender_name: reaction.sender_name.clone(),
                content: String::new(),
                kind: MessageKind::Reaction,
                timestamp: reaction.timestamp,
                is_bot: false,
                reply_to: None,
                reaction_emoji: Some(reaction.emoji.clone()),
                reaction_action: Some(
                    match reaction.action {
                        ReactionAction::Added => "added",
                        ReactionAction::Removed => "removed",
                    }
                    .to_string(),
                ),
                target_message_id: Some(reaction.target_message_id.clone()),
                worker_session_id: None,
            })
            .await?;

        if reaction.action == ReactionAction::Removed {
            return Ok(());
        }

        // Added reactions dispatch when they target the bot's own message, or
        // unconditionally in always-mode chats.
        let target = self
            .store
            .message(reaction.chat_id, reaction.topic_id, &reaction.target_message_id)
            .await?;
        let targets_bot = target.map(|m| m.is_bot).unwrap_or(false);
        let always_mode = registered
            .as_ref()
            .map(|c| c.trigger.mode == crate::TriggerMode::Always)
            .unwrap_or(false);
        if !targets_bot && !always_mode {
            return Ok(());
        }

        let prompt = format!(
            "<reaction reactor=\"{}\" emoji=\"{}\" target_message_id=\"{}\"/>",
            xml_escape(&reaction.sender_name),
            xml_escape(&reaction.emoji),
            xml_escape(&reaction.target_message_id),
        );

        let job = ContainerJob {
            prompt,
            session_id: self.sessions.session_for(&topic.folder).await,
            folder: topic.folder.clone(),
            session_key: topic.folder.clone(),
            is_main: topic.folder == MAIN_WORKSPACE,
            is_scheduled_task: false,
            chat_type: registered.as_ref().map(|c| c.chat_type),
        };

        let output = self
            .execute_in_workspace(&topic.folder, reaction.chat_id, job)
            .await;
        self.deliver_result(&topic.folder, reaction.chat_id, reaction.topic_id, output, None)
            .await;
        Ok(())
    }

    /// A debounce flush: rebuild the prompt from the store and run the worker.
    pub async fn handle_flush(&self, batch: FlushBatch) {
        if batch.folder != MAIN_WORKSPACE && !self.registry.is_registered(batch.chat_id).await {
            tracing::debug!(chat_id = batch.chat_id, "chat unregistered since buffering, dropping flush");
            return;
        }

        let since = self.sessions.last_agent_timestamp(&batch.folder).await;
        let exclude_prefix = format!("{}:", self.config.assistant_name);
        let messages = match self
            .store
            .messages_since(batch.chat_id, batch.topic_id, since, &exclude_prefix)
            .await
        {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(%error, folder = %batch.folder, "failed to collect messages for dispatch");
                return;
            }
        };
        if messages.is_empty() {
            return;
        }

        let prompt = build_messages_prompt(&messages);
        let registered = self.registry.get(batch.chat_id).await;

        let job = ContainerJob {
            prompt,
            session_id: self.sessions.session_for(&batch.folder).await,
            folder: batch.folder.clone(),
            session_key: batch.folder.clone(),
            is_main: batch.folder == MAIN_WORKSPACE,
            is_scheduled_task: false,
            chat_type: registered.as_ref().map(|c| c.chat_type),
        };

        let output = self
            .execute_in_workspace(&batch.folder, batch.chat_id, job)
            .await;
        self.deliver_result(
            &batch.folder,
            batch.chat_id,
            batch.topic_id,
            output,
            Some(batch.reply_target.as_str()),
        )
        .await;
    }

    /// Run a job in a workspace: snapshots, env file, mount plan, pool call,
    /// session-token bookkeeping. Shared by message dispatch, reaction
    /// dispatch, and the scheduler.
    pub async fn execute_in_workspace(
        &self,
        folder: &str,
        chat_id: ChatId,
        job: ContainerJob,
    ) -> ContainerOutput {
        if let Err(error) = self.config.ensure_workspace_dirs(folder) {
            return ContainerOutput::error(format!("workspace setup failed: {error}"));
        }
        if let Err(error) =
            crate::mailbox::write_snapshots(&self.config, &self.store, &self.registry, folder)
                .await
        {
            tracing::warn!(%error, %folder, "failed to write worker snapshots");
        }
        if let Err(error) = materialize_env_dir(&self.config.env_dir(folder)) {
            tracing::warn!(%error, %folder, "failed to materialize env dir");
        }

        let registered = self.registry.get(chat_id).await;
        let container = registered
            .as_ref()
            .map(|c| c.container.clone())
            .unwrap_or_else(ContainerConfig::default);
        let chat_type = job
            .chat_type
            .or(registered.as_ref().map(|c| c.chat_type))
            .unwrap_or(ChatType::Group);
        let is_main = folder == MAIN_WORKSPACE;

        let paths = WorkspacePaths {
            project_root: self.config.project_root.clone(),
            group_dir: self.config.group_dir(folder),
            main_instructions: self.config.group_dir(MAIN_WORKSPACE).join("CLAUDE.md"),
            global_instructions: self
                .config
                .group_dir(crate::GLOBAL_WORKSPACE)
                .join("CLAUDE.md"),
            global_dir: self.config.group_dir(crate::GLOBAL_WORKSPACE),
            state_dir: self.config.state_dir(folder),
            ipc_dir: self.config.ipc_dir(folder),
            env_dir: self.config.env_dir(folder),
        };
        let plan = plan_mounts(
            &paths,
            is_main,
            chat_type,
            &container,
            &self.allowlist,
            &|path: &Path| path.exists(),
        );
        for dropped in &plan.dropped {
            tracing::warn!(
                host_path = %dropped.host_path,
                reason = %dropped.reason,
                %folder,
                "extra mount dropped by allowlist"
            );
        }

        let output = self.pool.run(folder, &job, &plan.binds, &container).await;

        if let Some(session_id) = &output.new_session_id
            && let Err(error) = self.sessions.record_session(folder, session_id).await
        {
            tracing::warn!(%error, %folder, "failed to persist worker session id");
        }

        output
    }

    /// Egress for a completed dispatch. Successful non-empty results advance
    /// the last-agent timestamp and go to the chat with the assistant prefix;
    /// failures are logged and silently abandoned.
    async fn deliver_result(
        &self,
        folder: &str,
        chat_id: ChatId,
        topic_id: crate::TopicId,
        output: ContainerOutput,
        reply_to: Option<&str>,
    ) {
        if !output.is_success() {
            tracing::warn!(
                %folder,
                error = output.error.as_deref().unwrap_or("unknown"),
                "worker dispatch failed, no reply sent"
            );
            return;
        }
        let result = match output.result.as_deref() {
            Some(result) if !result.trim().is_empty() => result.trim().to_string(),
            _ => {
                tracing::debug!(%folder, "worker returned empty result, nothing to send");
                return;
            }
        };

        // Advance before egress: a platform failure must not cause historical
        // context to be re-sent on the next dispatch.
        if let Err(error) = self
            .sessions
            .advance_last_agent_timestamp(folder, Utc::now())
            .await
        {
            tracing::warn!(%error, %folder, "failed to persist last-agent timestamp");
        }

        let record = StoredMessage {
            chat_id,
            topic_id,
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: String::new(),
            sender_name: self.config.assistant_name.clone(),
            content: result.clone(),
            kind: MessageKind::AgentResponse,
            timestamp: Utc::now(),
            is_bot: true,
            reply_to: reply_to.map(String::from),
            reaction_emoji: None,
            reaction_action: None,
            target_message_id: None,
            worker_session_id: self.sessions.session_for(folder).await,
        };
        if let Err(error) = self.store.store_message(&record).await {
            tracing::warn!(%error, %folder, "failed to persist agent response");
        }

        let text = format!("{}: {}", self.config.assistant_name, result);
        if let Err(error) = self
            .platform
            .send_message(chat_id, topic_id, &text, reply_to)
            .await
        {
            tracing::warn!(%error, chat_id, "platform egress failed");
        }
    }
}

/// Escape `&`, `<`, `>`, `"` for prompt XML.
fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            ch => escaped.push(ch),
        }
    }
    escaped
}

/// Render the `<messages>` prompt for a dispatch.
fn build_messages_prompt(messages: &[StoredMessage]) -> String {
    let mut prompt = String::from("<messages>\n");
    for message in messages {
        prompt.push_str(&format!(
            "  <message sender=\"{}\" time=\"{}\">{}</message>\n",
            xml_escape(&message.sender_name),
            message
                .timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            xml_escape(&message.content),
        ));
    }
    prompt.push_str("</messages>");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn message(sender: &str, content: &str, at: &str) -> StoredMessage {
        StoredMessage {
            chat_id: 100,
            topic_id: 0,
            id: "m1".to_string(),
            sender_id: sender.to_lowercase(),
            sender_name: sender.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            timestamp: DateTime::parse_from_rfc3339(at)
                .unwrap()
                .with_timezone(&Utc),
            is_bot: false,
            reply_to: None,
            reaction_emoji: None,
            reaction_action: None,
            target_message_id: None,
            worker_session_id: None,
        }
    }

    #[test]
    fn xml_escape_covers_reserved_characters() {
        assert_eq!(
            xml_escape(r#"a & b < c > d "e""#),
            "a &amp; b &lt; c &gt; d &quot;e&quot;"
        );
    }

    #[test]
    fn prompt_contains_one_entry_per_message() {
        let messages = vec![
            message("Ada", "hey what's up", "2026-02-01T10:00:00Z"),
            message("Bob", "2 < 3 & 4 > 1", "2026-02-01T10:00:01Z"),
        ];
        let prompt = build_messages_prompt(&messages);

        assert!(prompt.starts_with("<messages>"));
        assert!(prompt.ends_with("</messages>"));
        assert_eq!(prompt.matches("<message ").count(), 2);
        assert!(prompt.contains(
            "<message sender=\"Ada\" time=\"2026-02-01T10:00:00Z\">hey what's up</message>"
        ));
        assert!(prompt.contains("2 &lt; 3 &amp; 4 &gt; 1"));
    }
}
