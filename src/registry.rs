//! File-backed registry of chats the supervisor is allowed to process.
//!
//! The registry is the gate in front of everything else: a message from an
//! unregistered chat is dropped before it touches the router or the store of
//! record. The backing file is a JSON array rewritten atomically on every
//! mutation.

use crate::files::write_json_atomic;
use crate::{ChatId, ChatType, ContainerConfig, MAIN_WORKSPACE, TriggerMode};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Trigger policy for a registered chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub mode: TriggerMode,
    /// Defaults to `@<assistant_name>` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention_pattern: Option<String>,
}

/// A chat the supervisor will dispatch for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredChat {
    pub chat_id: ChatId,
    pub chat_type: ChatType,
    pub title: String,
    pub trigger: TriggerConfig,
    pub added_at: DateTime<Utc>,
    pub added_by: String,
    #[serde(default)]
    pub container: ContainerConfig,
}

/// In-memory view of the registered-chats file.
pub struct ChatRegistry {
    path: PathBuf,
    chats: RwLock<Vec<RegisteredChat>>,
}

impl ChatRegistry {
    /// Load from disk; a missing file is an empty registry.
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let chats = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            chats: RwLock::new(chats),
        })
    }

    pub async fn is_registered(&self, chat_id: ChatId) -> bool {
        self.chats.read().await.iter().any(|c| c.chat_id == chat_id)
    }

    pub async fn get(&self, chat_id: ChatId) -> Option<RegisteredChat> {
        self.chats
            .read()
            .await
            .iter()
            .find(|c| c.chat_id == chat_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<RegisteredChat> {
        self.chats.read().await.clone()
    }

    /// Add or replace a registration and rewrite the backing file.
    pub async fn register(&self, chat: RegisteredChat) -> anyhow::Result<()> {
        let mut chats = self.chats.write().await;
        chats.retain(|c| c.chat_id != chat.chat_id);
        chats.push(chat);
        write_json_atomic(&self.path, &*chats)
    }

    /// Remove a registration. Removal of an unknown chat is tolerated.
    pub async fn unregister(&self, chat_id: ChatId) -> anyhow::Result<bool> {
        let mut chats = self.chats.write().await;
        let before = chats.len();
        chats.retain(|c| c.chat_id != chat_id);
        let removed = chats.len() != before;
        if removed {
            write_json_atomic(&self.path, &*chats)?;
        }
        Ok(removed)
    }
}

/// Outcome of trigger evaluation for an inbound text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Dispatch, with the content to enqueue (mention pattern stripped).
    Fire { content: String },
    Skip,
}

/// Decide whether a text message fires a dispatch.
///
/// The `main` workspace always fires. Otherwise the registered chat's mode
/// applies; in mention mode every case-insensitive occurrence of the pattern
/// is stripped from the content before it is enqueued.
pub fn evaluate_trigger(
    folder: &str,
    trigger: &TriggerConfig,
    content: &str,
    assistant_name: &str,
) -> TriggerDecision {
    if folder == MAIN_WORKSPACE {
        return TriggerDecision::Fire {
            content: content.to_string(),
        };
    }

    match trigger.mode {
        TriggerMode::Always => TriggerDecision::Fire {
            content: content.to_string(),
        },
        TriggerMode::Disabled => TriggerDecision::Skip,
        TriggerMode::Mention => {
            let pattern = trigger
                .mention_pattern
                .clone()
                .unwrap_or_else(|| format!("@{assistant_name}"));
            match strip_mention(content, &pattern) {
                Some(stripped) => TriggerDecision::Fire { content: stripped },
                None => TriggerDecision::Skip,
            }
        }
    }
}

/// Case-insensitively strip all occurrences of `pattern`; None if absent.
///
/// A space run immediately before the mention is consumed with it so the
/// remaining text doesn't carry doubled spaces. Newlines are preserved.
fn strip_mention(content: &str, pattern: &str) -> Option<String> {
    let matcher = regex::RegexBuilder::new(&format!("[ \\t]*{}", regex::escape(pattern)))
        .case_insensitive(true)
        .build()
        .ok()?;
    if !matcher.is_match(content) {
        return None;
    }

    Some(matcher.replace_all(content, "").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mention_trigger(pattern: Option<&str>) -> TriggerConfig {
        TriggerConfig {
            mode: TriggerMode::Mention,
            mention_pattern: pattern.map(String::from),
        }
    }

    fn sample_chat(chat_id: ChatId) -> RegisteredChat {
        RegisteredChat {
            chat_id,
            chat_type: ChatType::Group,
            title: "Family Chat".to_string(),
            trigger: mention_trigger(Some("@Nanomi")),
            added_at: Utc::now(),
            added_by: "main".to_string(),
            container: ContainerConfig::default(),
        }
    }

    #[test]
    fn mention_mode_fires_and_strips_case_insensitively() {
        let decision = evaluate_trigger(
            "family-chat",
            &mention_trigger(Some("@Nanomi")),
            "hey @nanomi what's up @NANOMI",
            "Nanomi",
        );
        assert_eq!(
            decision,
            TriggerDecision::Fire {
                content: "hey what's up".to_string()
            }
        );
    }

    #[test]
    fn mention_mode_defaults_to_assistant_name() {
        let decision = evaluate_trigger(
            "family-chat",
            &mention_trigger(None),
            "ping @Nanomi please",
            "Nanomi",
        );
        assert_eq!(
            decision,
            TriggerDecision::Fire {
                content: "ping please".to_string()
            }
        );
    }

    #[test]
    fn mention_mode_skips_without_pattern() {
        let decision = evaluate_trigger(
            "family-chat",
            &mention_trigger(Some("@Nanomi")),
            "just chatting",
            "Nanomi",
        );
        assert_eq!(decision, TriggerDecision::Skip);
    }

    #[test]
    fn main_workspace_always_fires() {
        let trigger = TriggerConfig {
            mode: TriggerMode::Disabled,
            mention_pattern: None,
        };
        let decision = evaluate_trigger("main", &trigger, "anything", "Nanomi");
        assert!(matches!(decision, TriggerDecision::Fire { .. }));
    }

    #[test]
    fn disabled_mode_skips() {
        let trigger = TriggerConfig {
            mode: TriggerMode::Disabled,
            mention_pattern: None,
        };
        assert_eq!(
            evaluate_trigger("family-chat", &trigger, "@Nanomi hi", "Nanomi"),
            TriggerDecision::Skip
        );
    }

    #[tokio::test]
    async fn registry_round_trips_through_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registered_chats.json");

        let registry = ChatRegistry::load(path.clone()).unwrap();
        registry.register(sample_chat(-1001)).await.unwrap();
        registry.register(sample_chat(100)).await.unwrap();
        registry.unregister(-1001).await.unwrap();

        let reloaded = ChatRegistry::load(path).unwrap();
        assert!(reloaded.is_registered(100).await);
        assert!(!reloaded.is_registered(-1001).await);
        let chat = reloaded.get(100).await.unwrap();
        assert_eq!(chat.trigger.mention_pattern.as_deref(), Some("@Nanomi"));
    }

    #[tokio::test]
    async fn reregistration_replaces_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChatRegistry::load(dir.path().join("chats.json")).unwrap();

        registry.register(sample_chat(100)).await.unwrap();
        let mut updated = sample_chat(100);
        updated.trigger.mode = TriggerMode::Always;
        registry.register(updated).await.unwrap();

        let chats = registry.list().await;
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].trigger.mode, TriggerMode::Always);
    }
}
