//! Chat platform seam.
//!
//! The platform client is an external collaborator: the supervisor only
//! depends on the events it delivers and the two egress operations below.
//! Real adapters (Telegram and friends) live out of tree; the bundled
//! console adapter exists for local development and tests.

pub mod console;

use crate::{ChatId, ChatType, TopicId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Egress operations the supervisor needs from a platform client.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a text message, optionally replying to a platform message id.
    async fn send_message(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
        text: &str,
        reply_to: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Deliver an emoji reaction to a message.
    async fn send_reaction(
        &self,
        chat_id: ChatId,
        message_id: &str,
        emoji: &str,
    ) -> anyhow::Result<()>;
}

/// Whether a reaction was added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// A text message delivered by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    #[serde(default)]
    pub topic_id: TopicId,
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub chat_type: ChatType,
    #[serde(default)]
    pub chat_title: String,
    #[serde(default)]
    pub topic_name: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// A reaction event delivered by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingReaction {
    pub chat_id: ChatId,
    #[serde(default)]
    pub topic_id: TopicId,
    /// Platform id for the reaction event itself.
    pub event_id: String,
    pub target_message_id: String,
    pub emoji: String,
    pub action: ReactionAction,
    pub sender_id: String,
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
    pub chat_type: ChatType,
    #[serde(default)]
    pub chat_title: String,
    #[serde(default)]
    pub topic_name: String,
}

/// Everything the platform can hand the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatEvent {
    Message(IncomingMessage),
    Reaction(IncomingReaction),
}
