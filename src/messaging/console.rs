//! Console adapter: JSON-lines chat events on stdin, egress on stdout.
//!
//! Useful for driving the supervisor locally without a platform account:
//!
//! ```text
//! {"event":"message","chat_id":100,"message_id":"m1","sender_id":"u1", ...}
//! ```

use super::{ChatClient, ChatEvent};
use crate::{ChatId, TopicId};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::mpsc;

/// Outbound console frames, one JSON object per line.
#[derive(Debug, Serialize)]
#[serde(tag = "egress", rename_all = "snake_case")]
enum ConsoleFrame<'a> {
    Message {
        chat_id: ChatId,
        topic_id: TopicId,
        text: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<&'a str>,
    },
    Reaction {
        chat_id: ChatId,
        message_id: &'a str,
        emoji: &'a str,
    },
}

/// Stdin/stdout chat client.
pub struct ConsoleClient;

impl ConsoleClient {
    /// Spawn the stdin reader; malformed lines are logged and skipped.
    pub fn spawn_reader(event_tx: mpsc::Sender<ChatEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ChatEvent>(line) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "unparseable console event line");
                    }
                }
            }
            tracing::info!("console input closed");
        })
    }

    fn emit(frame: &ConsoleFrame<'_>) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(frame)?);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChatClient for ConsoleClient {
    async fn send_message(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
        text: &str,
        reply_to: Option<&str>,
    ) -> anyhow::Result<()> {
        Self::emit(&ConsoleFrame::Message {
            chat_id,
            topic_id,
            text,
            reply_to,
        })
    }

    async fn send_reaction(
        &self,
        chat_id: ChatId,
        message_id: &str,
        emoji: &str,
    ) -> anyhow::Result<()> {
        Self::emit(&ConsoleFrame::Reaction {
            chat_id,
            message_id,
            emoji,
        })
    }
}
