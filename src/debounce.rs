//! Inbound message debouncing: rapid-fire messages in one conversation are
//! merged into a single dispatch after a quiescence window.

use crate::{ChatId, TopicId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Quiescence window: a buffer flushes once no new message has arrived for
/// this long.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Sender label used when a batch mixes senders.
const MULTI_SENDER_LABEL: &str = "multiple senders";

/// A message waiting in a debounce buffer.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub chat_id: ChatId,
    pub topic_id: TopicId,
    pub folder: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub message_id: String,
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One merged flush handed to the dispatch core.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub chat_id: ChatId,
    pub topic_id: TopicId,
    pub folder: String,
    /// Merged content in timestamp order; informational — the dispatcher
    /// rebuilds the authoritative prompt from the store.
    pub content: String,
    pub sender_label: String,
    /// Newest inbound message id; the reply target for the agent's answer.
    pub reply_target: String,
    pub newest_timestamp: DateTime<Utc>,
}

struct Buffer {
    messages: Vec<PendingMessage>,
    generation: u64,
}

/// Per-conversation debounce buffers. Cloneable handle.
#[derive(Clone)]
pub struct Debouncer {
    window: Duration,
    buffers: Arc<Mutex<HashMap<String, Buffer>>>,
    flush_tx: mpsc::Sender<FlushBatch>,
}

impl Debouncer {
    /// Create a debouncer delivering batches into `flush_tx`.
    pub fn new(window: Duration, flush_tx: mpsc::Sender<FlushBatch>) -> Self {
        Self {
            window,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            flush_tx,
        }
    }

    fn key(chat_id: ChatId, topic_id: TopicId) -> String {
        format!("{chat_id}_{topic_id}")
    }

    /// Append a firing message and (re)arm the buffer's quiescence timer.
    pub async fn push(&self, message: PendingMessage) {
        let key = Self::key(message.chat_id, message.topic_id);
        let generation = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(key.clone()).or_insert(Buffer {
                messages: Vec::new(),
                generation: 0,
            });
            buffer.messages.push(message);
            buffer.generation += 1;
            buffer.generation
        };

        let debouncer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debouncer.window).await;
            debouncer.fire_if_quiescent(&key, generation).await;
        });
    }

    /// Flush the buffer if no message arrived since this timer was armed.
    async fn fire_if_quiescent(&self, key: &str, generation: u64) {
        let batch = {
            let mut buffers = self.buffers.lock().await;
            let quiescent = buffers
                .get(key)
                .is_some_and(|buffer| buffer.generation == generation && !buffer.messages.is_empty());
            if quiescent {
                buffers.remove(key).map(|buffer| merge(buffer.messages))
            } else {
                None
            }
        };

        if let Some(batch) = batch
            && self.flush_tx.send(batch).await.is_err()
        {
            tracing::warn!("debounce flush receiver dropped");
        }
    }

    /// Drain every pending buffer immediately. Used on shutdown so buffered
    /// messages are dispatched before the process exits.
    pub async fn flush_all(&self) {
        let batches: Vec<FlushBatch> = {
            let mut buffers = self.buffers.lock().await;
            buffers
                .drain()
                .filter(|(_, buffer)| !buffer.messages.is_empty())
                .map(|(_, buffer)| merge(buffer.messages))
                .collect()
        };

        for batch in batches {
            if self.flush_tx.send(batch).await.is_err() {
                tracing::warn!("debounce flush receiver dropped during shutdown flush");
            }
        }
    }
}

/// Merge buffered messages in timestamp order into one batch.
fn merge(mut messages: Vec<PendingMessage>) -> FlushBatch {
    messages.sort_by_key(|m| m.timestamp);

    let first = &messages[0];
    let chat_id = first.chat_id;
    let topic_id = first.topic_id;
    let folder = first.folder.clone();

    let unique_senders: std::collections::HashSet<&str> =
        messages.iter().map(|m| m.sender_id.as_str()).collect();
    let multi_sender = unique_senders.len() > 1;

    let content = if multi_sender {
        messages
            .iter()
            .map(|m| format!("[{}]: {}", m.sender_name, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n")
    };

    let sender_label = if multi_sender {
        MULTI_SENDER_LABEL.to_string()
    } else {
        first.sender_name.clone()
    };

    let newest = messages
        .last()
        .map(|m| (m.message_id.clone(), m.timestamp))
        .unwrap_or_default();

    FlushBatch {
        chat_id,
        topic_id,
        folder,
        content,
        sender_label,
        reply_target: newest.0,
        newest_timestamp: newest.1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn message(
        sender: &str,
        content: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> PendingMessage {
        PendingMessage {
            chat_id: 100,
            topic_id: 0,
            folder: "family-chat".to_string(),
            sender_id: sender.to_lowercase(),
            sender_name: sender.to_string(),
            content: content.to_string(),
            message_id: id.to_string(),
            reply_to: None,
            timestamp: at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_produces_single_flush() {
        let (tx, mut rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(DEBOUNCE_WINDOW, tx);
        let base = Utc::now();

        debouncer.push(message("Ada", "first", "m1", base)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer
            .push(message("Ada", "second", "m2", base + ChronoDuration::seconds(1)))
            .await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.content, "first\nsecond");
        assert_eq!(batch.sender_label, "Ada");
        assert_eq!(batch.reply_target, "m2");

        // Nothing further pending.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn gap_beyond_window_produces_two_flushes() {
        let (tx, mut rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(DEBOUNCE_WINDOW, tx);
        let base = Utc::now();

        debouncer.push(message("Ada", "first", "m1", base)).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "first");

        debouncer
            .push(message("Ada", "later", "m2", base + ChronoDuration::seconds(10)))
            .await;
        let second = rx.recv().await.unwrap();
        assert_eq!(second.content, "later");
    }

    #[tokio::test(start_paused = true)]
    async fn multi_sender_batches_are_attributed() {
        let (tx, mut rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(DEBOUNCE_WINDOW, tx);
        let base = Utc::now();

        debouncer
            .push(message("Bob", "out of order", "m2", base + ChronoDuration::seconds(1)))
            .await;
        debouncer.push(message("Ada", "hello", "m1", base)).await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.content, "[Ada]: hello\n[Bob]: out of order");
        assert_eq!(batch.sender_label, "multiple senders");
        assert_eq!(batch.reply_target, "m2");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_drains_pending_buffers() {
        let (tx, mut rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(DEBOUNCE_WINDOW, tx);

        debouncer
            .push(message("Ada", "pending", "m1", Utc::now()))
            .await;
        debouncer.flush_all().await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.content, "pending");
    }
}
