//! Message timeline persistence.

use super::{MessageKind, Store, StoredMessage};
use crate::error::DbError;
use crate::{ChatId, TopicId};
use chrono::{DateTime, Utc};
use sqlx::Row as _;

impl Store {
    /// Store a message. Idempotent on `(chat_id, topic_id, id)`: a replayed
    /// platform event is silently ignored.
    pub async fn store_message(&self, message: &StoredMessage) -> Result<(), DbError> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages \
             (chat_id, topic_id, id, sender_id, sender_name, content, type, timestamp, \
              is_bot, reply_to, reaction_emoji, reaction_action, target_message_id, \
              worker_session_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.chat_id)
        .bind(message.topic_id)
        .bind(&message.id)
        .bind(&message.sender_id)
        .bind(&message.sender_name)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.timestamp)
        .bind(message.is_bot)
        .bind(&message.reply_to)
        .bind(&message.reaction_emoji)
        .bind(&message.reaction_action)
        .bind(&message.target_message_id)
        .bind(&message.worker_session_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn message(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
        id: &str,
    ) -> Result<Option<StoredMessage>, DbError> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE chat_id = ? AND topic_id = ? AND id = ?",
        )
        .bind(chat_id)
        .bind(topic_id)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(message_from_row))
    }

    /// Text messages strictly after `since`, oldest first, excluding rows
    /// whose content starts with `exclude_prefix` (the assistant's own egress
    /// echoed back by the platform).
    pub async fn messages_since(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
        since: DateTime<Utc>,
        exclude_prefix: &str,
    ) -> Result<Vec<StoredMessage>, DbError> {
        let like = format!("{}%", exclude_prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            "SELECT * FROM messages \
             WHERE chat_id = ? AND topic_id = ? AND type = 'text' \
               AND timestamp > ? \
               AND content NOT LIKE ? ESCAPE '\\' \
             ORDER BY timestamp",
        )
        .bind(chat_id)
        .bind(topic_id)
        .bind(since)
        .bind(&like)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(message_from_row).collect())
    }
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        chat_id: row.try_get("chat_id").unwrap_or_default(),
        topic_id: row.try_get("topic_id").unwrap_or_default(),
        id: row.try_get("id").unwrap_or_default(),
        sender_id: row.try_get("sender_id").unwrap_or_default(),
        sender_name: row.try_get("sender_name").unwrap_or_default(),
        content: row.try_get("content").unwrap_or_default(),
        kind: row
            .try_get::<String, _>("type")
            .ok()
            .and_then(|v| MessageKind::parse(&v))
            .unwrap_or(MessageKind::Text),
        timestamp: row
            .try_get("timestamp")
            .unwrap_or_else(|_| Utc::now()),
        is_bot: row.try_get("is_bot").unwrap_or_default(),
        reply_to: row.try_get("reply_to").ok().flatten(),
        reaction_emoji: row.try_get("reaction_emoji").ok().flatten(),
        reaction_action: row.try_get("reaction_action").ok().flatten(),
        target_message_id: row.try_get("target_message_id").ok().flatten(),
        worker_session_id: row.try_get("worker_session_id").ok().flatten(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use chrono::Duration;

    fn text_message(id: &str, content: &str, at: DateTime<Utc>) -> StoredMessage {
        StoredMessage {
            chat_id: 100,
            topic_id: 0,
            id: id.to_string(),
            sender_id: "u1".to_string(),
            sender_name: "Ada".to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            timestamp: at,
            is_bot: false,
            reply_to: None,
            reaction_emoji: None,
            reaction_action: None,
            target_message_id: None,
            worker_session_id: None,
        }
    }

    #[tokio::test]
    async fn store_message_is_idempotent() {
        let db = Db::connect_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        let now = Utc::now();

        let message = text_message("m1", "hello", now);
        store.store_message(&message).await.unwrap();

        let mut replay = message.clone();
        replay.content = "different body, same id".to_string();
        store.store_message(&replay).await.unwrap();

        let stored = store.message(100, 0, "m1").await.unwrap().unwrap();
        assert_eq!(stored.content, "hello");
    }

    #[tokio::test]
    async fn messages_since_filters_and_orders() {
        let db = Db::connect_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        let base = Utc::now();

        store
            .store_message(&text_message("m1", "too old", base - Duration::minutes(5)))
            .await
            .unwrap();
        store
            .store_message(&text_message("m2", "second", base + Duration::seconds(2)))
            .await
            .unwrap();
        store
            .store_message(&text_message("m3", "first", base + Duration::seconds(1)))
            .await
            .unwrap();
        store
            .store_message(&text_message(
                "m4",
                "Nanomi: my own reply",
                base + Duration::seconds(3),
            ))
            .await
            .unwrap();

        let since = store
            .messages_since(100, 0, base, "Nanomi:")
            .await
            .unwrap();
        let contents: Vec<&str> = since.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }
}
