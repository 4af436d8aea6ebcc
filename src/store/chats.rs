//! Chat and topic persistence.

use super::{Chat, Store, Topic};
use crate::error::DbError;
use crate::{ChatId, ChatType, TopicId, TriggerMode};
use chrono::{DateTime, Utc};
use sqlx::Row as _;

impl Store {
    /// Create or refresh a chat row. Chats are never deleted by the core.
    pub async fn upsert_chat(
        &self,
        chat_id: ChatId,
        chat_type: ChatType,
        title: &str,
        last_activity: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO chats (chat_id, chat_type, title, last_activity) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(chat_id) DO UPDATE SET \
                 chat_type = excluded.chat_type, \
                 title = excluded.title, \
                 last_activity = excluded.last_activity",
        )
        .bind(chat_id)
        .bind(chat_type.as_str())
        .bind(title)
        .bind(last_activity)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn chat(&self, chat_id: ChatId) -> Result<Option<Chat>, DbError> {
        let row = sqlx::query(
            "SELECT chat_id, chat_type, title, last_activity FROM chats WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| Chat {
            chat_id: row.try_get("chat_id").unwrap_or_default(),
            chat_type: row
                .try_get::<String, _>("chat_type")
                .ok()
                .and_then(|v| ChatType::parse(&v))
                .unwrap_or(ChatType::Group),
            title: row.try_get("title").unwrap_or_default(),
            last_activity: row.try_get("last_activity").ok(),
        }))
    }

    /// Create or refresh a topic row. The folder assignment is stable: an
    /// existing row keeps its folder no matter what the caller passes.
    pub async fn upsert_topic(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
        name: &str,
        folder: &str,
        last_activity: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO topics (chat_id, topic_id, name, folder, last_activity) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(chat_id, topic_id) DO UPDATE SET \
                 name = excluded.name, \
                 last_activity = excluded.last_activity",
        )
        .bind(chat_id)
        .bind(topic_id)
        .bind(name)
        .bind(folder)
        .bind(last_activity)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn topic_by_key(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
    ) -> Result<Option<Topic>, DbError> {
        let row = sqlx::query(
            "SELECT chat_id, topic_id, name, folder, trigger_mode, last_activity \
             FROM topics WHERE chat_id = ? AND topic_id = ?",
        )
        .bind(chat_id)
        .bind(topic_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(topic_from_row))
    }

    pub async fn topic_by_folder(&self, folder: &str) -> Result<Option<Topic>, DbError> {
        let row = sqlx::query(
            "SELECT chat_id, topic_id, name, folder, trigger_mode, last_activity \
             FROM topics WHERE folder = ?",
        )
        .bind(folder)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(topic_from_row))
    }

    pub async fn topics_for_chat(&self, chat_id: ChatId) -> Result<Vec<Topic>, DbError> {
        let rows = sqlx::query(
            "SELECT chat_id, topic_id, name, folder, trigger_mode, last_activity \
             FROM topics WHERE chat_id = ? ORDER BY topic_id",
        )
        .bind(chat_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(topic_from_row).collect())
    }
}

fn topic_from_row(row: sqlx::sqlite::SqliteRow) -> Topic {
    Topic {
        chat_id: row.try_get("chat_id").unwrap_or_default(),
        topic_id: row.try_get("topic_id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        folder: row.try_get("folder").unwrap_or_default(),
        trigger_mode: row
            .try_get::<Option<String>, _>("trigger_mode")
            .ok()
            .flatten()
            .and_then(|v| TriggerMode::parse(&v)),
        last_activity: row.try_get("last_activity").ok(),
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Db;
    use crate::store::Store;
    use crate::{ChatType, GENERAL_TOPIC};
    use chrono::Utc;

    #[tokio::test]
    async fn upsert_topic_keeps_original_folder() {
        let db = Db::connect_memory().await.unwrap();
        let store = Store::new(db.pool.clone());

        store
            .upsert_topic(100, GENERAL_TOPIC, "Family Chat", "family-chat", Utc::now())
            .await
            .unwrap();
        store
            .upsert_topic(100, GENERAL_TOPIC, "Renamed", "other-folder", Utc::now())
            .await
            .unwrap();

        let topic = store.topic_by_key(100, GENERAL_TOPIC).await.unwrap().unwrap();
        assert_eq!(topic.folder, "family-chat");
        assert_eq!(topic.name, "Renamed");
    }

    #[tokio::test]
    async fn topic_by_folder_round_trips() {
        let db = Db::connect_memory().await.unwrap();
        let store = Store::new(db.pool.clone());

        store
            .upsert_chat(100, ChatType::Group, "Family Chat", Utc::now())
            .await
            .unwrap();
        store
            .upsert_topic(100, 7, "plans", "family-chat-plans", Utc::now())
            .await
            .unwrap();

        let topic = store.topic_by_folder("family-chat-plans").await.unwrap().unwrap();
        assert_eq!((topic.chat_id, topic.topic_id), (100, 7));
    }
}
