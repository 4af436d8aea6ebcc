//! Session routing: each (chat, topic) pair ever seen maps to a unique,
//! permanent workspace folder.

use crate::error::DbError;
use crate::store::{Store, Topic};
use crate::{ChatId, GENERAL_TOPIC, MAIN_WORKSPACE, TopicId};
use chrono::Utc;

/// Maximum workspace folder length.
const MAX_FOLDER_LEN: usize = 50;

/// Routes conversations to workspace folders, persisting assignments through
/// the store so they survive restarts.
#[derive(Clone)]
pub struct SessionRouter {
    store: Store,
    /// The admin conversation bound to the privileged `main` workspace.
    main_chat_id: Option<ChatId>,
}

impl SessionRouter {
    pub fn new(store: Store, main_chat_id: Option<ChatId>) -> Self {
        Self {
            store,
            main_chat_id,
        }
    }

    /// Resolve the workspace for a (chat, topic), creating the assignment on
    /// first sighting. The folder is derived from the chat title (and topic
    /// name for non-general topics) and made unique with numeric suffixes.
    pub async fn workspace_for(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
        chat_title: &str,
        topic_name: &str,
    ) -> Result<Topic, DbError> {
        if let Some(existing) = self.store.topic_by_key(chat_id, topic_id).await? {
            return Ok(existing);
        }

        let folder = if self.main_chat_id == Some(chat_id) && topic_id == GENERAL_TOPIC {
            MAIN_WORKSPACE.to_string()
        } else {
            self.unique_folder(chat_id, chat_title, topic_id, topic_name)
                .await?
        };
        self.store
            .upsert_topic(chat_id, topic_id, topic_name, &folder, Utc::now())
            .await?;

        tracing::info!(chat_id, topic_id, %folder, "assigned workspace folder");

        // Re-read so a concurrent assignment (same key) resolves to one row.
        match self.store.topic_by_key(chat_id, topic_id).await? {
            Some(topic) => Ok(topic),
            None => Err(DbError::Query(sqlx::Error::RowNotFound)),
        }
    }

    async fn unique_folder(
        &self,
        chat_id: ChatId,
        chat_title: &str,
        topic_id: TopicId,
        topic_name: &str,
    ) -> Result<String, DbError> {
        let base = folder_candidate(chat_id, chat_title, topic_id, topic_name);

        if self.store.topic_by_folder(&base).await?.is_none() {
            return Ok(base);
        }
        for n in 1.. {
            let candidate = suffixed(&base, n);
            if self.store.topic_by_folder(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        unreachable!("suffix loop is unbounded")
    }
}

/// Build the pre-uniqueness candidate folder name.
fn folder_candidate(
    chat_id: ChatId,
    chat_title: &str,
    topic_id: TopicId,
    topic_name: &str,
) -> String {
    let chat_slug = slug(chat_title);
    let topic_slug = if topic_id == GENERAL_TOPIC {
        String::new()
    } else {
        slug(topic_name)
    };

    let candidate = match (chat_slug.is_empty(), topic_slug.is_empty()) {
        (false, false) => truncate_slug(&format!("{chat_slug}-{topic_slug}"), MAX_FOLDER_LEN),
        (false, true) => chat_slug,
        (true, false) => topic_slug,
        (true, true) => String::new(),
    };

    if candidate.is_empty() {
        format!("chat-{chat_id}")
    } else {
        candidate
    }
}

/// Append `-<n>`, trimming the base so the result stays within the limit.
fn suffixed(base: &str, n: u32) -> String {
    let suffix = format!("-{n}");
    let room = MAX_FOLDER_LEN.saturating_sub(suffix.len());
    let trimmed = truncate_slug(base, room);
    format!("{trimmed}{suffix}")
}

/// Slugify a display name: lowercase, keep `[a-z0-9 _-]`, whitespace to `-`,
/// collapse repeats, trim, truncate to 50.
pub fn slug(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mut out = String::with_capacity(lowered.len());

    for ch in lowered.chars() {
        match ch {
            'a'..='z' | '0'..='9' | '_' | '-' => out.push(ch),
            ch if ch.is_whitespace() => out.push('-'),
            _ => {}
        }
    }

    let mut collapsed = String::with_capacity(out.len());
    let mut previous_dash = false;
    for ch in out.chars() {
        if ch == '-' {
            if !previous_dash {
                collapsed.push('-');
            }
            previous_dash = true;
        } else {
            collapsed.push(ch);
            previous_dash = false;
        }
    }

    truncate_slug(collapsed.trim_matches('-'), MAX_FOLDER_LEN)
}

fn truncate_slug(value: &str, max: usize) -> String {
    let truncated: String = value.chars().take(max).collect();
    truncated.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn slug_basics() {
        assert_eq!(slug("Family Chat"), "family-chat");
        assert_eq!(slug("  Hello,   World!  "), "hello-world");
        assert_eq!(slug("déjà vu"), "dj-vu");
        assert_eq!(slug("___"), "___");
        assert_eq!(slug("!!!"), "");
    }

    #[test]
    fn slug_is_idempotent() {
        for input in ["Family Chat", "a--b  c", "Тест", "mixed_CASE-42"] {
            let once = slug(input);
            assert_eq!(slug(&once), once, "slug not idempotent for {input:?}");
            assert!(
                once.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_')),
                "unexpected character in {once:?}"
            );
        }
    }

    #[test]
    fn slug_truncates_to_fifty() {
        let long = "x".repeat(80);
        assert_eq!(slug(&long).len(), 50);
    }

    #[test]
    fn candidate_falls_back_to_chat_id() {
        assert_eq!(folder_candidate(-1001, "!!!", 0, ""), "chat--1001");
    }

    #[tokio::test]
    async fn router_assignment_is_stable_and_bijective() {
        let db = Db::connect_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        let router = SessionRouter::new(store.clone(), None);

        let first = router
            .workspace_for(100, 0, "Family Chat", "")
            .await
            .unwrap();
        assert_eq!(first.folder, "family-chat");

        // Same key again: same folder, no new row.
        let again = router
            .workspace_for(100, 0, "Family Chat Renamed", "")
            .await
            .unwrap();
        assert_eq!(again.folder, "family-chat");

        // Different chat with a colliding title gets a suffix.
        let second = router
            .workspace_for(200, 0, "Family Chat", "")
            .await
            .unwrap();
        assert_eq!(second.folder, "family-chat-1");

        // Bijection: folder resolves back to its (chat, topic).
        for (chat_id, topic) in [(100, &first), (200, &second)] {
            let resolved = store.topic_by_folder(&topic.folder).await.unwrap().unwrap();
            assert_eq!(resolved.chat_id, chat_id);
            assert_eq!(resolved.topic_id, 0);
        }
    }

    #[tokio::test]
    async fn topic_folders_combine_chat_and_topic_slugs() {
        let db = Db::connect_memory().await.unwrap();
        let router = SessionRouter::new(Store::new(db.pool.clone()), None);

        let topic = router
            .workspace_for(100, 7, "Family Chat", "Trip Plans")
            .await
            .unwrap();
        assert_eq!(topic.folder, "family-chat-trip-plans");
    }
}
