//! Per-workspace worker session tokens and last-agent timestamps.
//!
//! Both maps are owned by the dispatch core and persisted to a single JSON
//! file via atomic rename, so a supervisor restart resumes worker sessions
//! and does not replay already-answered history.

use crate::files::write_json_atomic;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionState {
    /// workspace folder → opaque worker session token.
    #[serde(default)]
    sessions: HashMap<String, String>,
    /// workspace folder → instant of the last successful agent reply.
    #[serde(default)]
    last_agent_timestamps: HashMap<String, DateTime<Utc>>,
}

/// File-backed session bookkeeping. Cheap handle, internally locked.
pub struct SessionStore {
    path: PathBuf,
    state: Mutex<SessionState>,
}

impl SessionStore {
    /// Load from disk; a missing file is an empty state.
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            SessionState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// The session token a worker should resume with, if any.
    pub async fn session_for(&self, folder: &str) -> Option<String> {
        self.state.lock().await.sessions.get(folder).cloned()
    }

    /// Record a token returned by a worker. Absence of a new token in a
    /// response keeps the previous one; nothing rotates tokens here.
    pub async fn record_session(&self, folder: &str, session_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state
            .sessions
            .insert(folder.to_string(), session_id.to_string());
        write_json_atomic(&self.path, &*state)
    }

    /// Timestamp of the last successful agent reply for a workspace; epoch
    /// start when the workspace has never been answered.
    pub async fn last_agent_timestamp(&self, folder: &str) -> DateTime<Utc> {
        self.state
            .lock()
            .await
            .last_agent_timestamps
            .get(folder)
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub async fn advance_last_agent_timestamp(
        &self,
        folder: &str,
        to: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.last_agent_timestamps.insert(folder.to_string(), to);
        write_json_atomic(&self.path, &*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = SessionStore::load(path.clone()).unwrap();
        store.record_session("family-chat", "s1").await.unwrap();
        let now = Utc::now();
        store
            .advance_last_agent_timestamp("family-chat", now)
            .await
            .unwrap();

        let reloaded = SessionStore::load(path).unwrap();
        assert_eq!(
            reloaded.session_for("family-chat").await.as_deref(),
            Some("s1")
        );
        assert_eq!(reloaded.last_agent_timestamp("family-chat").await, now);
    }

    #[tokio::test]
    async fn unknown_workspace_gets_epoch_floor() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path().join("sessions.json")).unwrap();
        assert!(store.session_for("nowhere").await.is_none());
        assert_eq!(
            store.last_agent_timestamp("nowhere").await,
            DateTime::<Utc>::MIN_UTC
        );
    }
}
