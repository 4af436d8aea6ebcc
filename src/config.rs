//! Supervisor configuration, loaded once from the environment at startup.
//!
//! Nothing here hot-reloads; a `service_control` restart is the way to pick
//! up new values.

use anyhow::{Context as _, anyhow};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables that may be forwarded into worker containers via the
/// filtered env file. Everything else in the supervisor's environment stays
/// on the host.
pub const ENV_WHITELIST: &[&str] = &["CLAUDE_CODE_OAUTH_TOKEN", "ANTHROPIC_API_KEY"];

#[derive(Debug, Clone)]
pub struct Config {
    /// Display name of the assistant; also the default mention pattern
    /// (`@<assistant_name>`) and the egress prefix (`<assistant_name>: `).
    pub assistant_name: String,
    /// Scheduler tick period.
    pub scheduler_poll: Duration,
    /// Mailbox poll period.
    pub mailbox_poll: Duration,
    /// Container runtime binary (`docker`, `podman`, ...).
    pub runtime_bin: String,
    /// Image reference for worker containers.
    pub image: String,
    /// Default per-request deadline; registered chats may override.
    pub request_timeout: Duration,
    /// Cap on a cold worker's stdout and stderr, each.
    pub max_output_bytes: usize,
    /// Warm worker idle timeout; zero disables the warm pool entirely.
    pub warm_idle_timeout: Duration,
    /// IANA timezone used for cron schedules.
    pub timezone: chrono_tz::Tz,
    /// Log filter directive (`info`, `debug`, ...).
    pub log_level: String,
    /// Opaque chat platform token; handed to the chat client only.
    pub bot_token: Option<String>,
    /// The privileged admin conversation. Its general topic is bound to the
    /// `main` workspace.
    pub main_chat_id: Option<crate::ChatId>,
    /// Root for all supervisor-owned state.
    pub data_dir: PathBuf,
    /// Project root, resolved at load so `service_control` rebuilds never
    /// depend on the process working directory.
    pub project_root: PathBuf,
    /// Command run by `service_control {action: rebuild}` from the project root.
    pub rebuild_command: String,
    /// Additional-mount allowlist file, stored outside the project and never
    /// itself mounted.
    pub allowlist_path: PathBuf,
}

impl Config {
    /// Load from environment variables with defaults for everything except
    /// values that fail to parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let timezone_name = env_or("TIMEZONE", "UTC");
        let timezone: chrono_tz::Tz = timezone_name
            .parse()
            .map_err(|_| anyhow!("TIMEZONE '{timezone_name}' is not a valid IANA timezone"))?;

        let project_root = match std::env::var_os("NANOCLAW_PROJECT_ROOT") {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        let project_root = project_root
            .canonicalize()
            .unwrap_or(project_root);

        let allowlist_path = match std::env::var_os("MOUNT_ALLOWLIST_FILE") {
            Some(path) => PathBuf::from(path),
            None => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nanoclaw/mount-allowlist.json"),
        };

        Ok(Self {
            assistant_name: env_or("ASSISTANT_NAME", "Nanomi"),
            scheduler_poll: Duration::from_secs(env_parsed("SCHEDULER_POLL_SECS", 60)?),
            mailbox_poll: Duration::from_millis(env_parsed("MAILBOX_POLL_MS", 1000)?),
            runtime_bin: env_or("CONTAINER_RUNTIME", "docker"),
            image: env_or("CONTAINER_IMAGE", "nanoclaw-agent:latest"),
            request_timeout: Duration::from_secs(env_parsed("CONTAINER_TIMEOUT_SECS", 300)?),
            max_output_bytes: env_parsed("MAX_OUTPUT_BYTES", 10 * 1024 * 1024)?,
            // Zero or negative disables the warm pool.
            warm_idle_timeout: Duration::from_secs(
                env_parsed::<i64>("WARM_IDLE_TIMEOUT_SECS", 1800)?.max(0) as u64,
            ),
            timezone,
            log_level: env_or("LOG_LEVEL", "info"),
            bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.is_empty()),
            main_chat_id: match std::env::var("MAIN_CHAT_ID") {
                Ok(raw) if !raw.is_empty() => Some(
                    raw.parse()
                        .map_err(|error| anyhow!("invalid MAIN_CHAT_ID='{raw}': {error}"))?,
                ),
                _ => None,
            },
            data_dir: PathBuf::from(env_or("NANOCLAW_DATA_DIR", "./data")),
            project_root,
            rebuild_command: env_or("REBUILD_COMMAND", "make build"),
            allowlist_path,
        })
    }

    /// Whether the warm pool is enabled at all.
    pub fn warm_pool_enabled(&self) -> bool {
        !self.warm_idle_timeout.is_zero()
    }

    /// Root directory holding one folder per workspace.
    pub fn groups_dir(&self) -> PathBuf {
        self.data_dir.join("groups")
    }

    /// Workspace folder on the host.
    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir().join(folder)
    }

    /// Per-workspace mailbox root (contains `messages/`, `tasks/`, `errors/`).
    pub fn ipc_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("ipc").join(folder)
    }

    /// Per-workspace worker state, mounted at `/home/node/.claude`.
    pub fn state_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("worker-state").join(folder)
    }

    /// Per-workspace filtered env directory, mounted read-only when present.
    pub fn env_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("env").join(folder)
    }

    /// Workspace→session map and last-agent timestamps.
    pub fn sessions_file(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    /// File-backed registered-chat array.
    pub fn registered_chats_file(&self) -> PathBuf {
        self.data_dir.join("registered_chats.json")
    }

    /// SQLite database location.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("nanoclaw.db")
    }

    /// Ensure the directory skeleton a workspace needs exists on disk.
    pub fn ensure_workspace_dirs(&self, folder: &str) -> anyhow::Result<()> {
        for dir in [
            self.group_dir(folder),
            self.ipc_dir(folder).join("messages"),
            self.ipc_dir(folder).join("tasks"),
            self.ipc_dir(folder).join("errors"),
            self.state_dir(folder),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|error| anyhow!("invalid {key}='{raw}': {error}")),
        _ => Ok(default),
    }
}

/// Materialize the filtered env directory for a workspace: a single `worker.env`
/// file containing only whitelisted variables present in the supervisor's own
/// environment. Returns false when no whitelisted variable is set (and removes
/// any stale file so the mount planner skips the bind).
pub fn materialize_env_dir(env_dir: &Path) -> anyhow::Result<bool> {
    let mut lines = String::new();
    for key in ENV_WHITELIST {
        if let Ok(value) = std::env::var(key)
            && !value.is_empty()
        {
            lines.push_str(&format!("{key}={value}\n"));
        }
    }

    let env_file = env_dir.join("worker.env");
    if lines.is_empty() {
        if env_file.exists() {
            std::fs::remove_file(&env_file)
                .with_context(|| format!("failed to remove {}", env_file.display()))?;
        }
        return Ok(false);
    }

    std::fs::create_dir_all(env_dir)
        .with_context(|| format!("failed to create {}", env_dir.display()))?;
    crate::files::write_atomic(&env_file, lines.as_bytes())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.scheduler_poll, Duration::from_secs(60));
        assert_eq!(config.mailbox_poll, Duration::from_millis(1000));
        assert_eq!(config.max_output_bytes, 10 * 1024 * 1024);
        assert!(config.warm_pool_enabled());
    }

    #[test]
    fn workspace_paths_nest_under_data_dir() {
        let mut config = Config::from_env().unwrap();
        config.data_dir = PathBuf::from("/tmp/nanoclaw-test");
        assert_eq!(
            config.group_dir("family-chat"),
            PathBuf::from("/tmp/nanoclaw-test/groups/family-chat")
        );
        assert_eq!(
            config.ipc_dir("family-chat"),
            PathBuf::from("/tmp/nanoclaw-test/ipc/family-chat")
        );
    }
}
