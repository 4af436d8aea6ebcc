//! Mount planning: the ordered list of host→container binds for a workspace.
//!
//! Planning is a pure function of the workspace paths, privilege class, chat
//! type, per-chat container config, the external allowlist, and a
//! file-existence predicate. Nothing here touches the filesystem directly, so
//! the whole security policy is unit-testable.

use crate::{Bind, ChatType, ContainerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Container-side mount points.
const PROJECT_MOUNT: &str = "/workspace/project";
const GROUP_MOUNT: &str = "/workspace/group";
const GROUP_INSTRUCTIONS_MOUNT: &str = "/workspace/group/CLAUDE.md";
const GLOBAL_MOUNT: &str = "/workspace/global";
const WORKER_STATE_MOUNT: &str = "/home/node/.claude";
const IPC_MOUNT: &str = "/workspace/ipc";
const ENV_DIR_MOUNT: &str = "/workspace/env-dir";
const EXTRA_MOUNT_ROOT: &str = "/workspace/extra";

/// Host paths the planner composes into a plan. All derived from `Config`
/// path helpers by the caller.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub project_root: PathBuf,
    pub group_dir: PathBuf,
    /// `main/CLAUDE.md`, overlaid into private chats.
    pub main_instructions: PathBuf,
    /// `global/CLAUDE.md`, overlaid into group chats.
    pub global_instructions: PathBuf,
    pub global_dir: PathBuf,
    pub state_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub env_dir: PathBuf,
}

/// A mount request that was refused, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedMount {
    pub host_path: String,
    pub reason: String,
}

/// The ordered bind list plus the report of refused extra mounts.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub binds: Vec<Bind>,
    pub dropped: Vec<DroppedMount>,
}

/// External allowlist governing additional mounts. Lives outside the project
/// and is never itself mounted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountAllowlist {
    /// Roots a requested host path must fall under (after `~` expansion).
    #[serde(default)]
    pub allowed_roots: Vec<String>,
    /// Glob-style patterns that refuse a path outright (ssh keys, cloud
    /// credentials, .env files, ...).
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    /// Force read-only for every extra mount outside `main`.
    #[serde(default)]
    pub non_main_read_only: bool,
}

impl MountAllowlist {
    /// Load from a JSON file; a missing file denies all extra mounts.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(allowlist) => allowlist,
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "unparseable mount allowlist, denying all extra mounts");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

/// Build the bind list for one worker invocation.
///
/// `exists` gates the optional overlays (instruction files, global folder,
/// env dir); injecting it keeps planning deterministic under test.
pub fn plan_mounts(
    paths: &WorkspacePaths,
    is_main: bool,
    chat_type: ChatType,
    container: &ContainerConfig,
    allowlist: &MountAllowlist,
    exists: &dyn Fn(&Path) -> bool,
) -> MountPlan {
    let mut binds = Vec::new();
    let mut dropped = Vec::new();

    if is_main {
        binds.push(Bind::rw(&paths.project_root, PROJECT_MOUNT));
        binds.push(Bind::rw(&paths.group_dir, GROUP_MOUNT));
    } else {
        binds.push(Bind::rw(&paths.group_dir, GROUP_MOUNT));

        let instructions = if chat_type == ChatType::Private {
            &paths.main_instructions
        } else {
            &paths.global_instructions
        };
        if exists(instructions) {
            binds.push(Bind::ro(instructions, GROUP_INSTRUCTIONS_MOUNT));
        }
        if exists(&paths.global_dir) {
            binds.push(Bind::ro(&paths.global_dir, GLOBAL_MOUNT));
        }
    }

    binds.push(Bind::rw(&paths.state_dir, WORKER_STATE_MOUNT));
    binds.push(Bind::rw(&paths.ipc_dir, IPC_MOUNT));
    if exists(&paths.env_dir) {
        binds.push(Bind::ro(&paths.env_dir, ENV_DIR_MOUNT));
    }

    for extra in &container.mounts {
        match validate_extra_mount(extra.host_path.as_str(), allowlist) {
            Ok(host) => {
                let read_only =
                    extra.read_only || (allowlist.non_main_read_only && !is_main);
                let sub = sanitize_sub(&extra.container_sub);
                binds.push(Bind {
                    host,
                    container: format!("{EXTRA_MOUNT_ROOT}/{sub}"),
                    read_only,
                });
            }
            Err(reason) => {
                dropped.push(DroppedMount {
                    host_path: extra.host_path.clone(),
                    reason,
                });
            }
        }
    }

    MountPlan { binds, dropped }
}

/// Check one requested host path against the allowlist.
fn validate_extra_mount(requested: &str, allowlist: &MountAllowlist) -> Result<PathBuf, String> {
    let expanded = expand_home(requested);

    if expanded
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err("path traversal ('..') is not allowed".to_string());
    }

    let contained = allowlist.allowed_roots.iter().any(|root| {
        let root = expand_home(root);
        expanded.starts_with(&root)
    });
    if !contained {
        return Err("path is outside every allowed root".to_string());
    }

    for pattern in &allowlist.blocked_patterns {
        if glob_matches(pattern, &expanded) {
            return Err(format!("path matches blocked pattern '{pattern}'"));
        }
    }

    Ok(expanded)
}

/// Expand a leading `~` against the supervisor's home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(path)
}

/// Case-insensitive glob match against the full path, or any single path
/// segment when the pattern contains no separator (`.env`, `*.pem`).
fn glob_matches(pattern: &str, path: &Path) -> bool {
    let regex = match glob_to_regex(pattern) {
        Some(regex) => regex,
        None => return false,
    };

    if pattern.contains('/') {
        return regex.is_match(&path.to_string_lossy());
    }
    path.components().any(|component| {
        regex.is_match(&component.as_os_str().to_string_lossy())
    })
}

/// Translate a glob into an anchored regex: `**` spans separators, `*` and
/// `?` do not.
fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let mut translated = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following slash so `**/` also matches nothing.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        translated.push_str("(?:.*/)?");
                    } else {
                        translated.push_str(".*");
                    }
                } else {
                    translated.push_str("[^/]*");
                }
            }
            '?' => translated.push_str("[^/]"),
            ch => translated.push_str(&regex::escape(&ch.to_string())),
        }
    }
    translated.push('$');

    regex::RegexBuilder::new(&translated)
        .case_insensitive(true)
        .build()
        .ok()
}

/// Keep extra-mount container names to one safe path segment.
fn sanitize_sub(sub: &str) -> String {
    let cleaned: String = sub
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '-',
        })
        .collect();
    let trimmed = cleaned.trim_matches(['-', '.']);
    if trimmed.is_empty() {
        "mount".to_string()
    } else {
        trimmed.to_string()
    }
}
