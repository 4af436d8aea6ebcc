//! Crate-wide error types.

use std::time::Duration;
use thiserror::Error;

/// Top-level supervisor error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Store-level failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Worker-pool failures. Every variant resolves the caller with a
/// `ContainerOutput` error rather than propagating to the user.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn container: {0}")]
    Spawn(String),

    #[error("worker not ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("request deadline of {0:?} exceeded")]
    RequestTimeout(Duration),

    #[error("worker exited unexpectedly")]
    WorkerExited,

    #[error("worker stdio protocol violation: {0}")]
    Protocol(String),
}

/// Mailbox ingestion failures. Files triggering these are moved to the
/// workspace's `errors/` directory for inspection.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("unparseable mailbox file: {0}")]
    Parse(String),

    #[error("unauthorized action from workspace '{source_workspace}': {detail}")]
    Unauthorized { source_workspace: String, detail: String },

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
