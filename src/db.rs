//! Database connection management and migrations.

use crate::error::DbError;
use sqlx::SqlitePool;
use std::path::Path;

/// SQLite connection bundle for the supervisor's durable collections.
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Connect and run migrations. The file is created on first start.
    pub async fn connect(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent() {
            // Connect fails with an opaque sqlite error if the directory is missing.
            let _ = std::fs::create_dir_all(parent);
        }

        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests. A single long-lived connection is
    /// required: every new `:memory:` connection is a fresh, empty database.
    pub async fn connect_memory() -> Result<Self, DbError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Close the pool gracefully.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
