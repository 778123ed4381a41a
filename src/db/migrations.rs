//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // WAL for concurrent readers, FULL sync so a returned write survives a crash
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };

        // Run migrations
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        // Create schema version table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        // Check current version
        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        // Apply migrations
        if current_version < 1 {
            Self::migrate_v1(&mut conn).await?;
        }
        if current_version < 2 {
            Self::migrate_v2(&mut conn).await?;
        }
        if current_version < 3 {
            Self::migrate_v3(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: checkpoints, continuity ledger, run manifests
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v1");

        // Wrap migration in a transaction so partial failures don't leave the DB in a broken state
        Self::begin(conn, 1).await?;

        let result = async {
            Self::create_checkpoints_table(conn).await?;
            Self::create_continuity_schema(conn).await?;
            Self::create_run_manifests_table(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        Self::finish(conn, 1, result).await
    }

    /// Migration v2: item storage and media download outcomes
    async fn migrate_v2(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v2");

        Self::begin(conn, 2).await?;

        let result = async {
            Self::create_items_table(conn).await?;
            Self::create_media_downloads_table(conn).await?;
            Self::record_migration(conn, 2).await?;
            Ok::<(), Error>(())
        }
        .await;

        Self::finish(conn, 2, result).await
    }

    /// Migration v3: per-target id density, so sparse streams are not measured as gappy
    async fn migrate_v3(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v3");

        Self::begin(conn, 3).await?;

        let result = async {
            Self::ddl(
                conn,
                r#"
                CREATE TABLE continuity_targets (
                    target_id TEXT PRIMARY KEY,
                    sparse_ids INTEGER NOT NULL DEFAULT 0
                )
                "#,
                "continuity_targets table",
            )
            .await?;
            Self::record_migration(conn, 3).await?;
            Ok::<(), Error>(())
        }
        .await;

        Self::finish(conn, 3, result).await
    }

    async fn begin(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin migration v{}: {}",
                    version, e
                )))
            })?;
        Ok(())
    }

    async fn finish(conn: &mut SqliteConnection, version: i32, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v{}: {}",
                            version, e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!(version, "Database migration complete");
        Ok(())
    }

    /// Run one DDL statement, mapping failures to a migration error
    async fn ddl(conn: &mut SqliteConnection, sql: &str, what: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create {}: {}",
                what, e
            )))
        })?;
        Ok(())
    }

    /// One row per target
    async fn create_checkpoints_table(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            r#"
            CREATE TABLE checkpoints (
                target_id TEXT PRIMARY KEY,
                last_item_id INTEGER NOT NULL DEFAULT 0,
                last_run_at INTEGER NOT NULL,
                mode TEXT NOT NULL DEFAULT 'incremental',
                items_collected INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "checkpoints table",
        )
        .await
    }

    /// Ledger rows plus the append-only history used for edit detection
    async fn create_continuity_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            r#"
            CREATE TABLE continuity (
                target_id TEXT NOT NULL,
                expected_item_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'unknown',
                first_seen_at INTEGER NOT NULL,
                last_checked_at INTEGER NOT NULL,
                text_checksum TEXT,
                PRIMARY KEY (target_id, expected_item_id)
            )
            "#,
            "continuity table",
        )
        .await?;

        Self::ddl(
            conn,
            "CREATE INDEX idx_continuity_status ON continuity(target_id, status)",
            "index",
        )
        .await?;

        Self::ddl(
            conn,
            r#"
            CREATE TABLE status_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                observed_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                text_checksum TEXT,
                text_length INTEGER
            )
            "#,
            "status_history table",
        )
        .await?;

        Self::ddl(
            conn,
            "CREATE INDEX idx_status_history_item ON status_history(target_id, item_id)",
            "index",
        )
        .await
    }

    async fn create_run_manifests_table(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            r#"
            CREATE TABLE run_manifests (
                run_id TEXT PRIMARY KEY,
                fetcher TEXT NOT NULL,
                target_ids TEXT NOT NULL,
                mode TEXT NOT NULL,
                item_limit INTEGER NOT NULL DEFAULT 0,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER,
                collected INTEGER NOT NULL DEFAULT 0,
                throttle_events INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                route_rotations INTEGER NOT NULL DEFAULT 0,
                media_downloaded INTEGER NOT NULL DEFAULT 0,
                media_failed INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "run_manifests table",
        )
        .await?;

        Self::ddl(
            conn,
            "CREATE INDEX idx_run_manifests_start ON run_manifests(start_ts DESC)",
            "index",
        )
        .await
    }

    async fn create_items_table(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            r#"
            CREATE TABLE items (
                target_id TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                posted_at INTEGER,
                text TEXT,
                presence TEXT NOT NULL DEFAULT 'present',
                media TEXT NOT NULL DEFAULT '[]',
                payload TEXT NOT NULL DEFAULT 'null',
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (target_id, item_id)
            )
            "#,
            "items table",
        )
        .await
    }

    async fn create_media_downloads_table(conn: &mut SqliteConnection) -> Result<()> {
        Self::ddl(
            conn,
            r#"
            CREATE TABLE media_downloads (
                target_id TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                locator TEXT NOT NULL,
                status TEXT NOT NULL,
                file_path TEXT,
                bytes INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (target_id, item_id, locator)
            )
            "#,
            "media_downloads table",
        )
        .await
    }

    /// Record a migration as applied
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
