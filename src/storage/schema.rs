use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_error, StateError};

/// How long a second process waits for the lock before giving up.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Database
// ============================================================================

/// SQLite-backed state store.
///
/// Buckets are rows in `buckets`; keys live in `entries` with a foreign key
/// back to their bucket. The single pooled connection runs in exclusive
/// locking mode, so the file stays locked for as long as the handle is open
/// and a second process cannot share it.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the state database at `path` and runs
    /// migrations. `":memory:"` gives a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Locked`] if another process holds the file.
    /// Returns [`StateError::Migration`] if the schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, StateError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT).await
    }

    /// Like [`Database::open`] with an explicit lock wait.
    pub async fn open_with_busy_timeout(path: &str, busy_timeout: Duration) -> Result<Self, StateError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Create the file owner-only before SQLite gets to it
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set state database permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.as_os_str().is_empty() || parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    // If creation fails, SQLite will report the error at connect_with.
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok();
                }
            }
        }

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StateError::from_sqlx)?
            .locking_mode(SqliteLockingMode::Exclusive)
            .journal_mode(SqliteJournalMode::Delete)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        // One connection: all access is sequential, and an in-memory database
        // only exists for as long as its connection does.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(busy_timeout + Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(StateError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            if is_lock_error(&e.to_string()) {
                StateError::Locked
            } else {
                StateError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Creates the bucket and entry tables in one transaction.
    ///
    /// Statements use `IF NOT EXISTS`, so re-running on an existing database
    /// is a no-op. This write is also what takes the exclusive file lock.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                bucket TEXT NOT NULL REFERENCES buckets(name) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Always write something, even when the tables already exist
        sqlx::query("PRAGMA user_version = 1")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Closes the pool, releasing the file lock.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
