use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// State store errors. Any of these ends the current run.
#[derive(Debug, Error)]
pub enum StateError {
    /// Another process holds the state database
    #[error("Another feedmail process appears to be using the state database. Wait for it to finish and try again.")]
    Locked,

    /// Migration failed
    #[error("State database migration failed: {0}")]
    Migration(String),

    /// A write targeted a bucket that was never created
    #[error("No such bucket: {0}")]
    MissingBucket(String),

    /// Generic database error
    #[error("State database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StateError {
    /// Maps lock-related SQLite failures to [`StateError::Locked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err.to_string()) {
            return StateError::Locked;
        }
        StateError::Database(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) messages.
pub(crate) fn is_lock_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

/// Value stored under every seen key. Only presence matters.
pub const SEEN_MARKER: &[u8] = b"seen";
