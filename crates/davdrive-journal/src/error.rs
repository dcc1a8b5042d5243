//! Journal error type

use thiserror::Error;

/// Errors raised by the SQLite journal
#[derive(Debug, Error)]
pub enum JournalError {
    /// The database could not be opened or created
    #[error("failed to open journal: {0}")]
    ConnectionFailed(String),

    /// Schema migration failed
    #[error("journal migration failed: {0}")]
    MigrationFailed(String),

    /// A stored value could not be mapped back to a domain type
    #[error("corrupt journal row: {0}")]
    CorruptRow(String),

    /// Underlying database error
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
