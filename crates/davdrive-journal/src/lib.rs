//! davdrive journal - durable per-folder sync state
//!
//! A single SQLite file per synchronized folder holds file records,
//! conflict records, selective-sync lists, upload resumption info and the
//! error blacklist. The schema is versioned through the `meta` table and
//! migrated stepwise on open; a journal written by a newer build is
//! refused.

mod error;
mod store;

pub use error::JournalError;
pub use store::SqliteJournal;

/// Schema version a freshly migrated journal ends up at.
pub const SCHEMA_VERSION: i64 = 1;
