//! SQLite implementation of IJournal
//!
//! Handles all domain type serialization/deserialization and SQL query
//! construction.
//!
//! ## Type Mapping
//!
//! | Domain Type | SQL Type | Strategy                                    |
//! |-------------|----------|---------------------------------------------|
//! | SyncPath    | TEXT     | relative slash path via `as_str` / `new`    |
//! | FileId      | TEXT     | string via `as_str` / `new`                 |
//! | ETag        | TEXT     | string via `as_str` / `new`                 |
//! | Checksum    | TEXT     | `ALGO:HEX` via `Display` / `parse`          |
//! | FileType    | TEXT     | `file` / `directory` / `virtual`            |
//! | timestamps  | INTEGER  | unix seconds                                |

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;

use davdrive_core::domain::{
    BlacklistCategory, BlacklistEntry, Checksum, ConflictRecord, ETag, FileId, FileRecord,
    FileType, SelectiveSyncKind, SyncPath, UploadInfo,
};
use davdrive_core::ports::IJournal;

use crate::error::JournalError;
use crate::SCHEMA_VERSION;

/// Schema steps, applied in order starting from the stored version.
/// Version n of the journal has had `MIGRATIONS[..n]` applied.
const MIGRATIONS: &[&str] = &[include_str!("migrations/0001_schema.sql")];

/// SQLite-backed journal for one synchronized folder
///
/// The database file lives next to (or inside) the folder it describes;
/// each folder gets its own journal, so there is no cross-folder state to
/// coordinate. All writes run in their own transaction; a sync run is the
/// single writer, concurrent readers see WAL snapshots.
#[derive(Debug)]
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    /// Opens (creating if needed) the journal database at `db_path` and
    /// brings its schema up to date.
    pub async fn open(db_path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                JournalError::ConnectionFailed(format!(
                    "cannot create journal directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        // WAL keeps status readers (CLI, other processes) off the sync
        // run's back; the busy timeout covers their write-lock windows.
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                JournalError::ConnectionFailed(format!(
                    "cannot open journal at {}: {e}",
                    db_path.display()
                ))
            })?;

        Self::migrate(&pool).await?;

        tracing::info!(path = %db_path.display(), "journal opened");
        Ok(Self { pool })
    }

    /// Creates an in-memory journal for testing. A single connection is
    /// required: SQLite in-memory databases are per-connection.
    pub async fn in_memory() -> Result<Self, JournalError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                JournalError::ConnectionFailed(format!("cannot create in-memory journal: {e}"))
            })?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applies pending schema steps. A journal written by a newer build is
    /// refused rather than guessed at.
    async fn migrate(pool: &SqlitePool) -> Result<(), JournalError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
        )
        .execute(pool)
        .await
        .map_err(|e| JournalError::MigrationFailed(format!("cannot create meta table: {e}")))?;

        let stored = Self::stored_schema_version(pool).await?;
        if stored > SCHEMA_VERSION {
            return Err(JournalError::MigrationFailed(format!(
                "journal schema {stored} is newer than this build supports ({SCHEMA_VERSION})"
            )));
        }

        for (step, migration) in MIGRATIONS.iter().enumerate().skip(stored as usize) {
            let version = step as i64 + 1;
            sqlx::raw_sql(migration).execute(pool).await.map_err(|e| {
                JournalError::MigrationFailed(format!("schema step {version} failed: {e}"))
            })?;
            sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)")
                .bind(version.to_string())
                .execute(pool)
                .await
                .map_err(|e| {
                    JournalError::MigrationFailed(format!(
                        "cannot record schema version {version}: {e}"
                    ))
                })?;
            tracing::debug!(version, "journal schema step applied");
        }

        Ok(())
    }

    async fn stored_schema_version(pool: &SqlitePool) -> Result<i64, JournalError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM meta WHERE key = 'schema_version'")
                .fetch_optional(pool)
                .await?;
        match row {
            None => Ok(0),
            Some((value,)) => value
                .parse()
                .map_err(|_| JournalError::CorruptRow(format!("schema_version = {value:?}"))),
        }
    }

    /// The schema version this journal is at.
    pub async fn schema_version(&self) -> Result<i64, JournalError> {
        Self::stored_schema_version(&self.pool).await
    }
}

// ============================================================================
// Row mapping helpers
// ============================================================================

fn file_type_to_string(t: FileType) -> &'static str {
    match t {
        FileType::File => "file",
        FileType::Directory => "directory",
        FileType::Virtual => "virtual",
    }
}

fn file_type_from_string(s: &str) -> Result<FileType, JournalError> {
    match s {
        "file" => Ok(FileType::File),
        "directory" => Ok(FileType::Directory),
        "virtual" => Ok(FileType::Virtual),
        other => Err(JournalError::CorruptRow(format!("file type {other:?}"))),
    }
}

fn category_to_string(c: BlacklistCategory) -> &'static str {
    match c {
        BlacklistCategory::Transient => "transient",
        BlacklistCategory::Permanent => "permanent",
    }
}

fn category_from_string(s: &str) -> Result<BlacklistCategory, JournalError> {
    match s {
        "transient" => Ok(BlacklistCategory::Transient),
        "permanent" => Ok(BlacklistCategory::Permanent),
        other => Err(JournalError::CorruptRow(format!(
            "blacklist category {other:?}"
        ))),
    }
}

fn sync_path_from_row(s: &str) -> Result<SyncPath, JournalError> {
    SyncPath::new(s).map_err(|e| JournalError::CorruptRow(format!("path {s:?}: {e}")))
}

fn file_record_from_row(row: &SqliteRow) -> Result<FileRecord, JournalError> {
    let path: String = row.try_get("path")?;
    let file_id: String = row.try_get("file_id")?;
    let etag: String = row.try_get("etag")?;
    let checksum: Option<String> = row.try_get("checksum")?;
    let file_type: String = row.try_get("file_type")?;

    Ok(FileRecord {
        path: sync_path_from_row(&path)?,
        inode: row.try_get::<i64, _>("inode")? as u64,
        modtime: row.try_get("modtime")?,
        size: row.try_get::<i64, _>("size")? as u64,
        file_id: FileId::new(file_id)
            .map_err(|e| JournalError::CorruptRow(format!("file id: {e}")))?,
        etag: ETag::new(etag).map_err(|e| JournalError::CorruptRow(format!("etag: {e}")))?,
        checksum: checksum
            .as_deref()
            .map(Checksum::parse)
            .transpose()
            .map_err(|e| JournalError::CorruptRow(format!("checksum: {e}")))?,
        file_type: file_type_from_string(&file_type)?,
        perm: row.try_get::<i64, _>("perm")? as u32,
        remote_perm: row.try_get("remote_perm")?,
    })
}

fn upload_info_from_row(row: &SqliteRow) -> Result<UploadInfo, JournalError> {
    Ok(UploadInfo {
        transfer_id: row.try_get::<i64, _>("transfer_id")? as u64,
        chunk_offset: row.try_get::<i64, _>("chunk_offset")? as u64,
        chunk_size: row.try_get::<i64, _>("chunk_size")? as u64,
        modtime: row.try_get("modtime")?,
        size: row.try_get::<i64, _>("size")? as u64,
        error_count: row.try_get::<i64, _>("error_count")? as u32,
        valid: row.try_get::<i64, _>("valid")? != 0,
    })
}

/// SQL LIKE pattern matching everything strictly below `prefix`.
fn subtree_pattern(prefix: &SyncPath) -> String {
    if prefix.is_root() {
        "%".to_string()
    } else {
        format!("{}/%", prefix.as_str())
    }
}

// ============================================================================
// IJournal implementation
// ============================================================================

#[async_trait]
impl IJournal for SqliteJournal {
    async fn get_file_record(&self, path: &SyncPath) -> anyhow::Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM file_records WHERE path = ?1")
            .bind(path.as_str())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(file_record_from_row).transpose().map_err(Into::into)
    }

    async fn set_file_record(&self, record: &FileRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO file_records \
             (path, inode, modtime, size, file_id, etag, checksum, file_type, perm, remote_perm) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(record.path.as_str())
        .bind(record.inode as i64)
        .bind(record.modtime)
        .bind(record.size as i64)
        .bind(record.file_id.as_str())
        .bind(record.etag.as_str())
        .bind(record.checksum.as_ref().map(ToString::to_string))
        .bind(file_type_to_string(record.file_type))
        .bind(record.perm as i64)
        .bind(record.remote_perm.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_file_record(&self, path: &SyncPath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM file_records WHERE path = ?1")
            .bind(path.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn delete_subtree(&self, prefix: &SyncPath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM file_records WHERE path = ?1 OR path LIKE ?2")
            .bind(prefix.as_str())
            .bind(subtree_pattern(prefix))
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn get_files_below(&self, prefix: &SyncPath) -> anyhow::Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM file_records WHERE path = ?1 OR path LIKE ?2 ORDER BY path",
        )
        .bind(prefix.as_str())
        .bind(subtree_pattern(prefix))
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(file_record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn rename_subtree(&self, old: &SyncPath, new: &SyncPath) -> anyhow::Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE file_records SET path = ?1 WHERE path = ?2")
            .bind(new.as_str())
            .bind(old.as_str())
            .execute(&mut *tx)
            .await?;
        // Re-key descendants by splicing the new prefix in front of the
        // preserved tail.
        sqlx::query(
            "UPDATE file_records SET path = ?1 || substr(path, ?2) WHERE path LIKE ?3",
        )
        .bind(format!("{}/", new.as_str()))
        .bind((old.as_str().len() + 2) as i64)
        .bind(subtree_pattern(old))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn schedule_path_for_remote_discovery(&self, path: &SyncPath) -> anyhow::Result<()> {
        let mut targets = vec![path.clone()];
        targets.extend(path.ancestors());

        let mut tx = self.pool().begin().await?;
        for target in &targets {
            sqlx::query("UPDATE file_records SET etag = ?1 WHERE path = ?2")
                .bind(ETag::INVALID)
                .bind(target.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::debug!(path = %path, "scheduled for remote rediscovery");
        Ok(())
    }

    async fn force_remote_discovery_next_sync(&self) -> anyhow::Result<()> {
        sqlx::query("UPDATE file_records SET etag = ?1 WHERE file_type = 'directory'")
            .bind(ETag::INVALID)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn set_selective_sync_list(
        &self,
        kind: SelectiveSyncKind,
        paths: &[SyncPath],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM selective_sync WHERE kind = ?1")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        for path in paths {
            sqlx::query("INSERT OR REPLACE INTO selective_sync (kind, path) VALUES (?1, ?2)")
                .bind(kind.as_str())
                .bind(path.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if kind == SelectiveSyncKind::BlackList {
            for path in paths {
                self.schedule_path_for_remote_discovery(path).await?;
            }
        }
        Ok(())
    }

    async fn get_selective_sync_list(
        &self,
        kind: SelectiveSyncKind,
    ) -> anyhow::Result<Vec<SyncPath>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM selective_sync WHERE kind = ?1 ORDER BY path")
                .bind(kind.as_str())
                .fetch_all(self.pool())
                .await?;
        rows.into_iter()
            .map(|(p,)| sync_path_from_row(&p).map_err(Into::into))
            .collect()
    }

    async fn get_upload_info(&self, path: &SyncPath) -> anyhow::Result<Option<UploadInfo>> {
        let row = sqlx::query("SELECT * FROM upload_infos WHERE path = ?1")
            .bind(path.as_str())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(upload_info_from_row).transpose().map_err(Into::into)
    }

    async fn set_upload_info(&self, path: &SyncPath, info: &UploadInfo) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO upload_infos \
             (path, transfer_id, chunk_offset, chunk_size, modtime, size, error_count, valid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(path.as_str())
        .bind(info.transfer_id as i64)
        .bind(info.chunk_offset as i64)
        .bind(info.chunk_size as i64)
        .bind(info.modtime)
        .bind(info.size as i64)
        .bind(info.error_count as i64)
        .bind(i64::from(info.valid))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn clear_upload_info(&self, path: &SyncPath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM upload_infos WHERE path = ?1")
            .bind(path.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn set_conflict_record(&self, record: &ConflictRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO conflict_records \
             (path, base_path, base_file_id, base_etag, base_modtime) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(record.path.as_str())
        .bind(record.base_path.as_str())
        .bind(record.base_file_id.as_ref().map(|f| f.as_str().to_string()))
        .bind(record.base_etag.as_ref().map(|e| e.as_str().to_string()))
        .bind(record.base_modtime)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_conflict_record(
        &self,
        path: &SyncPath,
    ) -> anyhow::Result<Option<ConflictRecord>> {
        let row = sqlx::query("SELECT * FROM conflict_records WHERE path = ?1")
            .bind(path.as_str())
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };

        let path: String = row.try_get("path")?;
        let base_path: String = row.try_get("base_path")?;
        let base_file_id: Option<String> = row.try_get("base_file_id")?;
        let base_etag: Option<String> = row.try_get("base_etag")?;

        Ok(Some(ConflictRecord {
            path: sync_path_from_row(&path)?,
            base_path: sync_path_from_row(&base_path)?,
            base_file_id: base_file_id
                .map(FileId::new)
                .transpose()
                .map_err(|e| JournalError::CorruptRow(e.to_string()))?,
            base_etag: base_etag
                .map(ETag::new)
                .transpose()
                .map_err(|e| JournalError::CorruptRow(e.to_string()))?,
            base_modtime: row.try_get("base_modtime")?,
        }))
    }

    async fn conflict_record_paths(&self) -> anyhow::Result<Vec<SyncPath>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM conflict_records ORDER BY path")
                .fetch_all(self.pool())
                .await?;
        rows.into_iter()
            .map(|(p,)| sync_path_from_row(&p).map_err(Into::into))
            .collect()
    }

    async fn delete_conflict_record(&self, path: &SyncPath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM conflict_records WHERE path = ?1")
            .bind(path.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn blacklist_entry(&self, path: &SyncPath) -> anyhow::Result<Option<BlacklistEntry>> {
        let row = sqlx::query("SELECT * FROM error_blacklist WHERE path = ?1")
            .bind(path.as_str())
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };

        let path: String = row.try_get("path")?;
        let category: String = row.try_get("category")?;

        Ok(Some(BlacklistEntry {
            path: sync_path_from_row(&path)?,
            error_string: row.try_get("error_string")?,
            category: category_from_string(&category)?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            last_try: row.try_get("last_try")?,
            ignore_duration: row.try_get("ignore_duration")?,
        }))
    }

    async fn set_blacklist_entry(&self, entry: &BlacklistEntry) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO error_blacklist \
             (path, error_string, category, retry_count, last_try, ignore_duration) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(entry.path.as_str())
        .bind(entry.error_string.as_str())
        .bind(category_to_string(entry.category))
        .bind(entry.retry_count as i64)
        .bind(entry.last_try)
        .bind(entry.ignore_duration)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_blacklist_entry(&self, path: &SyncPath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM error_blacklist WHERE path = ?1")
            .bind(path.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn wipe_error_blacklist(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM error_blacklist WHERE category != 'permanent'")
            .execute(self.pool())
            .await?;
        tracing::debug!("wiped transient blacklist entries");
        Ok(())
    }
}
