//! Propagator: executes the discovery set
//!
//! Items run as a partially-ordered job graph:
//!
//! 1. bookkeeping (metadata updates, ignores, errors) - no network;
//! 2. directory creation, shallow first;
//! 3. renames, shallow first (always before any delete so a move never
//!    races the removal of its old location);
//! 4. file transfers with bounded parallelism;
//! 5. deletions, deepest first;
//! 6. directory etag finalization, skipped for any directory that still
//!    has a failed item below it - such directories keep the invalid etag
//!    and get rediscovered next run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use davdrive_core::capabilities::Capabilities;
use davdrive_core::config::SyncOptions;
use davdrive_core::domain::{
    BlacklistCategory, BlacklistEntry, Checksum, ChecksumAlgorithm, ConflictRecord, Direction,
    ETag, FileRecord, FileType, Instruction, ItemStatus, SyncItem, SyncPath, UploadInfo,
};
use davdrive_core::ports::{
    IJournal, ILocalFileSystem, IRemoteStorage, PutOutcome, RemoteError,
};

use crate::conflicts::unique_conflict_copy_name;
use crate::filesystem::digest_bytes;

/// Finalize failures tolerated before the server's reset list may wipe a
/// stored chunked-upload session.
const UPLOAD_RESET_THRESHOLD: u32 = 3;

/// Result of a propagation pass
#[derive(Debug)]
pub struct PropagationReport {
    /// All items with their final statuses.
    pub items: Vec<SyncItem>,
    pub aborted: bool,
}

impl PropagationReport {
    /// A run is successful when nothing failed and nothing was cut short.
    pub fn is_success(&self) -> bool {
        !self.aborted && self.items.iter().all(|i| i.status.is_benign())
    }
}

struct RunState {
    /// Per-remote-directory quota guess, updated from 507 responses.
    quota_guesses: Mutex<HashMap<String, u64>>,
    /// Prefixes whose directory creation failed; everything below is
    /// skipped.
    failed_prefixes: Mutex<Vec<SyncPath>>,
    fatal: AtomicBool,
}

pub struct Propagator {
    remote: Arc<dyn IRemoteStorage>,
    fs: Arc<dyn ILocalFileSystem>,
    journal: Arc<dyn IJournal>,
    options: SyncOptions,
    capabilities: Capabilities,
    abort: Arc<AtomicBool>,
}

impl Propagator {
    pub fn new(
        remote: Arc<dyn IRemoteStorage>,
        fs: Arc<dyn ILocalFileSystem>,
        journal: Arc<dyn IJournal>,
        options: SyncOptions,
        capabilities: Capabilities,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            remote,
            fs,
            journal,
            options,
            capabilities,
            abort,
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Executes all items and returns them with final statuses.
    #[tracing::instrument(skip_all, fields(items = items.len()))]
    pub async fn run(self: &Arc<Self>, items: Vec<SyncItem>) -> anyhow::Result<PropagationReport> {
        let state = Arc::new(RunState {
            quota_guesses: Mutex::new(HashMap::new()),
            failed_prefixes: Mutex::new(Vec::new()),
            fatal: AtomicBool::new(false),
        });

        // Partial-failure safety: every touched parent is marked for
        // rediscovery up front; finalization rewrites clean etags at the
        // end.
        for item in &items {
            if needs_ancestor_invalidation(item) {
                if let Some(parent) = item.path.parent() {
                    if !parent.is_root() {
                        self.journal
                            .schedule_path_for_remote_discovery(&parent)
                            .await?;
                    }
                }
            }
        }

        let mut bookkeeping = Vec::new();
        let mut mkdirs = Vec::new();
        let mut renames = Vec::new();
        let mut transfers = Vec::new();
        let mut deletes = Vec::new();
        let mut dir_updates = Vec::new();

        for item in items {
            match item.instruction {
                Instruction::None | Instruction::Eval => bookkeeping.push(item),
                Instruction::Ignore | Instruction::Error => bookkeeping.push(item),
                Instruction::UpdateMetadata if item.is_directory() => dir_updates.push(item),
                Instruction::UpdateMetadata => bookkeeping.push(item),
                Instruction::New if item.is_directory() => mkdirs.push(item),
                Instruction::Rename => renames.push(item),
                Instruction::Remove => deletes.push(item),
                Instruction::New
                | Instruction::Sync
                | Instruction::Conflict
                | Instruction::TypeChange => transfers.push(item),
            }
        }

        mkdirs.sort_by_key(|i| i.path.depth());
        renames.sort_by_key(|i| i.path.depth());
        deletes.sort_by_key(|i| std::cmp::Reverse(i.path.depth()));

        let mut done: Vec<SyncItem> = Vec::new();

        for mut item in bookkeeping {
            self.run_bookkeeping(&mut item).await?;
            done.push(item);
        }

        for mut item in mkdirs {
            if self.aborted() || state.fatal.load(Ordering::Acquire) {
                done.push(item);
                continue;
            }
            if self.skip_failed_subtree(&mut item, &state).await {
                done.push(item);
                continue;
            }
            self.run_mkdir(&mut item, &state).await?;
            done.push(item);
        }

        for mut item in renames {
            if self.aborted() || state.fatal.load(Ordering::Acquire) {
                done.push(item);
                continue;
            }
            if self.skip_failed_subtree(&mut item, &state).await {
                done.push(item);
                continue;
            }
            self.run_rename(&mut item).await?;
            done.push(item);
        }

        done.extend(self.run_transfers(transfers, &state).await?);

        for mut item in deletes {
            if self.aborted() || state.fatal.load(Ordering::Acquire) {
                done.push(item);
                continue;
            }
            self.run_delete(&mut item).await?;
            done.push(item);
        }

        // Directory finalization: commit fresh etags only over clean
        // subtrees. Ignored items count as unfinished too - their
        // directory must be re-read until they are resolved (or the
        // ignore condition goes away).
        let failed_paths: Vec<SyncPath> = done
            .iter()
            .filter(|i| {
                !i.status.is_benign()
                    || i.status == ItemStatus::NoStatus
                    || i.instruction == Instruction::Ignore
            })
            .map(|i| i.path.clone())
            .collect();

        // Freshly created directories keep the invalid etag until their
        // content arrived intact.
        let created_dirs: Vec<(SyncPath, Option<ETag>)> = done
            .iter()
            .filter(|i| {
                i.instruction == Instruction::New
                    && i.is_directory()
                    && i.status == ItemStatus::Success
            })
            .map(|i| (i.path.clone(), i.etag.clone()))
            .collect();
        for (path, etag) in created_dirs {
            let subtree_failed = failed_paths.iter().any(|p| p.starts_with(&path));
            if subtree_failed || self.aborted() || state.fatal.load(Ordering::Acquire) {
                continue;
            }
            if let (Some(etag), Some(mut record)) =
                (etag, self.journal.get_file_record(&path).await?)
            {
                record.etag = etag;
                self.journal.set_file_record(&record).await?;
            }
        }

        for mut item in dir_updates {
            let subtree_failed = failed_paths.iter().any(|p| p.starts_with(&item.path))
                || self.aborted()
                || state.fatal.load(Ordering::Acquire);
            if subtree_failed {
                // The invalid etag stays in place; the next run
                // rediscovers and completes this directory.
                debug!(dir = %item.path, "subtree incomplete, keeping invalid etag");
                item.status = ItemStatus::Success;
            } else {
                self.finalize_directory(&mut item).await?;
            }
            done.push(item);
        }

        let aborted = self.aborted();
        if aborted {
            info!("propagation aborted, resumable state retained");
        }

        Ok(PropagationReport {
            items: done,
            aborted,
        })
    }

    // ========================================================================
    // Bookkeeping items
    // ========================================================================

    async fn run_bookkeeping(&self, item: &mut SyncItem) -> anyhow::Result<()> {
        match item.instruction {
            Instruction::UpdateMetadata => {
                self.apply_metadata_update(item).await?;
                item.status = ItemStatus::Success;
            }
            Instruction::Error => {
                // Discovery already set the message; account for it.
                if item.status == ItemStatus::NoStatus {
                    item.status = ItemStatus::NormalError;
                }
                self.note_failure(item, BlacklistCategory::Transient).await?;
            }
            Instruction::Ignore => {
                if item.status == ItemStatus::NoStatus {
                    item.status = ItemStatus::FileIgnored;
                }
            }
            _ => {
                item.status = ItemStatus::Success;
            }
        }
        Ok(())
    }

    /// Journal-only refresh; the file on disk is never touched.
    async fn apply_metadata_update(&self, item: &SyncItem) -> anyhow::Result<()> {
        let existing = self.journal.get_file_record(&item.path).await?;
        let mut record = match existing {
            Some(record) => record,
            None => {
                // Both sides carried the same new file; adopt it.
                let local = self.fs.metadata(&item.path).await?;
                FileRecord {
                    path: item.path.clone(),
                    inode: local.as_ref().map_or(item.inode, |l| l.inode),
                    modtime: item.modtime,
                    size: item.size,
                    file_id: item
                        .file_id
                        .clone()
                        .unwrap_or_else(davdrive_core::domain::FileId::unknown),
                    etag: item.etag.clone().unwrap_or_else(ETag::invalid),
                    checksum: item
                        .checksum_header
                        .as_deref()
                        .and_then(Checksum::strongest_in_header),
                    file_type: item.file_type,
                    perm: local.map_or(0o644, |l| l.mode),
                    remote_perm: item.remote_perm.clone().unwrap_or_default(),
                }
            }
        };

        match item.direction {
            Direction::Up => {
                // A touch without a content change: refresh the local
                // metadata, keep identity and checksum.
                record.modtime = item.modtime;
                record.size = item.size;
                if item.inode != 0 {
                    record.inode = item.inode;
                }
            }
            Direction::Down | Direction::None => {
                // A fake conflict resolved in place: adopt the remote
                // identity, leave the local file (and its mtime) alone.
                if let Some(etag) = &item.etag {
                    record.etag = etag.clone();
                }
                if let Some(file_id) = &item.file_id {
                    record.file_id = file_id.clone();
                }
                if let Some(perm) = &item.remote_perm {
                    record.remote_perm = perm.clone();
                }
                if let Some(checksum) = item
                    .checksum_header
                    .as_deref()
                    .and_then(Checksum::strongest_in_header)
                {
                    record.checksum = Some(checksum);
                }
                record.size = item.size;
                record.modtime = item.modtime;
            }
        }

        self.journal.set_file_record(&record).await
    }

    // ========================================================================
    // Directories
    // ========================================================================

    async fn skip_failed_subtree(&self, item: &mut SyncItem, state: &RunState) -> bool {
        let failed = state.failed_prefixes.lock().await;
        if let Some(prefix) = failed.iter().find(|p| item.path.starts_with(p)) {
            item.set_error(
                ItemStatus::SoftError,
                format!("skipped: directory '{prefix}' could not be created"),
            );
            true
        } else {
            false
        }
    }

    async fn run_mkdir(&self, item: &mut SyncItem, state: &RunState) -> anyhow::Result<()> {
        let result: Result<PutOutcome, RemoteError> = match item.direction {
            Direction::Up => self.remote.mkcol(&item.path).await,
            _ => match self.fs.mkdir(&item.path).await {
                Ok(()) => {
                    if item.modtime > 0 {
                        self.fs.set_modtime(&item.path, item.modtime).await.ok();
                    }
                    Ok(PutOutcome::default())
                }
                Err(e) => {
                    item.set_error(ItemStatus::NormalError, format!("mkdir failed: {e}"));
                    state.failed_prefixes.lock().await.push(item.path.clone());
                    return Ok(());
                }
            },
        };

        match result {
            Ok(outcome) => {
                // The record starts with the invalid etag; finalization
                // upgrades it once the subtree is complete.
                let local = self.fs.metadata(&item.path).await?;
                let file_id = outcome
                    .file_id
                    .or_else(|| item.file_id.clone())
                    .unwrap_or_else(davdrive_core::domain::FileId::unknown);
                let record = FileRecord {
                    path: item.path.clone(),
                    inode: local.as_ref().map_or(0, |l| l.inode),
                    modtime: item.modtime,
                    size: 0,
                    file_id,
                    etag: ETag::invalid(),
                    checksum: None,
                    file_type: FileType::Directory,
                    perm: local.map_or(0o755, |l| l.mode),
                    remote_perm: item.remote_perm.clone().unwrap_or_default(),
                };
                self.journal.set_file_record(&record).await?;
                // Stash the real etag for finalization.
                if item.etag.is_none() {
                    item.etag = outcome.etag;
                }
                item.status = ItemStatus::Success;
                self.journal.delete_blacklist_entry(&item.path).await?;
            }
            Err(err) => {
                self.fail_remote(item, &err, state).await?;
                state.failed_prefixes.lock().await.push(item.path.clone());
            }
        }
        Ok(())
    }

    async fn finalize_directory(&self, item: &mut SyncItem) -> anyhow::Result<()> {
        let Some(record) = self.journal.get_file_record(&item.path).await? else {
            // New directory whose creation item carried the identity.
            self.apply_metadata_update(item).await?;
            item.status = ItemStatus::Success;
            return Ok(());
        };

        let mut record = record;
        if let Some(etag) = &item.etag {
            record.etag = etag.clone();
        }
        if let Some(file_id) = &item.file_id {
            record.file_id = file_id.clone();
        }
        if let Some(perm) = &item.remote_perm {
            record.remote_perm = perm.clone();
        }
        self.journal.set_file_record(&record).await?;
        item.status = ItemStatus::Success;
        Ok(())
    }

    // ========================================================================
    // Renames
    // ========================================================================

    async fn run_rename(&self, item: &mut SyncItem) -> anyhow::Result<()> {
        let Some(target) = item.rename_target.clone() else {
            item.set_error(ItemStatus::NormalError, "rename without target");
            return Ok(());
        };

        match item.direction {
            Direction::Up => {
                if let Err(err) = self.remote.move_item(&item.path, &target, false).await {
                    return self.fail_remote_plain(item, &err).await;
                }
            }
            _ => {
                if let Err(e) = self.fs.rename(&item.path, &target).await {
                    item.set_error(ItemStatus::NormalError, format!("local rename failed: {e}"));
                    self.note_failure(item, BlacklistCategory::Transient).await?;
                    return Ok(());
                }
            }
        }

        self.journal.rename_subtree(&item.path, &target).await?;
        if let Some(mut record) = self.journal.get_file_record(&target).await? {
            if item.is_directory() {
                // A renamed directory is rediscovered next run; children
                // changed independently of the move may still be pending.
                record.etag = ETag::invalid();
            } else if let Some(etag) = &item.etag {
                record.etag = etag.clone();
            }
            if let Some(file_id) = &item.file_id {
                record.file_id = file_id.clone();
            }
            // The local mtime is authoritative for metadata-only moves;
            // item.modtime already reflects that preference.
            record.modtime = item.modtime;
            self.journal.set_file_record(&record).await?;
        }

        item.status = ItemStatus::Success;
        self.journal.delete_blacklist_entry(&item.path).await?;
        Ok(())
    }

    // ========================================================================
    // Deletes
    // ========================================================================

    async fn run_delete(&self, item: &mut SyncItem) -> anyhow::Result<()> {
        match item.direction {
            Direction::Up => {
                match self.remote.delete(&item.path).await {
                    Ok(()) => {}
                    // Already gone remotely is the desired end state.
                    Err(err) if err.http_code() == Some(404) => {}
                    Err(err) => return self.fail_remote_plain(item, &err).await,
                }
            }
            Direction::Down => {
                if let Err(e) = self.fs.remove(&item.path, item.is_directory()).await {
                    item.set_error(ItemStatus::NormalError, format!("local remove failed: {e}"));
                    self.note_failure(item, BlacklistCategory::Transient).await?;
                    return Ok(());
                }
            }
            Direction::None => {}
        }

        self.journal.delete_subtree(&item.path).await?;
        self.journal.delete_blacklist_entry(&item.path).await?;
        item.status = ItemStatus::Success;
        Ok(())
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    async fn run_transfers(
        self: &Arc<Self>,
        transfers: Vec<SyncItem>,
        state: &Arc<RunState>,
    ) -> anyhow::Result<Vec<SyncItem>> {
        let mut done = Vec::new();

        if self.options.parallel_network_jobs == 0 {
            for mut item in transfers {
                if self.aborted() || state.fatal.load(Ordering::Acquire) {
                    done.push(item);
                    continue;
                }
                if self.skip_failed_subtree(&mut item, state).await {
                    done.push(item);
                    continue;
                }
                self.run_transfer(&mut item, state).await?;
                done.push(item);
            }
            return Ok(done);
        }

        let semaphore = Arc::new(Semaphore::new(self.options.parallel_network_jobs as usize));
        let mut set: JoinSet<anyhow::Result<SyncItem>> = JoinSet::new();

        for mut item in transfers {
            if self.aborted() || state.fatal.load(Ordering::Acquire) {
                done.push(item);
                continue;
            }
            if self.skip_failed_subtree(&mut item, state).await {
                done.push(item);
                continue;
            }

            let this = Arc::clone(self);
            let state = Arc::clone(state);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                if !this.aborted() && !state.fatal.load(Ordering::Acquire) {
                    this.run_transfer(&mut item, &state).await?;
                }
                Ok(item)
            });
        }

        while let Some(result) = set.join_next().await {
            done.push(result.expect("transfer task panicked")?);
        }

        Ok(done)
    }

    async fn run_transfer(&self, item: &mut SyncItem, state: &RunState) -> anyhow::Result<()> {
        match (item.instruction, item.direction) {
            (Instruction::Conflict, _) => self.run_conflict(item).await,
            (Instruction::TypeChange, _) => self.run_type_change(item).await,
            (_, Direction::Up) => self.run_upload(item, state).await,
            (_, Direction::Down) => self.run_download(item).await,
            _ => {
                item.set_error(ItemStatus::NormalError, "unpropagatable item");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------------

    async fn run_upload(&self, item: &mut SyncItem, state: &RunState) -> anyhow::Result<()> {
        let parent_key = item.path.parent().unwrap_or_default().as_str().to_string();

        // Quota gate: skip uploads the server already told us it cannot
        // take this run.
        {
            let guesses = state.quota_guesses.lock().await;
            if let Some(&guess) = guesses.get(&parent_key) {
                if item.size > guess {
                    debug!(path = %item.path, size = item.size, guess, "skipping upload over quota guess");
                    item.set_error(ItemStatus::FileIgnored, "Insufficient remote storage");
                    return Ok(());
                }
            }
        }

        let data = match self.fs.read(&item.path).await {
            Ok(data) => data,
            Err(e) => {
                item.set_error(ItemStatus::FileIgnored, format!("cannot read local file: {e}"));
                return Ok(());
            }
        };

        let checksum = self
            .capabilities
            .upload_checksum_algorithm()
            .map(|algo| digest_bytes(&data, algo));
        let total = data.len() as u64;

        let result = if total > self.options.initial_chunk_size {
            self.upload_chunked(item, data, checksum.as_ref()).await
        } else {
            self.remote
                .put_simple(&item.path, data, item.modtime, checksum.as_ref())
                .await
        };

        match result {
            Ok(outcome) => {
                {
                    let mut guesses = state.quota_guesses.lock().await;
                    if let Some(guess) = guesses.get_mut(&parent_key) {
                        *guess = guess.saturating_sub(total);
                    }
                }
                let local = self.fs.metadata(&item.path).await?;
                let record = FileRecord {
                    path: item.path.clone(),
                    inode: local.as_ref().map_or(item.inode, |l| l.inode),
                    modtime: item.modtime,
                    size: total,
                    file_id: outcome
                        .file_id
                        .or_else(|| item.file_id.clone())
                        .unwrap_or_else(davdrive_core::domain::FileId::unknown),
                    etag: outcome.etag.unwrap_or_else(ETag::invalid),
                    checksum,
                    file_type: FileType::File,
                    perm: local.map_or(0o644, |l| l.mode),
                    remote_perm: item.remote_perm.clone().unwrap_or_default(),
                };
                self.journal.set_file_record(&record).await?;
                self.journal.delete_blacklist_entry(&item.path).await?;
                item.status = ItemStatus::Success;
            }
            Err(err) if err.is_insufficient_storage() => {
                let mut guesses = state.quota_guesses.lock().await;
                let guess = total.saturating_sub(1);
                guesses
                    .entry(parent_key)
                    .and_modify(|g| *g = (*g).min(guess))
                    .or_insert(guess);
                drop(guesses);

                warn!(path = %item.path, size = total, "insufficient remote storage");
                item.set_error(ItemStatus::NormalError, "Insufficient remote storage");
                self.note_failure(item, BlacklistCategory::Transient).await?;
            }
            Err(err) => {
                self.fail_remote(item, &err, state).await?;
            }
        }
        Ok(())
    }

    /// Chunked upload with resumable transfer state.
    async fn upload_chunked(
        &self,
        item: &SyncItem,
        data: Vec<u8>,
        checksum: Option<&Checksum>,
    ) -> Result<PutOutcome, RemoteError> {
        let total = data.len() as u64;
        let stored = self
            .journal
            .get_upload_info(&item.path)
            .await
            .ok()
            .flatten();

        let mut info = match stored {
            Some(mut info)
                if info.still_matches(item.modtime, total) && info.transfer_id != 0 =>
            {
                debug!(path = %item.path, transfer_id = info.transfer_id, offset = info.chunk_offset, "resuming chunked upload");
                if info.chunk_size == 0 {
                    info.chunk_size =
                        self.options.clamp_chunk_size(self.options.initial_chunk_size);
                }
                info
            }
            _ => {
                let transfer_id = (chrono::Utc::now().timestamp_nanos_opt().unwrap_or(1) as u64)
                    | 1;
                let info = UploadInfo {
                    transfer_id,
                    chunk_offset: 0,
                    chunk_size: self.options.clamp_chunk_size(self.options.initial_chunk_size),
                    modtime: item.modtime,
                    size: total,
                    error_count: 0,
                    valid: true,
                };
                self.remote.create_upload_session(transfer_id).await?;
                let _ = self.journal.set_upload_info(&item.path, &info).await;
                info
            }
        };

        while info.chunk_offset < total {
            if self.aborted() {
                // Cancellation keeps the session for the next run.
                return Err(RemoteError::Network("operation aborted".to_string()));
            }
            let end = (info.chunk_offset + info.chunk_size).min(total);
            let chunk = data[info.chunk_offset as usize..end as usize].to_vec();
            match self
                .remote
                .put_chunk(info.transfer_id, info.chunk_offset, chunk, total)
                .await
            {
                Ok(()) => {
                    info.chunk_offset = end;
                    let _ = self.journal.set_upload_info(&item.path, &info).await;
                }
                Err(err) => {
                    self.account_upload_error(&item.path, &mut info, &err).await;
                    return Err(err);
                }
            }
        }

        match self
            .remote
            .finalize_upload(info.transfer_id, &item.path, total, item.modtime, checksum)
            .await
        {
            Ok(outcome) => {
                let _ = self.journal.clear_upload_info(&item.path).await;
                Ok(outcome)
            }
            Err(err) => {
                self.account_upload_error(&item.path, &mut info, &err).await;
                Err(err)
            }
        }
    }

    /// Error accounting for a failed chunk or finalize: the session is
    /// retained for resumption until the server's reset list says the
    /// state is unrecoverable.
    async fn account_upload_error(&self, path: &SyncPath, info: &mut UploadInfo, err: &RemoteError) {
        info.error_count += 1;
        let reset = err
            .http_code()
            .is_some_and(|code| self.capabilities.resets_chunked_upload(code));
        if reset && info.error_count > UPLOAD_RESET_THRESHOLD {
            info!(path = %path, "chunked upload reset, discarding transfer state");
            let _ = self.journal.clear_upload_info(path).await;
        } else {
            let _ = self.journal.set_upload_info(path, info).await;
        }
    }

    // ------------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------------

    async fn run_download(&self, item: &mut SyncItem) -> anyhow::Result<()> {
        let download = match self.remote.get(&item.path).await {
            Ok(download) => download,
            Err(err) => return self.fail_remote_plain(item, &err).await,
        };

        // Verify before a single byte reaches the final location.
        let verified = match download
            .checksum_header
            .as_deref()
            .and_then(Checksum::strongest_in_header)
        {
            Some(expected) => {
                let actual = digest_bytes(&download.data, expected.algo);
                if actual.matches(&expected) {
                    Some(expected)
                } else {
                    item.set_error(
                        ItemStatus::NormalError,
                        format!(
                            "checksum mismatch on download: expected {expected}, got {actual}"
                        ),
                    );
                    self.note_failure(item, BlacklistCategory::Transient).await?;
                    return Ok(());
                }
            }
            // An unparsable OC-Checksum is ignored; Content-MD5 is the
            // fallback integrity check.
            None => match &download.content_md5 {
                Some(expected_hex) => {
                    let actual = digest_bytes(&download.data, ChecksumAlgorithm::Md5);
                    if actual.hex.eq_ignore_ascii_case(expected_hex) {
                        Some(actual)
                    } else {
                        item.set_error(
                            ItemStatus::NormalError,
                            "Content-MD5 mismatch on download".to_string(),
                        );
                        self.note_failure(item, BlacklistCategory::Transient).await?;
                        return Ok(());
                    }
                }
                None => None,
            },
        };

        let modtime = download.modtime.unwrap_or(item.modtime);
        self.fs
            .write_atomic(&item.path, &download.data, modtime)
            .await?;

        let local = self.fs.metadata(&item.path).await?;
        let record = FileRecord {
            path: item.path.clone(),
            inode: local.as_ref().map_or(0, |l| l.inode),
            modtime,
            size: download.data.len() as u64,
            file_id: download
                .file_id
                .or_else(|| item.file_id.clone())
                .unwrap_or_else(davdrive_core::domain::FileId::unknown),
            etag: download
                .etag
                .or_else(|| item.etag.clone())
                .unwrap_or_else(ETag::invalid),
            checksum: verified,
            file_type: FileType::File,
            perm: local.map_or(0o644, |l| l.mode),
            remote_perm: item.remote_perm.clone().unwrap_or_default(),
        };
        self.journal.set_file_record(&record).await?;
        self.journal.delete_blacklist_entry(&item.path).await?;
        if item.status == ItemStatus::NoStatus {
            item.status = ItemStatus::Success;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------------

    async fn run_conflict(&self, item: &mut SyncItem) -> anyhow::Result<()> {
        // Set the local version aside before the remote one overwrites it.
        let parent = item.path.parent().unwrap_or_default();
        let base_name = item.path.file_name().to_string();
        let siblings: std::collections::HashSet<String> = self
            .fs
            .enumerate(&parent)
            .await
            .map(|entries| entries.into_iter().map(|e| e.name).collect())
            .unwrap_or_default();
        let conflict_name = unique_conflict_copy_name(&base_name, chrono::Utc::now(), |name| {
            siblings.contains(name)
        });
        let conflict_path = parent
            .join(&conflict_name)
            .map_err(|e| anyhow::anyhow!("conflict name: {e}"))?;

        if self.fs.metadata(&item.path).await?.is_some() {
            self.fs.rename(&item.path, &conflict_path).await?;
            let record = ConflictRecord {
                path: conflict_path.clone(),
                base_path: item.path.clone(),
                base_file_id: item.file_id.clone(),
                base_etag: item.etag.clone(),
                base_modtime: item.previous_modtime,
            };
            self.journal.set_conflict_record(&record).await?;
            info!(path = %item.path, conflict = %conflict_path, "conflict copy created");
        }

        self.run_download(item).await?;
        if item.status == ItemStatus::Success {
            item.status = ItemStatus::Conflict;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Type changes
    // ------------------------------------------------------------------------

    async fn run_type_change(&self, item: &mut SyncItem) -> anyhow::Result<()> {
        // Replace the old entry wholesale, then transfer the new kind.
        self.fs.remove(&item.path, true).await?;
        self.journal.delete_subtree(&item.path).await?;

        if item.file_type.is_directory() {
            self.fs.mkdir(&item.path).await?;
            let record = FileRecord {
                path: item.path.clone(),
                inode: self.fs.metadata(&item.path).await?.map_or(0, |l| l.inode),
                modtime: item.modtime,
                size: 0,
                file_id: item
                    .file_id
                    .clone()
                    .unwrap_or_else(davdrive_core::domain::FileId::unknown),
                etag: ETag::invalid(),
                checksum: None,
                file_type: FileType::Directory,
                perm: 0o755,
                remote_perm: item.remote_perm.clone().unwrap_or_default(),
            };
            self.journal.set_file_record(&record).await?;
            item.status = ItemStatus::Success;
            Ok(())
        } else {
            self.run_download(item).await
        }
    }

    // ========================================================================
    // Failure accounting
    // ========================================================================

    async fn fail_remote(
        &self,
        item: &mut SyncItem,
        err: &RemoteError,
        state: &RunState,
    ) -> anyhow::Result<()> {
        if matches!(err, RemoteError::AuthFailed) {
            state.fatal.store(true, Ordering::Release);
            item.set_error(ItemStatus::FatalError, err.to_string());
            return Ok(());
        }
        self.fail_remote_plain(item, err).await
    }

    async fn fail_remote_plain(&self, item: &mut SyncItem, err: &RemoteError) -> anyhow::Result<()> {
        let status = match err {
            RemoteError::AuthFailed => ItemStatus::FatalError,
            RemoteError::Timeout | RemoteError::Network(_) => ItemStatus::SoftError,
            _ => ItemStatus::NormalError,
        };
        item.set_error(status.clone(), err.to_string());
        if status != ItemStatus::FatalError {
            self.note_failure(item, BlacklistCategory::Transient).await?;
        }
        Ok(())
    }

    async fn note_failure(
        &self,
        item: &SyncItem,
        category: BlacklistCategory,
    ) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        let message = item
            .error_string
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        match self.journal.blacklist_entry(&item.path).await? {
            Some(mut entry) => {
                entry.record_failure(message, now);
                self.journal.set_blacklist_entry(&entry).await
            }
            None => {
                let entry = BlacklistEntry::new(item.path.clone(), message, category, now);
                self.journal.set_blacklist_entry(&entry).await
            }
        }
    }
}

/// Instructions whose propagation must leave ancestors invalidated until
/// they complete.
fn needs_ancestor_invalidation(item: &SyncItem) -> bool {
    matches!(
        item.instruction,
        Instruction::Remove
            | Instruction::Rename
            | Instruction::New
            | Instruction::Sync
            | Instruction::Conflict
            | Instruction::TypeChange
    )
}
