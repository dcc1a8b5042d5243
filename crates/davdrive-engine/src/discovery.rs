//! Discovery: three-way reconciliation
//!
//! Walks the local tree, the remote tree and the journal directory by
//! directory and emits one [`SyncItem`] per path that needs attention.
//! A directory is re-read from the server only when its cached etag no
//! longer matches (or was invalidated); otherwise the journal stands in
//! for the remote listing.
//!
//! Move detection runs as a post-pass over the emitted items: a removal on
//! one side paired with an appearance on the other collapses into a single
//! rename when identity and content line up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use davdrive_core::capabilities::Capabilities;
use davdrive_core::config::SyncOptions;
use davdrive_core::domain::{
    Checksum, ChecksumAlgorithm, Direction, FileRecord, FileType, Instruction, ItemStatus,
    SelectiveSyncKind, SyncItem, SyncPath,
};
use davdrive_core::ports::{
    Depth, IJournal, ILocalFileSystem, IRemoteStorage, LocalEntry, PlaceholderState, RemoteEntry,
    RemoteError,
};

/// Result of a discovery pass
#[derive(Debug)]
pub struct DiscoveryOutcome {
    pub items: Vec<SyncItem>,
    /// Set when a root or protocol-level failure ends the run.
    pub fatal_error: Option<String>,
}

enum WalkError {
    /// Aborts the whole run with a sync-level error message.
    Fatal(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for WalkError {
    fn from(e: anyhow::Error) -> Self {
        WalkError::Internal(e)
    }
}

struct WalkState {
    items: Vec<SyncItem>,
    excluded: Vec<SyncPath>,
    /// Occurrences of each file id across the remote view; duplicated ids
    /// constrain move pairing.
    remote_id_counts: HashMap<String, u32>,
    now: i64,
}

/// One name joined across the three sources
#[derive(Default)]
struct Slot {
    local: Option<LocalEntry>,
    remote: Option<RemoteEntry>,
    record: Option<FileRecord>,
}

pub struct Discovery {
    remote: Arc<dyn IRemoteStorage>,
    fs: Arc<dyn ILocalFileSystem>,
    journal: Arc<dyn IJournal>,
    options: SyncOptions,
    capabilities: Capabilities,
}

impl Discovery {
    pub fn new(
        remote: Arc<dyn IRemoteStorage>,
        fs: Arc<dyn ILocalFileSystem>,
        journal: Arc<dyn IJournal>,
        options: SyncOptions,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            remote,
            fs,
            journal,
            options,
            capabilities,
        }
    }

    /// Runs a full discovery pass from the folder root.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> anyhow::Result<DiscoveryOutcome> {
        let excluded = self
            .journal
            .get_selective_sync_list(SelectiveSyncKind::BlackList)
            .await?;

        let mut state = WalkState {
            items: Vec::new(),
            excluded,
            remote_id_counts: HashMap::new(),
            now: chrono::Utc::now().timestamp(),
        };

        match self.walk_directory(&SyncPath::root(), None, &mut state).await {
            Ok(()) => {}
            Err(WalkError::Fatal(message)) => {
                return Ok(DiscoveryOutcome {
                    items: Vec::new(),
                    fatal_error: Some(message),
                })
            }
            Err(WalkError::Internal(e)) => return Err(e),
        }

        let mut items = self.detect_moves(std::mem::take(&mut state.items), &state).await;
        self.apply_blacklist_gating(&mut items, state.now).await?;
        items.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(items = items.len(), "discovery finished");
        Ok(DiscoveryOutcome {
            items,
            fatal_error: None,
        })
    }

    fn is_excluded(&self, path: &SyncPath, state: &WalkState) -> bool {
        state.excluded.iter().any(|p| path.starts_with(p))
    }

    fn invalid_name(&self, name: &str) -> bool {
        self.capabilities
            .invalid_filename_pattern()
            .is_some_and(|re| re.is_match(name))
    }

    /// The sync-level error message for a failed remote directory read.
    fn read_error_message(dir: &SyncPath, err: &RemoteError) -> String {
        let detail = match err {
            RemoteError::Http { message, .. } => message.clone(),
            other => other.to_string(),
        };
        format!(
            "Server replied with an error while reading directory '{}' : {}",
            dir, detail
        )
    }

    /// Classifies a PROPFIND failure. Below the root, HTTP 403/404/5xx,
    /// malformed XML and timeouts skip the subtree and the run carries on;
    /// on the root, and for auth or other client errors, the run dies.
    async fn handle_propfind_error(
        &self,
        dir: &SyncPath,
        err: RemoteError,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        let subtree_survivable = err.is_soft_discovery_error()
            || matches!(
                err,
                RemoteError::InvalidXml | RemoteError::Timeout | RemoteError::Protocol(_)
            );
        let message = Self::read_error_message(dir, &err);
        if dir.is_root() || !subtree_survivable {
            return Err(WalkError::Fatal(message));
        }

        warn!(dir = %dir, error = %err, "directory read failed, skipping subtree");
        // Keep the subtree scheduled for rediscovery.
        self.journal
            .schedule_path_for_remote_discovery(dir)
            .await
            .map_err(WalkError::Internal)?;

        // Plain HTTP errors on a subtree leave the run successful;
        // malformed responses and timeouts keep the subtree too but fail
        // the run so the user sees it.
        let status = if err.is_soft_discovery_error() {
            ItemStatus::FileIgnored
        } else {
            ItemStatus::SoftError
        };
        let mut item = SyncItem::none(dir.clone());
        item.file_type = FileType::Directory;
        item.instruction = Instruction::Ignore;
        item.set_error(status, message);
        state.items.push(item);
        Ok(())
    }

    /// Checks the identity properties a server must deliver per entry.
    fn missing_identity(entry: &RemoteEntry, is_root: bool) -> Option<&'static str> {
        if entry.etag.is_none() {
            return Some("etag");
        }
        if entry.file_id.is_none() {
            return Some("file id");
        }
        if entry.permissions.is_none() && !is_root {
            return Some("permissions");
        }
        None
    }

    fn identity_error_item(entry: &RemoteEntry, missing: &str) -> SyncItem {
        let mut item = SyncItem::none(entry.path.clone());
        item.file_type = if entry.is_collection {
            FileType::Directory
        } else {
            FileType::File
        };
        item.instruction = Instruction::Error;
        item.size = entry.size;
        item.modtime = entry.modtime;
        item.set_error(
            ItemStatus::NormalError,
            format!("server reported no {missing} for '{}'", entry.path),
        );
        item
    }

    /// A remote view synthesized from journal records, used when the
    /// directory etag proves nothing changed server-side.
    fn remote_view_from_record(record: &FileRecord) -> RemoteEntry {
        RemoteEntry {
            path: record.path.clone(),
            size: record.size,
            modtime: record.modtime,
            etag: Some(record.etag.clone()),
            file_id: Some(record.file_id.clone()),
            permissions: Some(record.remote_perm.clone()),
            checksum_header: record.checksum.as_ref().map(ToString::to_string),
            is_collection: record.file_type.is_directory(),
        }
    }

    /// Computes the local checksum, honoring the placeholder rule: a
    /// dehydrated file is never hydrated for a comparison, its journal
    /// checksum stands in.
    async fn local_checksum(
        &self,
        path: &SyncPath,
        algo: ChecksumAlgorithm,
        entry: &LocalEntry,
        record: Option<&FileRecord>,
    ) -> Option<Checksum> {
        if entry.placeholder == PlaceholderState::Dehydrated {
            return record
                .and_then(|r| r.checksum.clone())
                .filter(|c| c.algo == algo);
        }
        match self.fs.compute_checksum(path, algo).await {
            Ok(checksum) => Some(checksum),
            Err(e) => {
                warn!(path = %path, error = %e, "local checksum failed");
                None
            }
        }
    }

    // ========================================================================
    // Directory walk
    // ========================================================================

    fn walk_directory<'a>(
        &'a self,
        dir: &'a SyncPath,
        remote_etag_hint: Option<String>,
        state: &'a mut WalkState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), WalkError>> + Send + 'a>>
    {
        Box::pin(async move {
            let dir_record = self.journal.get_file_record(dir).await?;

            let need_remote = dir.is_root()
                || match &dir_record {
                    None => true,
                    Some(rec) if rec.etag.is_invalid() => true,
                    Some(rec) => match &remote_etag_hint {
                        Some(hint) => hint.as_str() != rec.etag.as_str(),
                        None => false,
                    },
                };

            let (dir_entry, remote_children, remote_live) = if need_remote {
                match self.remote.propfind(dir, Depth::One).await {
                    Ok(entries) => {
                        let mut own = None;
                        let mut children = Vec::new();
                        for entry in entries {
                            state
                                .remote_id_counts
                                .entry(
                                    entry
                                        .file_id
                                        .as_ref()
                                        .map(|f| f.as_str().to_string())
                                        .unwrap_or_default(),
                                )
                                .and_modify(|c| *c += 1)
                                .or_insert(1);
                            if entry.path == *dir {
                                own = Some(entry);
                            } else {
                                children.push(entry);
                            }
                        }
                        (own, children, true)
                    }
                    Err(err) => return self.handle_propfind_error(dir, err, state).await,
                }
            } else {
                let records = self.journal.get_files_below(dir).await?;
                let children: Vec<RemoteEntry> = records
                    .iter()
                    .filter(|r| r.path != *dir && r.path.depth() == dir.depth() + 1)
                    .map(Self::remote_view_from_record)
                    .collect();
                // Journal-backed entries count toward file-id duplication
                // just like live listings do.
                for entry in &children {
                    if let Some(file_id) = &entry.file_id {
                        state
                            .remote_id_counts
                            .entry(file_id.as_str().to_string())
                            .and_modify(|c| *c += 1)
                            .or_insert(1);
                    }
                }
                (None, children, false)
            };

            let local_entries = match self.fs.metadata(dir).await? {
                Some(entry) if entry.file_type.is_directory() => self.fs.enumerate(dir).await?,
                _ => Vec::new(),
            };

            let records = self.journal.get_files_below(dir).await?;
            let child_records: Vec<FileRecord> = records
                .into_iter()
                .filter(|r| r.path != *dir && r.path.depth() == dir.depth() + 1)
                .collect();

            // Join the three sources by name.
            let mut slots: BTreeMap<String, Slot> = BTreeMap::new();
            for entry in local_entries {
                if entry.is_symlink {
                    warn!(dir = %dir, name = %entry.name, "skipping symlink");
                    continue;
                }
                if self.options.ignore_hidden_files && entry.is_hidden {
                    continue;
                }
                let mut name = entry.name.clone();
                if entry.placeholder == PlaceholderState::Dehydrated {
                    if let Some(stripped) = name.strip_suffix(crate::vfs::PLACEHOLDER_SUFFIX) {
                        name = stripped.to_string();
                    }
                }
                slots.entry(name).or_default().local = Some(entry);
            }
            for entry in remote_children {
                if self.options.ignore_hidden_files && entry.name().starts_with('.') {
                    continue;
                }
                let name = entry.name().to_string();
                slots.entry(name).or_default().remote = Some(entry);
            }
            for record in child_records {
                let name = record.path.file_name().to_string();
                slots.entry(name).or_default().record = Some(record);
            }

            for (name, slot) in slots {
                let Ok(path) = dir.join(&name) else {
                    continue;
                };

                if self.is_excluded(&path, state) {
                    self.walk_excluded(&path, &slot, state).await?;
                    continue;
                }

                if remote_live {
                    if let Some(remote) = &slot.remote {
                        if let Some(missing) = Self::missing_identity(remote, false) {
                            state.items.push(Self::identity_error_item(remote, missing));
                            continue;
                        }
                    }
                }

                self.classify(&path, slot, state).await?;
            }

            // Finalize the directory's own etag after its children: the
            // propagator commits it only once the subtree is clean.
            if remote_live && !dir.is_root() {
                if let Some(own) = dir_entry {
                    if Self::missing_identity(&own, false).is_none() {
                        let new_etag = own.etag.clone();
                        let changed = match &dir_record {
                            Some(rec) => Some(rec.etag.clone()) != new_etag,
                            None => true,
                        };
                        if changed {
                            let mut item = SyncItem::none(dir.clone());
                            item.file_type = FileType::Directory;
                            item.instruction = Instruction::UpdateMetadata;
                            item.direction = Direction::Down;
                            item.modtime = own.modtime;
                            item.etag = own.etag;
                            item.file_id = own.file_id;
                            item.remote_perm = own.permissions;
                            state.items.push(item);
                        }
                    }
                }
            }

            Ok(())
        })
    }

    // ========================================================================
    // Three-way classification of one path
    // ========================================================================

    async fn classify(
        &self,
        path: &SyncPath,
        slot: Slot,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        let Slot {
            local,
            remote,
            record,
        } = slot;

        match (local, remote, record) {
            (None, None, Some(rec)) => {
                // Gone from both sides: drop the journal row.
                let mut item = Self::item_from_record(&rec, Instruction::Remove, Direction::None);
                item.status = ItemStatus::Success;
                state.items.push(item);
                Ok(())
            }
            (Some(local), None, None) => self.classify_local_only(path, &local, state).await,
            (None, Some(remote), None) => self.classify_remote_only(&remote, state).await,
            (Some(local), None, Some(rec)) => {
                self.classify_remote_deleted(path, &local, &rec, state).await
            }
            (None, Some(remote), Some(rec)) => {
                self.classify_local_deleted(&remote, &rec, state).await
            }
            (Some(local), Some(remote), None) => {
                self.classify_both_new(path, &local, &remote, state).await
            }
            (Some(local), Some(remote), Some(rec)) => {
                self.classify_all_present(path, &local, &remote, &rec, state)
                    .await
            }
            (None, None, None) => Ok(()),
        }
    }

    /// Present only locally: a new upload (or an ignored name).
    async fn classify_local_only(
        &self,
        path: &SyncPath,
        local: &LocalEntry,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        if self.invalid_name(path.file_name()) {
            let mut item = SyncItem::none(path.clone());
            item.file_type = local.file_type;
            item.instruction = Instruction::Ignore;
            item.status = ItemStatus::FileIgnored;
            item.error_string = Some("invalid filename, not uploaded".to_string());
            state.items.push(item);
            return Ok(());
        }

        let mut item = SyncItem::none(path.clone());
        item.instruction = Instruction::New;
        item.direction = Direction::Up;
        item.file_type = local.file_type;
        item.size = local.size;
        item.modtime = local.modtime;
        item.inode = local.inode;
        state.items.push(item);

        if local.file_type.is_directory() {
            self.walk_local_new(path, state).await?;
        }
        Ok(())
    }

    /// Recurses into a directory that exists only locally.
    fn walk_local_new<'a>(
        &'a self,
        dir: &'a SyncPath,
        state: &'a mut WalkState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), WalkError>> + Send + 'a>>
    {
        Box::pin(async move {
            for entry in self.fs.enumerate(dir).await? {
                if entry.is_symlink || (self.options.ignore_hidden_files && entry.is_hidden) {
                    continue;
                }
                let Ok(child) = dir.join(&entry.name) else {
                    continue;
                };
                if self.is_excluded(&child, state) {
                    continue;
                }
                self.classify_local_only(&child, &entry, state).await?;
            }
            Ok(())
        })
    }

    /// Present only remotely: a new download.
    async fn classify_remote_only(
        &self,
        remote: &RemoteEntry,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        let mut item = SyncItem::none(remote.path.clone());
        item.instruction = Instruction::New;
        item.direction = Direction::Down;
        item.file_type = if remote.is_collection {
            FileType::Directory
        } else {
            FileType::File
        };
        item.size = remote.size;
        item.modtime = remote.modtime;
        item.etag = remote.etag.clone();
        item.file_id = remote.file_id.clone();
        item.remote_perm = remote.permissions.clone();
        item.checksum_header = remote.checksum_header.clone();
        state.items.push(item);

        if remote.is_collection {
            self.walk_remote_new(&remote.path, state).await?;
        }
        Ok(())
    }

    /// Recurses into a directory that exists only remotely.
    fn walk_remote_new<'a>(
        &'a self,
        dir: &'a SyncPath,
        state: &'a mut WalkState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), WalkError>> + Send + 'a>>
    {
        Box::pin(async move {
            let entries = match self.remote.propfind(dir, Depth::One).await {
                Ok(entries) => entries,
                Err(err) => return self.handle_propfind_error(dir, err, state).await,
            };

            for entry in entries {
                if entry.path == *dir {
                    continue;
                }
                state
                    .remote_id_counts
                    .entry(
                        entry
                            .file_id
                            .as_ref()
                            .map(|f| f.as_str().to_string())
                            .unwrap_or_default(),
                    )
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                if self.options.ignore_hidden_files && entry.name().starts_with('.') {
                    continue;
                }
                if self.is_excluded(&entry.path, state) {
                    continue;
                }
                if let Some(missing) = Self::missing_identity(&entry, false) {
                    state.items.push(Self::identity_error_item(&entry, missing));
                    continue;
                }
                self.classify_remote_only(&entry, state).await?;
            }
            Ok(())
        })
    }

    /// Journaled and local, gone remotely: the remote deletion propagates
    /// down, unless local changes would be lost.
    async fn classify_remote_deleted(
        &self,
        path: &SyncPath,
        local: &LocalEntry,
        rec: &FileRecord,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        let locally_dirty = if local.file_type.is_directory() {
            self.subtree_dirty(path).await?
        } else {
            local.modtime != rec.modtime || local.size != rec.size
        };

        if locally_dirty {
            // Data safety: a locally modified file is re-uploaded instead
            // of deleted.
            debug!(path = %path, "remote deleted but local is dirty, re-uploading");
            self.journal
                .delete_subtree(path)
                .await
                .map_err(WalkError::Internal)?;
            return self.classify_local_only(path, local, state).await;
        }

        let mut item = Self::item_from_record(rec, Instruction::Remove, Direction::Down);
        item.inode = local.inode;
        state.items.push(item);
        Ok(())
    }

    /// True when any local file under `dir` differs from its journal
    /// record, including files the journal never tracked.
    fn subtree_dirty<'a>(
        &'a self,
        dir: &'a SyncPath,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, WalkError>> + Send + 'a>>
    {
        Box::pin(async move {
            match self.fs.metadata(dir).await? {
                Some(entry) if entry.file_type.is_directory() => {}
                _ => return Ok(false),
            }
            for entry in self.fs.enumerate(dir).await? {
                if entry.is_symlink {
                    continue;
                }
                let Ok(child) = dir.join(&entry.name) else {
                    continue;
                };
                if entry.file_type.is_directory() {
                    if self.subtree_dirty(&child).await? {
                        return Ok(true);
                    }
                } else {
                    match self.journal.get_file_record(&child).await? {
                        Some(rec)
                            if rec.modtime == entry.modtime && rec.size == entry.size => {}
                        _ => return Ok(true),
                    }
                }
            }
            Ok(false)
        })
    }

    /// Journaled and remote, gone locally: the local deletion propagates
    /// up, unless the remote changed since the last sync.
    async fn classify_local_deleted(
        &self,
        remote: &RemoteEntry,
        rec: &FileRecord,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        let remote_changed = remote.etag.as_ref() != Some(&rec.etag);
        if remote_changed {
            // The server has content we never saw; restore it locally
            // rather than deleting it.
            return self.classify_remote_only(remote, state).await;
        }

        let mut item = Self::item_from_record(rec, Instruction::Remove, Direction::Up);
        item.checksum_header = rec.checksum.as_ref().map(ToString::to_string);
        state.items.push(item);
        Ok(())
    }

    /// New on both sides with no journal row: identical content is adopted
    /// silently, anything else is a conflict.
    async fn classify_both_new(
        &self,
        path: &SyncPath,
        local: &LocalEntry,
        remote: &RemoteEntry,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        let local_is_dir = local.file_type.is_directory();
        if local_is_dir && remote.is_collection {
            // The recursive walk emits the directory's own metadata item.
            return self
                .walk_directory(path, remote.etag.as_ref().map(|e| e.as_str().to_string()), state)
                .await;
        }

        if local_is_dir != remote.is_collection {
            state.items.push(Self::conflict_item(path, local, remote));
            return Ok(());
        }

        // Same size with a matching advertised checksum (or identical
        // mtime) proves the contents are the same file.
        let identical = if local.size == remote.size {
            if let Some(advertised) = remote
                .checksum_header
                .as_deref()
                .and_then(Checksum::strongest_in_header)
            {
                self.local_checksum(path, advertised.algo, local, None)
                    .await
                    .is_some_and(|mine| mine.matches(&advertised))
            } else {
                local.modtime == remote.modtime
            }
        } else {
            false
        };

        if identical {
            let mut item = SyncItem::none(path.clone());
            item.instruction = Instruction::UpdateMetadata;
            item.direction = Direction::Down;
            item.file_type = FileType::File;
            item.size = local.size;
            item.modtime = local.modtime;
            item.inode = local.inode;
            item.etag = remote.etag.clone();
            item.file_id = remote.file_id.clone();
            item.remote_perm = remote.permissions.clone();
            item.checksum_header = remote.checksum_header.clone();
            state.items.push(item);
        } else {
            state.items.push(Self::conflict_item(path, local, remote));
        }
        Ok(())
    }

    fn conflict_item(path: &SyncPath, local: &LocalEntry, remote: &RemoteEntry) -> SyncItem {
        let mut item = SyncItem::none(path.clone());
        item.instruction = Instruction::Conflict;
        item.direction = Direction::None;
        item.file_type = if remote.is_collection {
            FileType::Directory
        } else {
            FileType::File
        };
        item.size = remote.size;
        item.modtime = remote.modtime;
        item.previous_size = local.size;
        item.previous_modtime = local.modtime;
        item.inode = local.inode;
        item.etag = remote.etag.clone();
        item.file_id = remote.file_id.clone();
        item.remote_perm = remote.permissions.clone();
        item.checksum_header = remote.checksum_header.clone();
        item
    }

    /// All three present: the change-detection matrix.
    async fn classify_all_present(
        &self,
        path: &SyncPath,
        local: &LocalEntry,
        remote: &RemoteEntry,
        rec: &FileRecord,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        let local_is_dir = local.file_type.is_directory();
        if local_is_dir && remote.is_collection {
            return self
                .walk_directory(path, remote.etag.as_ref().map(|e| e.as_str().to_string()), state)
                .await;
        }

        if local_is_dir != remote.is_collection {
            let mut item = Self::item_from_record(rec, Instruction::TypeChange, Direction::Down);
            item.size = remote.size;
            item.modtime = remote.modtime;
            item.etag = remote.etag.clone();
            item.file_id = remote.file_id.clone();
            item.remote_perm = remote.permissions.clone();
            item.file_type = if remote.is_collection {
                FileType::Directory
            } else {
                FileType::File
            };
            state.items.push(item);
            return Ok(());
        }

        let local_changed = local.modtime != rec.modtime || local.size != rec.size;
        let remote_changed = remote.etag.as_ref() != Some(&rec.etag);

        match (local_changed, remote_changed) {
            (false, false) => Ok(()),
            (true, false) => {
                self.classify_local_change(path, local, rec, state).await;
                Ok(())
            }
            (false, true) => {
                self.classify_remote_change(path, local, remote, rec, state)
                    .await;
                Ok(())
            }
            (true, true) => {
                // Both sides changed. Only a checksum-verified match may
                // prove the contents converged on their own; a weak
                // checksum is trusted only while the stamps agree.
                // Everything else keeps both versions via a conflict copy.
                let advertised = remote
                    .checksum_header
                    .as_deref()
                    .and_then(Checksum::strongest_in_header);

                if local.size == remote.size {
                    if let Some(advertised) = &advertised {
                        let usable = !advertised.algo.is_weak()
                            || local.modtime == remote.modtime;
                        if usable {
                            let mine = self
                                .local_checksum(path, advertised.algo, local, Some(rec))
                                .await;
                            if mine.is_some_and(|m| m.matches(advertised)) {
                                state.items.push(Self::metadata_refresh_item(
                                    path, local, remote, rec,
                                ));
                                return Ok(());
                            }
                        }
                    }
                }

                let mut item = Self::conflict_item(path, local, remote);
                item.previous_size = local.size;
                item.previous_modtime = local.modtime;
                state.items.push(item);
                Ok(())
            }
        }
    }

    /// Only the local side changed: upload, unless the content is provably
    /// untouched (a touch without modification keeps the old checksum).
    async fn classify_local_change(
        &self,
        path: &SyncPath,
        local: &LocalEntry,
        rec: &FileRecord,
        state: &mut WalkState,
    ) {
        if local.size == rec.size {
            if let Some(stored) = &rec.checksum {
                let mine = self
                    .local_checksum(path, stored.algo, local, Some(rec))
                    .await;
                if mine.is_some_and(|m| m.matches(stored)) {
                    let mut item = SyncItem::none(path.clone());
                    item.instruction = Instruction::UpdateMetadata;
                    item.direction = Direction::Up;
                    item.file_type = local.file_type;
                    item.size = local.size;
                    item.modtime = local.modtime;
                    item.inode = local.inode;
                    state.items.push(item);
                    return;
                }
            }
        }

        let mut item = SyncItem::none(path.clone());
        item.instruction = Instruction::Sync;
        item.direction = Direction::Up;
        item.file_type = local.file_type;
        item.size = local.size;
        item.modtime = local.modtime;
        item.previous_size = rec.size;
        item.previous_modtime = rec.modtime;
        item.inode = local.inode;
        item.file_id = Some(rec.file_id.clone());
        item.etag = Some(rec.etag.clone());
        state.items.push(item);
    }

    /// Only the remote side changed: download, unless fake-conflict
    /// suppression proves the content identical.
    async fn classify_remote_change(
        &self,
        path: &SyncPath,
        local: &LocalEntry,
        remote: &RemoteEntry,
        rec: &FileRecord,
        state: &mut WalkState,
    ) {
        let advertised = remote
            .checksum_header
            .as_deref()
            .and_then(Checksum::strongest_in_header);

        let metadata_unchanged = remote.modtime == rec.modtime && remote.size == rec.size;

        let suppressed = if metadata_unchanged {
            match &advertised {
                // No checksum to contradict the unchanged metadata.
                None => true,
                Some(advertised) => self
                    .local_checksum(path, advertised.algo, local, Some(rec))
                    .await
                    .is_some_and(|mine| mine.matches(advertised)),
            }
        } else {
            // Metadata moved: only a strong checksum match may suppress
            // the download.
            match &advertised {
                Some(advertised) if !advertised.algo.is_weak() && local.size == remote.size => {
                    self.local_checksum(path, advertised.algo, local, Some(rec))
                        .await
                        .is_some_and(|mine| mine.matches(advertised))
                }
                _ => false,
            }
        };

        if suppressed {
            state
                .items
                .push(Self::metadata_refresh_item(path, local, remote, rec));
            return;
        }

        let mut item = SyncItem::none(path.clone());
        item.instruction = Instruction::Sync;
        item.direction = Direction::Down;
        item.file_type = local.file_type;
        item.size = remote.size;
        item.modtime = remote.modtime;
        item.previous_size = rec.size;
        item.previous_modtime = rec.modtime;
        item.inode = local.inode;
        item.etag = remote.etag.clone();
        item.file_id = remote.file_id.clone();
        item.remote_perm = remote.permissions.clone();
        item.checksum_header = remote.checksum_header.clone();
        state.items.push(item);
    }

    /// Journal refresh carrying the remote identity while the local file
    /// (and its mtime) stay untouched.
    fn metadata_refresh_item(
        path: &SyncPath,
        local: &LocalEntry,
        remote: &RemoteEntry,
        _rec: &FileRecord,
    ) -> SyncItem {
        let mut item = SyncItem::none(path.clone());
        item.instruction = Instruction::UpdateMetadata;
        item.direction = Direction::Down;
        item.file_type = local.file_type;
        item.size = local.size;
        item.modtime = local.modtime;
        item.inode = local.inode;
        item.etag = remote.etag.clone();
        item.file_id = remote.file_id.clone();
        item.remote_perm = remote.permissions.clone();
        item.checksum_header = remote.checksum_header.clone();
        item
    }

    fn item_from_record(rec: &FileRecord, instruction: Instruction, direction: Direction) -> SyncItem {
        let mut item = SyncItem::none(rec.path.clone());
        item.instruction = instruction;
        item.direction = direction;
        item.file_type = rec.file_type;
        item.size = rec.size;
        item.modtime = rec.modtime;
        item.previous_size = rec.size;
        item.previous_modtime = rec.modtime;
        item.inode = rec.inode;
        item.etag = Some(rec.etag.clone());
        item.file_id = Some(rec.file_id.clone());
        item.remote_perm = Some(rec.remote_perm.clone());
        item.checksum_header = rec.checksum.as_ref().map(ToString::to_string);
        item
    }

    // ========================================================================
    // Selective sync
    // ========================================================================

    /// Handles a path inside an excluded subtree. Previously synced clean
    /// entries are removed locally; dirty ones are retained (and dropped
    /// from the journal so they stay untracked).
    async fn walk_excluded(
        &self,
        path: &SyncPath,
        slot: &Slot,
        state: &mut WalkState,
    ) -> Result<(), WalkError> {
        let Some(_) = &slot.record else {
            // Never synced: stays local-only (or remote-only), untouched.
            return Ok(());
        };

        let records = self.journal.get_files_below(path).await?;
        let mut removals: Vec<SyncItem> = Vec::new();

        // Files first; directory removals are decided afterwards by
        // whether anything below them is being retained.
        let mut dir_records = Vec::new();
        for rec in &records {
            if rec.file_type.is_directory() {
                dir_records.push(rec.clone());
                continue;
            }
            let local = self.fs.metadata(&rec.path).await?;
            match local {
                None => {
                    self.journal.delete_file_record(&rec.path).await?;
                }
                Some(entry) if entry.modtime == rec.modtime && entry.size == rec.size => {
                    removals.push(Self::item_from_record(rec, Instruction::Remove, Direction::Down));
                }
                Some(_) => {
                    // Dirty: keep the bytes, forget the tracking.
                    debug!(path = %rec.path, "excluded path has local changes, retaining");
                    self.journal.delete_file_record(&rec.path).await?;
                }
            }
        }

        // A directory is removable only when nothing below it is dirty or
        // untracked; otherwise it stays (untracked) to shelter the
        // retained files.
        dir_records.sort_by_key(|r| std::cmp::Reverse(r.path.depth()));
        for rec in dir_records {
            if self.subtree_dirty(&rec.path).await? {
                self.journal.delete_file_record(&rec.path).await?;
            } else {
                removals.push(Self::item_from_record(&rec, Instruction::Remove, Direction::Down));
            }
        }

        state.items.extend(removals);
        Ok(())
    }

    // ========================================================================
    // Move detection
    // ========================================================================

    /// Collapses matching remove/new pairs into renames.
    async fn detect_moves(&self, items: Vec<SyncItem>, state: &WalkState) -> Vec<SyncItem> {
        let mut slots: Vec<Option<SyncItem>> = items.into_iter().map(Some).collect();

        // Directories first so a renamed tree becomes one item.
        for dir_pass in [true, false] {
            let new_indices: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| {
                    s.as_ref().and_then(|item| {
                        (item.instruction == Instruction::New
                            && item.is_directory() == dir_pass)
                            .then_some(i)
                    })
                })
                .collect();

            for new_idx in new_indices {
                let Some(new_item) = slots[new_idx].clone() else {
                    continue;
                };
                let Some(remove_idx) = self.find_move_partner(&new_item, &slots, state).await
                else {
                    continue;
                };
                let remove_item = slots[remove_idx].take().expect("candidate still present");
                slots[new_idx] = None;

                debug!(
                    from = %remove_item.path,
                    to = %new_item.path,
                    "coalesced into rename"
                );

                let mut rename = remove_item.clone();
                rename.instruction = Instruction::Rename;
                rename.rename_target = Some(new_item.path.clone());
                rename.direction = new_item.direction;
                rename.size = new_item.size;
                rename.modtime = if new_item.direction == Direction::Down
                    && new_item.modtime != remove_item.modtime
                    && new_item.size == remove_item.size
                {
                    // A metadata-only remote rename keeps the local mtime.
                    remove_item.modtime
                } else {
                    new_item.modtime
                };
                if new_item.direction == Direction::Down {
                    rename.etag = new_item.etag.clone();
                    rename.file_id = new_item.file_id.clone();
                    rename.remote_perm = new_item.remote_perm.clone();
                }

                if rename.is_directory() {
                    self.subsume_children(
                        &remove_item.path,
                        &new_item.path,
                        new_item.direction,
                        &mut slots,
                    )
                    .await;
                }

                slots.push(Some(rename));
            }
        }

        slots.into_iter().flatten().collect()
    }

    /// Finds the best remove partner for a new item, or None.
    async fn find_move_partner(
        &self,
        new_item: &SyncItem,
        slots: &[Option<SyncItem>],
        state: &WalkState,
    ) -> Option<usize> {
        let mut candidates: Vec<(usize, &SyncItem)> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|item| (i, item)))
            .filter(|(_, item)| {
                item.instruction == Instruction::Remove
                    && item.direction == new_item.direction
                    && item.is_directory() == new_item.is_directory()
            })
            .collect();

        match new_item.direction {
            Direction::Down => {
                // Remote-originated: pair by file id. Content must match
                // too, else the move-and-modify rule degrades the pair to
                // remove-plus-new for data safety.
                let new_id = new_item.file_id.as_ref()?;
                candidates.retain(|(_, item)| item.file_id.as_ref() == Some(new_id));
                if !new_item.is_directory() {
                    candidates.retain(|(_, item)| {
                        if item.size != new_item.size {
                            return false;
                        }
                        if item.modtime == new_item.modtime {
                            return true;
                        }
                        let stored = item
                            .checksum_header
                            .as_deref()
                            .and_then(Checksum::strongest_in_header);
                        let advertised = new_item
                            .checksum_header
                            .as_deref()
                            .and_then(Checksum::strongest_in_header);
                        matches!((stored, advertised), (Some(a), Some(b)) if a.matches(&b))
                    });
                }

                // A duplicated id may be a server-side copy; only pair
                // within the same top-level subtree then.
                let duplicated = state
                    .remote_id_counts
                    .get(new_id.as_str())
                    .copied()
                    .unwrap_or(0)
                    > 1;
                if duplicated {
                    let new_top = new_item.path.as_str().split('/').next().unwrap_or("");
                    candidates.retain(|(_, item)| {
                        item.path.as_str().split('/').next().unwrap_or("") == new_top
                    });
                }
            }
            Direction::Up => {
                // Local-originated: size plus inode hint, verified by
                // checksum when the journal stored one.
                candidates.retain(|(_, item)| item.size == new_item.size);
                if new_item.is_directory() {
                    candidates.retain(|(_, item)| item.inode != 0 && item.inode == new_item.inode);
                } else {
                    let mut verified = Vec::new();
                    for (i, item) in candidates {
                        if let Some(stored) = item
                            .checksum_header
                            .as_deref()
                            .and_then(|h| Checksum::parse(h).ok())
                        {
                            let mine = self
                                .fs
                                .compute_checksum(&new_item.path, stored.algo)
                                .await
                                .ok();
                            if !mine.is_some_and(|m| m.matches(&stored)) {
                                continue;
                            }
                        } else if item.inode == 0 || item.inode != new_item.inode {
                            continue;
                        }
                        verified.push((i, item));
                    }
                    candidates = verified;
                }
            }
            Direction::None => return None,
        }

        // Rank: same inode, then nearest common ancestor, then path order.
        candidates.sort_by(|(_, a), (_, b)| {
            let inode_a = a.inode != 0 && a.inode == new_item.inode;
            let inode_b = b.inode != 0 && b.inode == new_item.inode;
            inode_b
                .cmp(&inode_a)
                .then_with(|| {
                    common_components(b.path.as_str(), new_item.path.as_str()).cmp(
                        &common_components(a.path.as_str(), new_item.path.as_str()),
                    )
                })
                .then_with(|| a.path.cmp(&b.path))
        });

        candidates.first().map(|(i, _)| *i)
    }

    /// Drops child items subsumed by a directory rename (their identity
    /// travels with the journal's subtree re-key) and re-keys leftover
    /// items under the old prefix.
    async fn subsume_children(
        &self,
        old: &SyncPath,
        new: &SyncPath,
        direction: Direction,
        slots: &mut [Option<SyncItem>],
    ) {
        // Pair children by relative path.
        let mut removes: HashMap<String, usize> = HashMap::new();
        for (i, slot) in slots.iter().enumerate() {
            if let Some(item) = slot {
                if item.instruction == Instruction::Remove
                    && item.path.starts_with(old)
                    && item.path != *old
                {
                    if let Ok(rel) = item.path.reparent(old, &SyncPath::root()) {
                        removes.insert(rel.as_str().to_string(), i);
                    }
                }
            }
        }

        let mut drops: Vec<(usize, usize)> = Vec::new();
        for (i, slot) in slots.iter().enumerate() {
            if let Some(item) = slot {
                if item.instruction == Instruction::New
                    && item.path.starts_with(new)
                    && item.path != *new
                {
                    if let Ok(rel) = item.path.reparent(new, &SyncPath::root()) {
                        if let Some(&remove_idx) = removes.get(rel.as_str()) {
                            let remove = slots[remove_idx].as_ref().expect("indexed above");
                            let unchanged = remove.size == item.size
                                && (item.direction != Direction::Down
                                    || remove.file_id == item.file_id);
                            if unchanged {
                                drops.push((i, remove_idx));
                            }
                        }
                    }
                }
            }
        }
        for (new_idx, remove_idx) in drops {
            slots[new_idx] = None;
            slots[remove_idx] = None;
        }

        // Children that merely travel with the rename produce a lone New
        // at the new location (nothing was emitted for the old path when
        // only one side listed the directory). The journal record at the
        // old path identifies them; unchanged ones need no transfer.
        for slot in slots.iter_mut() {
            let Some(item) = slot else { continue };
            if item.instruction != Instruction::New
                || !item.path.starts_with(new)
                || item.path == *new
            {
                continue;
            }
            let Ok(old_child) = item.path.reparent(new, old) else {
                continue;
            };
            let Ok(Some(rec)) = self.journal.get_file_record(&old_child).await else {
                continue;
            };
            let unchanged = match direction {
                Direction::Down => {
                    rec.size == item.size
                        && (item.file_id.is_none()
                            || Some(&rec.file_id) == item.file_id.as_ref())
                        && (item.etag.is_none() || Some(&rec.etag) == item.etag.as_ref())
                }
                _ => rec.size == item.size && rec.modtime == item.modtime,
            };
            if unchanged {
                *slot = None;
            }
        }

        // Whatever still points below the old location happens after the
        // rename, so it must address the new location.
        for slot in slots.iter_mut() {
            if let Some(item) = slot {
                if item.path.starts_with(old) && item.path != *old {
                    if let Ok(moved) = item.path.reparent(old, new) {
                        item.path = moved;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Blacklist gating
    // ========================================================================

    /// Replaces transfers whose blacklist window is still open with
    /// ignored items, without touching the network.
    async fn apply_blacklist_gating(
        &self,
        items: &mut [SyncItem],
        now: i64,
    ) -> anyhow::Result<()> {
        for item in items.iter_mut() {
            if !item.instruction.is_data_transfer() {
                continue;
            }
            if let Some(entry) = self.journal.blacklist_entry(&item.path).await? {
                if entry.is_active(now) {
                    debug!(path = %item.path, "blacklisted, skipping until backoff elapses");
                    item.instruction = Instruction::Ignore;
                    item.status = ItemStatus::FileIgnored;
                    item.error_string = Some(entry.error_string);
                }
            }
        }
        Ok(())
    }
}

/// Number of leading path components two paths share.
fn common_components(a: &str, b: &str) -> usize {
    a.split('/')
        .zip(b.split('/'))
        .take_while(|(x, y)| x == y)
        .count()
}
