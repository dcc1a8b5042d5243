//! Shared test harness: an in-memory fake DAV server with operation
//! counters and scripted failures, plus a fixture wiring it to a temp
//! directory, an in-memory journal and the engine.
//!
//! Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use davdrive_core::capabilities::Capabilities;
use davdrive_core::config::SyncOptions;
use davdrive_core::domain::{Checksum, ChecksumAlgorithm, ETag, FileId, SyncPath};
use davdrive_core::ports::{
    Depth, IRemoteStorage, PutOutcome, RemoteDownload, RemoteEntry, RemoteError,
};
use davdrive_engine::filesystem::digest_bytes;
use davdrive_engine::{LocalFileSystem, NoopPlaceholders, SyncEngine, SyncResult};
use davdrive_journal::SqliteJournal;

/// Fixed base mtime so both sides agree unless a test moves the clock.
pub const BASE_MTIME: i64 = 1_700_000_000;

pub const DEFAULT_PERMS: &str = "RDNVCKW";

// ============================================================================
// Fake remote tree
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakeEntry {
    pub is_dir: bool,
    pub data: Vec<u8>,
    pub modtime: i64,
    pub etag: String,
    pub file_id: String,
    pub checksum_header: Option<String>,
}

#[derive(Default)]
pub struct Counters {
    pub propfind: AtomicU32,
    pub get: AtomicU32,
    pub put: AtomicU32,
    pub mv: AtomicU32,
    pub delete: AtomicU32,
    pub mkcol: AtomicU32,
    pub put_507: AtomicU32,
}

impl Counters {
    pub fn reset(&self) {
        self.propfind.store(0, Ordering::SeqCst);
        self.get.store(0, Ordering::SeqCst);
        self.put.store(0, Ordering::SeqCst);
        self.mv.store(0, Ordering::SeqCst);
        self.delete.store(0, Ordering::SeqCst);
        self.mkcol.store(0, Ordering::SeqCst);
        self.put_507.store(0, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> u32 {
        self.get.load(Ordering::SeqCst)
    }
    pub fn put_count(&self) -> u32 {
        self.put.load(Ordering::SeqCst)
    }
    pub fn move_count(&self) -> u32 {
        self.mv.load(Ordering::SeqCst)
    }
    pub fn delete_count(&self) -> u32 {
        self.delete.load(Ordering::SeqCst)
    }
    pub fn put_507_count(&self) -> u32 {
        self.put_507.load(Ordering::SeqCst)
    }
}

/// In-memory IRemoteStorage with scripted failures
pub struct FakeRemote {
    tree: Mutex<BTreeMap<String, FakeEntry>>,
    etag_seq: AtomicU64,
    id_seq: AtomicU64,
    pub counters: Counters,
    capabilities: Mutex<Capabilities>,
    /// PROPFIND on these directories fails with the stored error.
    propfind_errors: Mutex<HashMap<String, RemoteError>>,
    /// Any mutation touching these paths fails with the stored HTTP code.
    error_paths: Mutex<HashMap<String, u16>>,
    /// Server-side quota: uploads with OC-Total-Length above it get 507.
    quota: Mutex<Option<u64>>,
    /// Overrides the OC-Checksum / Content-MD5 headers served on GET.
    get_checksum_override: Mutex<Option<String>>,
    get_md5_override: Mutex<Option<String>>,
    /// Fails the finalize MOVE of chunked uploads with this HTTP code.
    finalize_status: Mutex<Option<u16>>,
    /// Entries whose PROPFIND omits identity properties.
    suppress_etag: Mutex<HashSet<String>>,
    suppress_file_id: Mutex<HashSet<String>>,
    suppress_permissions: Mutex<HashSet<String>>,
    uploads: Mutex<HashMap<u64, BTreeMap<u64, Vec<u8>>>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let remote = Self {
            tree: Mutex::new(BTreeMap::new()),
            etag_seq: AtomicU64::new(1),
            id_seq: AtomicU64::new(1),
            counters: Counters::default(),
            capabilities: Mutex::new(Capabilities::default()),
            propfind_errors: Mutex::new(HashMap::new()),
            error_paths: Mutex::new(HashMap::new()),
            quota: Mutex::new(None),
            get_checksum_override: Mutex::new(None),
            get_md5_override: Mutex::new(None),
            finalize_status: Mutex::new(None),
            suppress_etag: Mutex::new(HashSet::new()),
            suppress_file_id: Mutex::new(HashSet::new()),
            suppress_permissions: Mutex::new(HashSet::new()),
            uploads: Mutex::new(HashMap::new()),
        };
        {
            let mut tree = remote.tree.lock().unwrap();
            tree.insert(
                String::new(),
                FakeEntry {
                    is_dir: true,
                    data: Vec::new(),
                    modtime: BASE_MTIME,
                    etag: "etag-root-1".to_string(),
                    file_id: "fid-root".to_string(),
                    checksum_header: None,
                },
            );
        }
        Arc::new(remote)
    }

    fn next_etag(&self) -> String {
        format!("etag-{}", self.etag_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn next_id(&self) -> String {
        format!("fid-{}", self.id_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn bump_ancestors(tree: &mut BTreeMap<String, FakeEntry>, path: &str, fresh: impl Fn() -> String) {
        let mut current = path.to_string();
        loop {
            current = match current.rfind('/') {
                Some(pos) => current[..pos].to_string(),
                None => String::new(),
            };
            if let Some(entry) = tree.get_mut(&current) {
                entry.etag = fresh();
            }
            if current.is_empty() {
                break;
            }
        }
    }

    fn ensure_parents(&self, tree: &mut BTreeMap<String, FakeEntry>, path: &str) {
        let mut prefix = String::new();
        let components: Vec<&str> = path.split('/').collect();
        for component in &components[..components.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            if !tree.contains_key(&prefix) {
                let entry = FakeEntry {
                    is_dir: true,
                    data: Vec::new(),
                    modtime: BASE_MTIME,
                    etag: self.next_etag(),
                    file_id: self.next_id(),
                    checksum_header: None,
                };
                tree.insert(prefix.clone(), entry);
            }
        }
    }

    // --- Remote-side modifier API (the test's hand on the server) ---

    pub fn insert(&self, path: &str, size: usize, fill: u8) {
        let mut tree = self.tree.lock().unwrap();
        self.ensure_parents(&mut tree, path);
        let entry = FakeEntry {
            is_dir: false,
            data: vec![fill; size],
            modtime: BASE_MTIME,
            etag: self.next_etag(),
            file_id: self.next_id(),
            checksum_header: None,
        };
        tree.insert(path.to_string(), entry);
        Self::bump_ancestors(&mut tree, path, || self.next_etag());
    }

    /// Inserts a file reusing an existing file id (a server-side shared
    /// or copied file).
    pub fn insert_with_id(&self, path: &str, size: usize, fill: u8, file_id: &str) {
        self.insert(path, size, fill);
        let mut tree = self.tree.lock().unwrap();
        tree.get_mut(path).unwrap().file_id = file_id.to_string();
    }

    pub fn mkdir(&self, path: &str) {
        let mut tree = self.tree.lock().unwrap();
        self.ensure_parents(&mut tree, path);
        let entry = FakeEntry {
            is_dir: true,
            data: Vec::new(),
            modtime: BASE_MTIME,
            etag: self.next_etag(),
            file_id: self.next_id(),
            checksum_header: None,
        };
        tree.insert(path.to_string(), entry);
        Self::bump_ancestors(&mut tree, path, || self.next_etag());
    }

    pub fn remove(&self, path: &str) {
        let mut tree = self.tree.lock().unwrap();
        let prefix = format!("{path}/");
        tree.retain(|k, _| k.as_str() != path && !k.starts_with(&prefix));
        Self::bump_ancestors(&mut tree, path, || self.next_etag());
    }

    pub fn rename(&self, old: &str, new: &str) {
        let mut tree = self.tree.lock().unwrap();
        let prefix = format!("{old}/");
        let moved: Vec<(String, FakeEntry)> = tree
            .iter()
            .filter(|(k, _)| k.as_str() == old || k.starts_with(&prefix))
            .map(|(k, v)| {
                let tail = &k[old.len()..];
                (format!("{new}{tail}"), v.clone())
            })
            .collect();
        tree.retain(|k, _| k.as_str() != old && !k.starts_with(&prefix));
        for (k, v) in moved {
            tree.insert(k, v);
        }
        Self::bump_ancestors(&mut tree, old, || self.next_etag());
        Self::bump_ancestors(&mut tree, new, || self.next_etag());
    }

    pub fn set_contents(&self, path: &str, size: usize, fill: u8, modtime: i64) {
        let mut tree = self.tree.lock().unwrap();
        let entry = tree.get_mut(path).expect("entry exists");
        entry.data = vec![fill; size];
        entry.modtime = modtime;
        entry.etag = self.next_etag();
        Self::bump_ancestors(&mut tree, path, || self.next_etag());
    }

    pub fn append_byte(&self, path: &str, byte: u8, modtime: i64) {
        let mut tree = self.tree.lock().unwrap();
        let entry = tree.get_mut(path).expect("entry exists");
        entry.data.push(byte);
        entry.modtime = modtime;
        entry.etag = self.next_etag();
        Self::bump_ancestors(&mut tree, path, || self.next_etag());
    }

    pub fn set_modtime(&self, path: &str, modtime: i64) {
        let mut tree = self.tree.lock().unwrap();
        let entry = tree.get_mut(path).expect("entry exists");
        entry.modtime = modtime;
        entry.etag = self.next_etag();
        Self::bump_ancestors(&mut tree, path, || self.next_etag());
    }

    pub fn set_checksum_header(&self, path: &str, header: &str) {
        let mut tree = self.tree.lock().unwrap();
        tree.get_mut(path).expect("entry exists").checksum_header = Some(header.to_string());
    }

    pub fn entry(&self, path: &str) -> Option<FakeEntry> {
        self.tree.lock().unwrap().get(path).cloned()
    }

    /// Snapshot of (path -> (is_dir, data)) for state comparisons.
    pub fn state(&self) -> BTreeMap<String, (bool, Vec<u8>)> {
        self.tree
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.clone(), (v.is_dir, v.data.clone())))
            .collect()
    }

    /// Snapshot of one subtree.
    pub fn subtree_state(&self, prefix: &str) -> BTreeMap<String, (bool, Vec<u8>)> {
        self.state()
            .into_iter()
            .filter(|(k, _)| k == prefix || k.starts_with(&format!("{prefix}/")))
            .collect()
    }

    // --- Failure scripting ---

    pub fn set_capabilities(&self, caps: Capabilities) {
        *self.capabilities.lock().unwrap() = caps;
    }

    pub fn fail_propfind(&self, dir: &str, err: RemoteError) {
        self.propfind_errors
            .lock()
            .unwrap()
            .insert(dir.to_string(), err);
    }

    pub fn clear_propfind_errors(&self) {
        self.propfind_errors.lock().unwrap().clear();
    }

    pub fn fail_path(&self, path: &str, code: u16) {
        self.error_paths.lock().unwrap().insert(path.to_string(), code);
    }

    pub fn unfail_path(&self, path: &str) {
        self.error_paths.lock().unwrap().remove(path);
    }

    pub fn set_quota(&self, quota: Option<u64>) {
        *self.quota.lock().unwrap() = quota;
    }

    pub fn override_get_checksum(&self, header: Option<&str>) {
        *self.get_checksum_override.lock().unwrap() = header.map(str::to_string);
    }

    pub fn override_get_md5(&self, value: Option<&str>) {
        *self.get_md5_override.lock().unwrap() = value.map(str::to_string);
    }

    pub fn fail_finalize(&self, code: Option<u16>) {
        *self.finalize_status.lock().unwrap() = code;
    }

    pub fn suppress_etag(&self, path: &str) {
        self.suppress_etag.lock().unwrap().insert(path.to_string());
    }

    pub fn suppress_file_id(&self, path: &str) {
        self.suppress_file_id.lock().unwrap().insert(path.to_string());
    }

    pub fn suppress_permissions(&self, path: &str) {
        self.suppress_permissions
            .lock()
            .unwrap()
            .insert(path.to_string());
    }

    fn to_remote_entry(&self, path: &str, entry: &FakeEntry) -> RemoteEntry {
        let etag = if self.suppress_etag.lock().unwrap().contains(path) {
            None
        } else {
            ETag::new(entry.etag.clone()).ok()
        };
        let file_id = if self.suppress_file_id.lock().unwrap().contains(path) {
            None
        } else {
            FileId::new(entry.file_id.clone()).ok()
        };
        let permissions = if self.suppress_permissions.lock().unwrap().contains(path) {
            None
        } else {
            Some(DEFAULT_PERMS.to_string())
        };
        RemoteEntry {
            path: SyncPath::new(path).unwrap(),
            size: entry.data.len() as u64,
            modtime: entry.modtime,
            etag,
            file_id,
            permissions,
            checksum_header: entry.checksum_header.clone(),
            is_collection: entry.is_dir,
        }
    }

    /// Writes a file entry without touching counters or quota checks.
    fn store_file(
        &self,
        path: &str,
        data: Vec<u8>,
        modtime: i64,
        checksum: Option<&Checksum>,
    ) -> PutOutcome {
        let mut tree = self.tree.lock().unwrap();
        self.ensure_parents(&mut tree, path);
        let file_id = tree
            .get(path)
            .map(|e| e.file_id.clone())
            .unwrap_or_else(|| self.next_id());
        let etag = self.next_etag();
        tree.insert(
            path.to_string(),
            FakeEntry {
                is_dir: false,
                data,
                modtime,
                etag: etag.clone(),
                file_id: file_id.clone(),
                checksum_header: checksum.map(ToString::to_string),
            },
        );
        Self::bump_ancestors(&mut tree, path, || self.next_etag());
        PutOutcome {
            etag: ETag::new(etag).ok(),
            file_id: FileId::new(file_id).ok(),
        }
    }

    fn scripted_error(&self, path: &str) -> Option<RemoteError> {
        self.error_paths
            .lock()
            .unwrap()
            .get(path)
            .map(|&code| RemoteError::Http {
                code,
                message: "Internal Server Fake Error".to_string(),
            })
    }
}

#[async_trait::async_trait]
impl IRemoteStorage for FakeRemote {
    async fn capabilities(&self) -> Result<Capabilities, RemoteError> {
        Ok(self.capabilities.lock().unwrap().clone())
    }

    async fn propfind(
        &self,
        path: &SyncPath,
        depth: Depth,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.counters.propfind.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.propfind_errors.lock().unwrap().get(path.as_str()) {
            return Err(err.clone());
        }
        let tree = self.tree.lock().unwrap();
        let Some(own) = tree.get(path.as_str()) else {
            return Err(RemoteError::http(404));
        };
        let mut entries = vec![self.to_remote_entry(path.as_str(), own)];
        if depth == Depth::One && own.is_dir {
            let prefix = if path.is_root() {
                String::new()
            } else {
                format!("{}/", path.as_str())
            };
            for (k, v) in tree.iter() {
                if k.is_empty() || !k.starts_with(&prefix) || *k == *path.as_str() {
                    continue;
                }
                let rest = &k[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    continue;
                }
                entries.push(self.to_remote_entry(k, v));
            }
        }
        Ok(entries)
    }

    async fn get(&self, path: &SyncPath) -> Result<RemoteDownload, RemoteError> {
        self.counters.get.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_error(path.as_str()) {
            return Err(err);
        }
        let tree = self.tree.lock().unwrap();
        let Some(entry) = tree.get(path.as_str()) else {
            return Err(RemoteError::http(404));
        };
        let checksum_header = self
            .get_checksum_override
            .lock()
            .unwrap()
            .clone()
            .or_else(|| entry.checksum_header.clone());
        let content_md5 = self.get_md5_override.lock().unwrap().clone();
        Ok(RemoteDownload {
            data: entry.data.clone(),
            etag: ETag::new(entry.etag.clone()).ok(),
            file_id: FileId::new(entry.file_id.clone()).ok(),
            checksum_header,
            content_md5,
            modtime: Some(entry.modtime),
        })
    }

    async fn put_simple(
        &self,
        path: &SyncPath,
        data: Vec<u8>,
        modtime: i64,
        checksum: Option<&Checksum>,
    ) -> Result<PutOutcome, RemoteError> {
        self.counters.put.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_error(path.as_str()) {
            return Err(err);
        }
        if let Some(quota) = *self.quota.lock().unwrap() {
            if data.len() as u64 > quota {
                self.counters.put_507.fetch_add(1, Ordering::SeqCst);
                return Err(RemoteError::http(507));
            }
        }
        Ok(self.store_file(path.as_str(), data, modtime, checksum))
    }

    async fn mkcol(&self, path: &SyncPath) -> Result<PutOutcome, RemoteError> {
        self.counters.mkcol.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_error(path.as_str()) {
            return Err(err);
        }
        let mut tree = self.tree.lock().unwrap();
        self.ensure_parents(&mut tree, path.as_str());
        let etag = self.next_etag();
        let file_id = self.next_id();
        tree.insert(
            path.as_str().to_string(),
            FakeEntry {
                is_dir: true,
                data: Vec::new(),
                modtime: BASE_MTIME,
                etag: etag.clone(),
                file_id: file_id.clone(),
                checksum_header: None,
            },
        );
        Self::bump_ancestors(&mut tree, path.as_str(), || self.next_etag());
        Ok(PutOutcome {
            etag: ETag::new(etag).ok(),
            file_id: FileId::new(file_id).ok(),
        })
    }

    async fn move_item(
        &self,
        src: &SyncPath,
        dst: &SyncPath,
        _overwrite: bool,
    ) -> Result<(), RemoteError> {
        self.counters.mv.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .scripted_error(src.as_str())
            .or_else(|| self.scripted_error(dst.as_str()))
        {
            return Err(err);
        }
        if self.entry(src.as_str()).is_none() {
            return Err(RemoteError::http(404));
        }
        self.rename(src.as_str(), dst.as_str());
        Ok(())
    }

    async fn delete(&self, path: &SyncPath) -> Result<(), RemoteError> {
        self.counters.delete.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_error(path.as_str()) {
            return Err(err);
        }
        if self.entry(path.as_str()).is_none() {
            return Err(RemoteError::http(404));
        }
        self.remove(path.as_str());
        Ok(())
    }

    async fn create_upload_session(&self, transfer_id: u64) -> Result<(), RemoteError> {
        self.uploads
            .lock()
            .unwrap()
            .entry(transfer_id)
            .or_default();
        Ok(())
    }

    async fn put_chunk(
        &self,
        transfer_id: u64,
        offset: u64,
        data: Vec<u8>,
        total_size: u64,
    ) -> Result<(), RemoteError> {
        self.counters.put.fetch_add(1, Ordering::SeqCst);
        if let Some(quota) = *self.quota.lock().unwrap() {
            if total_size > quota {
                self.counters.put_507.fetch_add(1, Ordering::SeqCst);
                return Err(RemoteError::http(507));
            }
        }
        self.uploads
            .lock()
            .unwrap()
            .entry(transfer_id)
            .or_default()
            .insert(offset, data);
        Ok(())
    }

    async fn finalize_upload(
        &self,
        transfer_id: u64,
        dst: &SyncPath,
        _total_length: u64,
        modtime: i64,
        checksum: Option<&Checksum>,
    ) -> Result<PutOutcome, RemoteError> {
        self.counters.mv.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = *self.finalize_status.lock().unwrap() {
            return Err(RemoteError::Http {
                code,
                message: "Fake finalize error".to_string(),
            });
        }
        let chunks = self
            .uploads
            .lock()
            .unwrap()
            .remove(&transfer_id)
            .unwrap_or_default();
        let mut data = Vec::new();
        for (_, chunk) in chunks {
            data.extend_from_slice(&chunk);
        }
        Ok(self.store_file(dst.as_str(), data, modtime, checksum))
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub remote: Arc<FakeRemote>,
    pub journal: Arc<SqliteJournal>,
    pub fs: Arc<LocalFileSystem>,
    pub options: SyncOptions,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        let journal = Arc::new(SqliteJournal::in_memory().await.unwrap());
        let fs = Arc::new(LocalFileSystem::new(dir.path()));
        Self {
            dir,
            remote,
            journal,
            fs,
            options: SyncOptions::default(),
        }
    }

    /// Seeds the usual A/B/C layout remotely and syncs to convergence.
    pub async fn seeded() -> Self {
        let fixture = Self::new().await;
        for dir in ["A", "B", "C"] {
            fixture.remote.mkdir(dir);
            for n in 1..=2 {
                fixture.remote.insert(&format!("{dir}/{}{n}", dir.to_lowercase()), 16, b'x');
            }
        }
        let result = fixture.sync().await;
        assert!(result.success, "seed sync failed: {:?}", result);
        fixture.assert_converged().await;
        fixture.remote.counters.reset();
        fixture
    }

    pub fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            self.remote.clone() as Arc<dyn IRemoteStorage>,
            self.fs.clone(),
            self.journal.clone(),
            Arc::new(NoopPlaceholders),
            self.options.clone(),
        )
    }

    pub async fn sync(&self) -> SyncResult {
        self.engine().sync().await.expect("sync run errored")
    }

    pub fn local_path(&self, path: &str) -> PathBuf {
        self.dir.path().join(path)
    }

    // --- Local-side modifier API ---

    pub fn local_insert(&self, path: &str, size: usize, fill: u8) {
        let abs = self.local_path(path);
        std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
        std::fs::write(&abs, vec![fill; size]).unwrap();
        filetime::set_file_mtime(&abs, filetime::FileTime::from_unix_time(BASE_MTIME, 0)).unwrap();
    }

    pub fn local_set_contents(&self, path: &str, size: usize, fill: u8, modtime: i64) {
        let abs = self.local_path(path);
        std::fs::write(&abs, vec![fill; size]).unwrap();
        filetime::set_file_mtime(&abs, filetime::FileTime::from_unix_time(modtime, 0)).unwrap();
    }

    pub fn local_append_byte(&self, path: &str, byte: u8, modtime: i64) {
        let abs = self.local_path(path);
        let mut data = std::fs::read(&abs).unwrap();
        data.push(byte);
        std::fs::write(&abs, data).unwrap();
        filetime::set_file_mtime(&abs, filetime::FileTime::from_unix_time(modtime, 0)).unwrap();
    }

    pub fn local_mkdir(&self, path: &str) {
        std::fs::create_dir_all(self.local_path(path)).unwrap();
    }

    pub fn local_remove(&self, path: &str) {
        let abs = self.local_path(path);
        if abs.is_dir() {
            std::fs::remove_dir_all(abs).unwrap();
        } else {
            std::fs::remove_file(abs).unwrap();
        }
    }

    pub fn local_rename(&self, old: &str, new: &str) {
        std::fs::rename(self.local_path(old), self.local_path(new)).unwrap();
    }

    pub fn local_set_modtime(&self, path: &str, modtime: i64) {
        filetime::set_file_mtime(
            self.local_path(path),
            filetime::FileTime::from_unix_time(modtime, 0),
        )
        .unwrap();
    }

    pub fn local_exists(&self, path: &str) -> bool {
        self.local_path(path).exists()
    }

    /// Snapshot of (path -> (is_dir, data)) of the local tree.
    pub fn local_state(&self) -> BTreeMap<String, (bool, Vec<u8>)> {
        fn walk(
            root: &std::path::Path,
            dir: &std::path::Path,
            out: &mut BTreeMap<String, (bool, Vec<u8>)>,
        ) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                let path = entry.path();
                let rel = path
                    .strip_prefix(root)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .to_string();
                if path.is_dir() {
                    out.insert(rel, (true, Vec::new()));
                    walk(root, &path, out);
                } else {
                    out.insert(rel, (false, std::fs::read(&path).unwrap()));
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(self.dir.path(), self.dir.path(), &mut out);
        out
    }

    pub fn local_subtree_state(&self, prefix: &str) -> BTreeMap<String, (bool, Vec<u8>)> {
        self.local_state()
            .into_iter()
            .filter(|(k, _)| k == prefix || k.starts_with(&format!("{prefix}/")))
            .collect()
    }

    /// Local tree and remote tree must agree on paths, kinds and bytes.
    pub async fn assert_converged(&self) {
        assert_eq!(self.local_state(), self.remote.state(), "trees diverged");
    }

    pub async fn file_record(&self, path: &str) -> Option<davdrive_core::domain::FileRecord> {
        use davdrive_core::ports::IJournal;
        self.journal
            .get_file_record(&SyncPath::new(path).unwrap())
            .await
            .unwrap()
    }
}

/// Capabilities advertising SHA1 upload checksums, the usual test setup.
pub fn sha1_capabilities() -> Capabilities {
    Capabilities::from_json(&serde_json::json!({
        "checksums": {
            "supportedTypes": ["SHA1", "MD5", "ADLER32"],
            "preferredUploadType": "SHA1"
        }
    }))
}

/// Convenience digest for expected-value assertions.
pub fn sha1_hex(data: &[u8]) -> String {
    digest_bytes(data, ChecksumAlgorithm::Sha1).hex
}
