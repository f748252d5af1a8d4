//! On-disk resource store
//!
//! Each generation is a directory under the store root and each entry is a
//! single JSON file named after the SHA-1 of its request key. Entries are
//! written through a temp file and atomically persisted, so a reader never
//! observes a partially written entry. A small Moka cache keeps recently
//! read entries in memory.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info, trace};

use super::{CachedEntry, GenerationHandle, RequestKey, ResourceStore, StoreError};

/// Default number of entries kept in the hot cache
const DEFAULT_HOT_CAPACITY: u64 = 256;

/// Extension of entry files
const ENTRY_EXT: &str = "entry";

/// Extension of in-flight temp files
const TMP_EXT: &str = "tmp";

type HotKey = (String, RequestKey);

/// Serialized form of a cached entry
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRecord {
    key: String,
    status: u16,
    #[serde(default)]
    content_type: Option<String>,
    stored_at: u64,
    /// Base64-encoded body
    body: String,
}

impl EntryRecord {
    fn from_entry(entry: &CachedEntry) -> Self {
        Self {
            key: entry.key.as_str().to_string(),
            status: entry.status,
            content_type: entry.content_type.clone(),
            stored_at: entry.stored_at,
            body: base64::engine::general_purpose::STANDARD.encode(&entry.body),
        }
    }

    fn into_entry(self) -> Result<CachedEntry, StoreError> {
        let body = base64::engine::general_purpose::STANDARD
            .decode(self.body.as_bytes())
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.key, e)))?;

        Ok(CachedEntry {
            key: RequestKey::from(self.key),
            status: self.status,
            content_type: self.content_type,
            body: Bytes::from(body),
            stored_at: self.stored_at,
        })
    }
}

/// Resource store persisted to the local filesystem
pub struct DiskStore {
    /// Root directory holding one subdirectory per generation
    root: PathBuf,
    /// Recently read or written entries
    hot: Cache<HotKey, CachedEntry>,
    /// Hot cache hit counter
    hits: Arc<AtomicU64>,
    /// Hot cache miss counter
    misses: Arc<AtomicU64>,
    /// Bumped on every generation delete
    epoch: AtomicU64,
    /// Generations already swept for stale temp files
    swept: Mutex<HashSet<String>>,
}

impl DiskStore {
    /// Create a store in the platform cache directory
    pub fn new() -> Result<Self, StoreError> {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("offline-cache");

        Self::with_dir(root)
    }

    /// Create a store rooted at a specific directory
    pub fn with_dir(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root).map_err(|e| unavailable(&root, e))?;

        let hot = Cache::builder()
            .max_capacity(DEFAULT_HOT_CAPACITY)
            .name("resource_hot_cache")
            .build();

        info!(root = %root.display(), "Disk store initialized");

        Ok(Self {
            root,
            hot,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            epoch: AtomicU64::new(0),
            swept: Mutex::new(HashSet::new()),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get hot cache statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    /// Log current hot cache metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            hot_entries = self.hot.entry_count(),
            "Disk store metrics"
        );
    }

    fn generation_dir(&self, name: &str) -> PathBuf {
        generation_dir(&self.root, name)
    }

    /// Insert into the hot cache unless a generation was deleted since `epoch`
    fn remember(&self, epoch: u64, hot_key: HotKey, entry: CachedEntry) {
        self.hot.insert(hot_key.clone(), entry);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            self.hot.invalidate(&hot_key);
        }
    }
}

#[async_trait]
impl ResourceStore for DiskStore {
    async fn open(&self, name: &str) -> Result<GenerationHandle, StoreError> {
        let dir = self.generation_dir(name);
        let sweep = self
            .swept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| unavailable(&dir, e))?;
            if sweep {
                remove_stale_temp_files(&dir);
            }
            Ok(())
        })
        .await?;

        Ok(GenerationHandle::new(name))
    }

    async fn get(
        &self,
        handle: &GenerationHandle,
        key: &RequestKey,
    ) -> Result<Option<CachedEntry>, StoreError> {
        let hot_key = (handle.name().to_string(), key.clone());
        if let Some(entry) = self.hot.get(&hot_key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(generation = handle.name(), key = %key, "Hot cache HIT");
            return Ok(Some(entry));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let epoch = self.epoch.load(Ordering::SeqCst);
        let path = entry_path(&self.generation_dir(handle.name()), key);
        let found = blocking(move || read_entry(&path)).await?;

        if let Some(entry) = &found {
            self.remember(epoch, hot_key, entry.clone());
        }
        Ok(found)
    }

    async fn put(&self, handle: &GenerationHandle, entry: CachedEntry) -> Result<(), StoreError> {
        let dir = self.generation_dir(handle.name());
        let record = EntryRecord::from_entry(&entry);
        let path = entry_path(&dir, &entry.key);

        let epoch = self.epoch.load(Ordering::SeqCst);
        let written = blocking(move || write_entry(&dir, &path, &record)).await?;
        if written {
            let hot_key = (handle.name().to_string(), entry.key.clone());
            self.remember(epoch, hot_key, entry);
        } else {
            debug!(generation = handle.name(), key = %entry.key, "Dropping write to deleted generation");
        }
        Ok(())
    }

    async fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
        let dir = self.generation_dir(name);
        let existed = blocking(move || match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable(&dir, e)),
        })
        .await?;

        self.swept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        // Hot keys are not indexed by generation
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.hot.invalidate_all();
        debug!(generation = name, existed = existed, "Deleted generation");
        Ok(existed)
    }

    async fn generation_names(&self) -> Result<BTreeSet<String>, StoreError> {
        let root = self.root.clone();
        blocking(move || {
            let read_dir = match fs::read_dir(&root) {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
                Err(e) => return Err(unavailable(&root, e)),
            };

            let mut names = BTreeSet::new();
            for entry in read_dir.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let raw = entry.file_name().to_string_lossy().to_string();
                match urlencoding::decode(&raw) {
                    Ok(name) => {
                        names.insert(name.into_owned());
                    }
                    Err(_) => {
                        debug!(dir = %raw, "Skipping undecodable generation directory");
                    }
                }
            }
            Ok(names)
        })
        .await
    }

    async fn entry_count(&self, handle: &GenerationHandle) -> Result<usize, StoreError> {
        let dir = self.generation_dir(handle.name());
        blocking(move || match fs::read_dir(&dir) {
            Ok(read_dir) => Ok(read_dir
                .flatten()
                .filter(|e| e.path().extension().is_some_and(|ext| ext == ENTRY_EXT))
                .count()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(unavailable(&dir, e)),
        })
        .await
    }
}

/// Run blocking filesystem work off the async executor
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
}

fn unavailable(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", path.display(), err))
}

fn generation_dir(root: &Path, name: &str) -> PathBuf {
    root.join(urlencoding::encode(name).as_ref())
}

fn entry_path(dir: &Path, key: &RequestKey) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(key.as_str().as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    dir.join(format!("{}.{}", hash, ENTRY_EXT))
}

fn read_entry(path: &Path) -> Result<Option<CachedEntry>, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(unavailable(path, e)),
    };

    let record: EntryRecord = serde_json::from_slice(&data)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
    record.into_entry().map(Some)
}

/// Write an entry atomically. Returns false if the generation is gone.
fn write_entry(dir: &Path, path: &Path, record: &EntryRecord) -> Result<bool, StoreError> {
    if !dir.is_dir() {
        return Ok(false);
    }

    let json = serde_json::to_vec(record)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", record.key, e)))?;

    let mut tmp = match tempfile::Builder::new()
        .suffix(&format!(".{}", TMP_EXT))
        .tempfile_in(dir)
    {
        Ok(tmp) => tmp,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(unavailable(dir, e)),
    };

    tmp.write_all(&json).map_err(|e| unavailable(path, e))?;
    tmp.persist(path).map_err(|e| unavailable(path, e.error))?;

    trace!(path = %path.display(), size = json.len(), "Stored entry");
    Ok(true)
}

/// Remove temp files left behind by interrupted writes
fn remove_stale_temp_files(dir: &Path) {
    if let Ok(read_dir) = fs::read_dir(dir) {
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == TMP_EXT) {
                debug!(path = %path.display(), "Removing stale temp file");
                let _ = fs::remove_file(&path);
            }
        }
    }
}
