//! Durable memory store
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/episodic/<id>.json
//! <root>/semantic/<id>.json
//! <root>/procedural/<id>.json
//! <root>/index/<type>.json      {"ids": [...], "counts": {...}, "tags": {...}}
//! ```
//!
//! A save writes the record file first. Only after that succeeds does it
//! take the state lock to update the in-memory index and cache, and the
//! index file is rewritten after the lock is dropped. No file I/O happens
//! while the lock is held.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use weft_core::{MemoryConfig, MemoryRecord, RecordType, Result, WeftError};

use crate::cache::RecordCache;
use crate::index::{index_path, read_index, write_index, TypeIndex};
use crate::query::{RecordFilter, RecordQuery};

const REBUILD_ATTEMPTS: usize = 3;

/// Cache occupancy and hit rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

struct StoreState {
    indexes: HashMap<RecordType, TypeIndex>,
    locations: HashMap<String, RecordType>,
    cache: RecordCache,
    needs_rebuild: HashSet<RecordType>,
    /// Bumped on every index mutation
    generation: u64,
}

impl StoreState {
    fn install(&mut self, record_type: RecordType, index: TypeIndex) {
        if let Some(old) = self.indexes.get(&record_type) {
            for id in &old.ids {
                self.locations.remove(id);
            }
        }
        for id in &index.ids {
            self.locations.insert(id.clone(), record_type);
        }
        self.indexes.insert(record_type, index);
        self.needs_rebuild.remove(&record_type);
        self.generation += 1;
    }
}

struct StoreInner {
    root: PathBuf,
    state: Mutex<StoreState>,
}

/// Shared handle to the memory store; clones share state
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Open with default cache settings
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let defaults = MemoryConfig::default();
        Self::open_with(
            root,
            defaults.cache_capacity,
            Duration::from_secs(defaults.cache_ttl_secs),
        )
        .await
    }

    /// Open using the `[memory]` section, resolving `root` against `repo_root`
    pub async fn from_config(config: &MemoryConfig, repo_root: &Path) -> Result<Self> {
        let root = if config.root.is_absolute() {
            config.root.clone()
        } else {
            repo_root.join(&config.root)
        };
        Self::open_with(
            root,
            config.cache_capacity,
            Duration::from_secs(config.cache_ttl_secs),
        )
        .await
    }

    /// Open the store, validating every index against the record files
    ///
    /// An index whose entry count disagrees with the records on disk is
    /// rebuilt by scanning. A rebuild that fails is retried on next access.
    pub async fn open_with(
        root: impl Into<PathBuf>,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Result<Self> {
        let root = root.into();
        for record_type in RecordType::ALL {
            tokio::fs::create_dir_all(root.join(record_type.as_str())).await?;
        }
        tokio::fs::create_dir_all(root.join("index")).await?;

        let store = Self {
            inner: Arc::new(StoreInner {
                root,
                state: Mutex::new(StoreState {
                    indexes: HashMap::new(),
                    locations: HashMap::new(),
                    cache: RecordCache::new(cache_capacity, cache_ttl),
                    needs_rebuild: HashSet::new(),
                    generation: 0,
                }),
            }),
        };

        for record_type in RecordType::ALL {
            store.load_or_rebuild(record_type).await;
        }

        info!(
            "Opened memory store at {:?} ({} records)",
            store.inner.root,
            store.total_len()
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn type_dir(&self, record_type: RecordType) -> PathBuf {
        self.inner.root.join(record_type.as_str())
    }

    fn record_path(&self, record_type: RecordType, id: &str) -> PathBuf {
        self.type_dir(record_type).join(format!("{}.json", id))
    }

    async fn load_or_rebuild(&self, record_type: RecordType) {
        let on_disk = match count_record_files(&self.type_dir(record_type)).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Cannot list {} records: {}", record_type, e);
                self.state().needs_rebuild.insert(record_type);
                return;
            }
        };

        let path = index_path(&self.inner.root, record_type);
        match read_index(&path).await {
            Ok(index) if index.len() == on_disk && index.tags.is_some() => {
                debug!("Loaded {} index ({} records)", record_type, on_disk);
                self.state().install(record_type, index);
                return;
            }
            Ok(index) if index.len() == on_disk => {
                warn!("{} index has no tag map, rebuilding", record_type)
            }
            Ok(index) => warn!(
                "{} index lists {} records but {} are on disk, rebuilding",
                record_type,
                index.len(),
                on_disk
            ),
            Err(WeftError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound && on_disk == 0 => {
                self.state().install(record_type, TypeIndex::default());
                return;
            }
            Err(e) => warn!("{} index unusable ({}), rebuilding", record_type, e),
        }

        if let Err(e) = self.rebuild_index(record_type).await {
            warn!(
                "Rebuilding {} index failed, will retry on next access: {}",
                record_type, e
            );
            self.state().needs_rebuild.insert(record_type);
        }
    }

    /// Retry a rebuild that failed earlier
    async fn ensure_index(&self, record_type: RecordType) {
        let pending = self.state().needs_rebuild.contains(&record_type);
        if pending {
            if let Err(e) = self.rebuild_index(record_type).await {
                warn!("{} index still unavailable: {}", record_type, e);
            }
        }
    }

    /// Discard the index for `record_type` and rebuild it from the record files
    ///
    /// Unparseable record files are renamed to `<name>.corrupt` and left out.
    /// Returns the number of indexed records.
    pub async fn rebuild_index(&self, record_type: RecordType) -> Result<usize> {
        let dir = self.type_dir(record_type);

        for attempt in 1..=REBUILD_ATTEMPTS {
            let started_at = self.state().generation;
            let mut records = scan_records(&dir).await?;
            let index = TypeIndex::from_records(&mut records);

            let (snapshot, generation) = {
                let mut state = self.state();
                // A save landed mid-scan; scan again so it is not dropped
                if state.generation != started_at && attempt < REBUILD_ATTEMPTS {
                    continue;
                }
                state.install(record_type, index);
                (state.indexes[&record_type].clone(), state.generation)
            };

            let path = index_path(&self.inner.root, record_type);
            if let Err(e) = write_index(&path, &snapshot, generation).await {
                warn!("Failed to persist rebuilt {} index: {}", record_type, e);
            }
            info!(
                "Rebuilt {} index from {} records",
                record_type,
                snapshot.len()
            );
            return Ok(snapshot.len());
        }

        Err(WeftError::IndexCorruption(format!(
            "{} index kept changing during rebuild",
            record_type
        )))
    }

    /// Persist `record` and index it
    ///
    /// Fails with `MemoryWrite` if the record file cannot be written, in
    /// which case the index and cache are untouched.
    pub async fn save(&self, record: MemoryRecord) -> Result<String> {
        validate_id(&record.id)?;
        let record_type = record.record_type;
        self.ensure_index(record_type).await;

        let path = self.record_path(record_type, &record.id);
        write_record(&path, &record)
            .await
            .map_err(|e| WeftError::MemoryWrite(format!("{}: {}", path.display(), e)))?;

        let id = record.id.clone();
        let (snapshot, generation) = {
            let mut state = self.state();
            let index = state.indexes.entry(record_type).or_default();
            index.insert(&record);
            let snapshot = index.clone();
            state.locations.insert(id.clone(), record_type);
            state.cache.purge_expired();
            state.cache.put(record);
            state.generation += 1;
            (snapshot, state.generation)
        };

        // A stale rewrite here is caught by the count check on next open
        let path = index_path(&self.inner.root, record_type);
        if let Err(e) = write_index(&path, &snapshot, generation).await {
            warn!("Failed to rewrite {} index (fail-open): {}", record_type, e);
        }

        debug!("Saved {} record {}", record_type, id);
        Ok(id)
    }

    /// Fetch a record of known type, cache first
    pub(crate) async fn load(&self, record_type: RecordType, id: &str) -> Result<MemoryRecord> {
        let cached = self.state().cache.get(id);
        if let Some(record) = cached {
            return Ok(record);
        }

        let path = self.record_path(record_type, id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WeftError::RecordNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let record: MemoryRecord = serde_json::from_str(&content)?;
        self.state().cache.put(record.clone());
        Ok(record)
    }

    /// Fetch a record by id
    pub async fn get(&self, id: &str) -> Result<MemoryRecord> {
        let record_type = self.state().locations.get(id).copied();
        match record_type {
            Some(record_type) => self.load(record_type, id).await,
            None => Err(WeftError::RecordNotFound(id.to_string())),
        }
    }

    /// Lazy query over one record type
    pub async fn query(&self, record_type: RecordType, filter: RecordFilter) -> RecordQuery {
        self.ensure_index(record_type).await;

        let ids = {
            let state = self.state();
            match state.indexes.get(&record_type) {
                None => Vec::new(),
                Some(index) => match &filter.id {
                    Some(id) => index.ids.iter().filter(|i| *i == id).cloned().collect(),
                    None => index
                        .ids_with_tags(&filter.tags)
                        .unwrap_or_else(|| index.ids.clone()),
                },
            }
        };

        RecordQuery::new(self.clone(), record_type, filter, ids)
    }

    /// Record count per type
    pub fn counts(&self) -> BTreeMap<RecordType, usize> {
        let state = self.state();
        RecordType::ALL
            .iter()
            .map(|t| (*t, state.indexes.get(t).map_or(0, TypeIndex::len)))
            .collect()
    }

    /// Record count per category within one type
    pub fn category_counts(&self, record_type: RecordType) -> BTreeMap<String, usize> {
        self.state()
            .indexes
            .get(&record_type)
            .map(|index| index.counts.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, record_type: RecordType) -> usize {
        self.state()
            .indexes
            .get(&record_type)
            .map_or(0, TypeIndex::len)
    }

    pub fn total_len(&self) -> usize {
        self.state().locations.len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let state = self.state();
        let (hits, misses) = state.cache.hit_stats();
        CacheStats {
            len: state.cache.len(),
            capacity: state.cache.capacity(),
            hits,
            misses,
        }
    }

    /// Whether an index is waiting for a lazy rebuild
    pub fn needs_rebuild(&self, record_type: RecordType) -> bool {
        self.state().needs_rebuild.contains(&record_type)
    }
}

/// Ids become file names
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(WeftError::MemoryWrite(format!("invalid record id: {:?}", id)))
    }
}

fn is_record_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    !hidden && path.extension().is_some_and(|e| e == "json")
}

/// Durable write: temp file, fsync, rename. Existing records are never replaced.
async fn write_record(path: &Path, record: &MemoryRecord) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        return Err(WeftError::MemoryWrite(format!(
            "record {} already exists",
            record.id
        )));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_file_name(format!(".{}.tmp", record.filename()));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&serde_json::to_vec_pretty(record)?).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn count_record_files(dir: &Path) -> Result<usize> {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if is_record_file(&entry.path()) {
            count += 1;
        }
    }
    Ok(count)
}

async fn scan_records(dir: &Path) -> Result<Vec<MemoryRecord>> {
    let mut records = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_record_file(&path) {
            continue;
        }

        let content = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str::<MemoryRecord>(&content) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("Quarantining unreadable record {:?}: {}", path, e);
                let quarantined = path.with_extension("json.corrupt");
                tokio::fs::rename(&path, &quarantined).await?;
            }
        }
    }

    Ok(records)
}
