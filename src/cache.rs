//! Bounded, process-wide cache of raster operations.
//!
//! Two kinds of operation are cached: loading (decoding and orienting) a
//! source file, and producing a resized thumbnail of it. Both hold packed
//! pixel buffers. Entries are keyed by
//! the file's path, length and modification time, so a rewritten file misses.
//! The cache is bounded by entry count, tracked memory and the number of
//! cached source files; the least recently used entry goes first.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::conversion::PackedFrame;

/// Default maximum number of cached operations.
pub const DEFAULT_CACHE_MAX_OPERATIONS: usize = 100;
/// Default maximum tracked memory, in bytes.
pub const DEFAULT_CACHE_MAX_MEMORY: usize = 100 * 1024 * 1024;
/// Default maximum number of cached source files.
pub const DEFAULT_CACHE_MAX_FILES: usize = 100;

/// Size bounds of the raster cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Maximum number of cached operations.
    pub max_operations: usize,
    /// Maximum bytes held by cached images.
    pub max_memory: usize,
    /// Maximum number of distinct source files held.
    pub max_files: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_CACHE_MAX_OPERATIONS,
            max_memory: DEFAULT_CACHE_MAX_MEMORY,
            max_files: DEFAULT_CACHE_MAX_FILES,
        }
    }
}

/// Snapshot of the memory tracked by the raster engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryProfile {
    /// Bytes currently held by cached images.
    pub memory: usize,
    /// Largest value `memory` has reached.
    pub high_water: usize,
    /// Number of image buffers currently held.
    pub allocations: usize,
    /// Number of source files currently held.
    pub files: usize,
}

/// Identity of a source file's contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SourceKey {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

impl SourceKey {
    pub(crate) fn for_path(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum OperationKey {
    Load(SourceKey),
    Thumbnail { source: SourceKey, size: u32 },
}

impl OperationKey {
    fn is_file(&self) -> bool {
        matches!(self, OperationKey::Load(_))
    }
}

/// A cached upright pixel buffer plus the upright size and the embedded
/// orientation of its source.
#[derive(Debug, Clone)]
pub(crate) struct CachedImage {
    pub(crate) frame: Arc<PackedFrame>,
    pub(crate) source_width: u32,
    pub(crate) source_height: u32,
    pub(crate) orientation: u8,
}

struct Entry {
    value: CachedImage,
    bytes: usize,
    last_used: u64,
}

pub(crate) struct OperationCache {
    limits: CacheLimits,
    entries: HashMap<OperationKey, Entry>,
    tick: u64,
    memory: usize,
    high_water: usize,
    files: usize,
}

impl OperationCache {
    pub(crate) fn new(limits: CacheLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
            tick: 0,
            memory: 0,
            high_water: 0,
            files: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub(crate) fn get(&mut self, key: &OperationKey) -> Option<CachedImage> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    pub(crate) fn insert(&mut self, key: OperationKey, value: CachedImage) {
        let bytes = value.frame.data.len();
        if bytes > self.limits.max_memory || self.limits.max_operations == 0 {
            return;
        }
        if key.is_file() && self.limits.max_files == 0 {
            return;
        }
        let tick = self.next_tick();
        self.remove(&key);
        if key.is_file() {
            self.files += 1;
        }
        self.memory += bytes;
        self.high_water = self.high_water.max(self.memory);
        self.entries.insert(
            key,
            Entry {
                value,
                bytes,
                last_used: tick,
            },
        );
        self.evict();
    }

    fn remove(&mut self, key: &OperationKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.memory -= entry.bytes;
            if key.is_file() {
                self.files -= 1;
            }
        }
    }

    fn evict(&mut self) {
        loop {
            let files_over = self.files > self.limits.max_files;
            let over = files_over
                || self.entries.len() > self.limits.max_operations
                || self.memory > self.limits.max_memory;
            if !over {
                return;
            }
            let victim = self
                .entries
                .iter()
                .filter(|(key, _)| !files_over || key.is_file())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => self.remove(&key),
                None => return,
            }
        }
    }

    pub(crate) fn set_limits(&mut self, limits: CacheLimits) {
        self.limits = limits;
        self.evict();
    }

    pub(crate) fn limits(&self) -> CacheLimits {
        self.limits
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.memory = 0;
        self.files = 0;
    }

    pub(crate) fn profile(&self) -> MemoryProfile {
        MemoryProfile {
            memory: self.memory,
            high_water: self.high_water,
            allocations: self.entries.len(),
            files: self.files,
        }
    }
}

static CACHE: LazyLock<Mutex<OperationCache>> =
    LazyLock::new(|| Mutex::new(OperationCache::new(CacheLimits::default())));

pub(crate) fn global() -> MutexGuard<'static, OperationCache> {
    CACHE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
