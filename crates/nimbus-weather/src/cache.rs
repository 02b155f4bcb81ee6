//! Disk-backed TTL cache for weather icon images.
//!
//! One file per key inside a dedicated directory. An entry's age is taken
//! from its file modification time; entries older than the TTL are treated
//! as absent and removed lazily on `load` or by `sweep_expired`, which runs
//! once on construction.
//!
//! Writes go to a hidden temp file that is renamed over the entry, so a
//! concurrent `load` sees either the old blob or the new one. Temp files left
//! by an interrupted write are reclaimed by the sweep once they are older
//! than a short grace period. Operations on
//! the same key are serialized through a small set of striped locks;
//! different keys proceed in parallel. Every filesystem failure is logged
//! and absorbed: the cache degrades to a miss.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

/// Default time-to-live for cached icons.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const LOCK_STRIPES: usize = 16;
const TEMP_PREFIX: &str = ".tmp-";
/// A temp file older than this was abandoned by an interrupted write.
const TEMP_GRACE: Duration = Duration::from_secs(10 * 60);

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// TTL blob cache addressed by opaque string keys (icon identifiers).
#[derive(Debug)]
pub struct IconCache {
    dir: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    stripes: Vec<Mutex<()>>,
}

impl IconCache {
    /// Open the cache in `dir`, creating it if needed, and sweep expired entries.
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self::with_clock(dir, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!("Failed to create icon cache dir {}: {}", dir.display(), e);
        }

        let cache = Self {
            dir,
            ttl,
            clock,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        };
        let evicted = cache.sweep_expired();
        tracing::debug!(
            "Icon cache ready at {} ({} expired entries evicted)",
            cache.dir.display(),
            evicted
        );
        cache
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `bytes` under `key`, replacing any existing entry. Best-effort.
    pub fn save(&self, key: &str, bytes: &[u8]) {
        let Some(path) = self.entry_path(key) else {
            return;
        };
        let _guard = self.stripe(key);

        if let Err(e) = self.write_atomic(&path, bytes) {
            tracing::warn!("Failed to cache icon {}: {}", key, e);
        }
    }

    /// Return the blob for `key` if present and not older than the TTL.
    ///
    /// An expired entry is deleted before returning `None`.
    pub fn load(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(key)?;
        let _guard = self.stripe(key);

        let metadata = fs::metadata(&path).ok()?;
        if self.is_expired(&metadata) {
            tracing::debug!("Icon {} expired, evicting", key);
            remove_quietly(&path);
            return None;
        }

        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Failed to read cached icon {}: {}", key, e);
                None
            }
        }
    }

    /// Delete the entry for `key`. Missing entries are fine.
    pub fn remove(&self, key: &str) {
        let Some(path) = self.entry_path(key) else {
            return;
        };
        let _guard = self.stripe(key);
        remove_quietly(&path);
    }

    /// Delete every entry regardless of age. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for (key, path, _) in self.entries() {
            let _guard = self.stripe(&key);
            if remove_quietly(&path) {
                removed += 1;
            }
        }
        tracing::info!("Icon cache cleared ({} entries)", removed);
        removed
    }

    /// Delete every expired entry and any temp file left behind by an
    /// interrupted write. Returns how many files were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut evicted = self.reclaim_abandoned_temps();
        for (key, path, _) in self.entries() {
            let _guard = self.stripe(&key);
            // Re-check under the lock: a save may have refreshed it.
            let expired = fs::metadata(&path)
                .map(|m| self.is_expired(&m))
                .unwrap_or(false);
            if expired && remove_quietly(&path) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Sum of on-disk sizes of all entries, expired or not.
    pub fn total_size(&self) -> u64 {
        self.entries().iter().map(|(_, _, m)| m.len()).sum()
    }

    /// Number of entries on disk, expired or not.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        if !is_valid_key(key) {
            tracing::warn!("Rejected icon cache key {:?}", key);
            return None;
        }
        Some(self.dir.join(key))
    }

    fn stripe(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[idx].lock()
    }

    fn is_expired(&self, metadata: &fs::Metadata) -> bool {
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        // A modification time in the future counts as fresh.
        let age = self
            .clock
            .now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        age > self.ttl
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let temp = self.dir.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        let result =
            write_stamped(&temp, bytes, self.clock.now()).and_then(|()| fs::rename(&temp, path));

        if result.is_err() {
            remove_quietly(&temp);
        }
        result
    }

    /// Remove temp files older than [`TEMP_GRACE`]. Fresher ones may belong
    /// to a save in progress and are left alone.
    fn reclaim_abandoned_temps(&self) -> usize {
        let now = self.clock.now();
        let mut reclaimed = 0;
        for (name, path, metadata) in self.files(|name| name.starts_with(TEMP_PREFIX)) {
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age > TEMP_GRACE && remove_quietly(&path) {
                tracing::debug!("Reclaimed abandoned cache temp file {}", name);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Regular files in the cache dir whose names are valid keys.
    fn entries(&self) -> Vec<(String, PathBuf, fs::Metadata)> {
        self.files(is_valid_key)
    }

    /// Regular files in the cache dir whose names pass `accept`.
    fn files(&self, accept: impl Fn(&str) -> bool) -> Vec<(String, PathBuf, fs::Metadata)> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::warn!("Failed to list icon cache {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        read_dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                if !accept(&name) {
                    return None;
                }
                let metadata = entry.metadata().ok()?;
                metadata
                    .is_file()
                    .then(|| (name, entry.path(), metadata))
            })
            .collect()
    }
}

/// Keys map directly to file names, so they must be a single plain component.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && !key.contains(['/', '\\'])
        && !key.contains("..")
        && !key.contains('\0')
}

/// Write `bytes` to a new file whose modification time is `modified`.
fn write_stamped(path: &Path, bytes: &[u8], modified: SystemTime) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.set_modified(modified)
}

/// Remove a file, logging anything but "not found". Returns whether a file was removed.
fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}
