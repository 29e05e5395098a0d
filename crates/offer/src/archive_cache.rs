//! Disk cache of archives staged back from tape.
//!
//! Layout is `{cache}/{file_bucket_id}/{tar_id}`. Space is accounted in
//! memory: a drive worker reserves room before reading a TAR, then either
//! moves the read file in or cancels. When room is short the least recently
//! used archives are evicted, except those an access request still relies on.

use crate::error::{OfferError, OfferResult};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    file_bucket_id: String,
    tar_id: String,
}

impl CacheKey {
    fn new(file_bucket_id: &str, tar_id: &str) -> Self {
        Self {
            file_bucket_id: file_bucket_id.to_string(),
            tar_id: tar_id.to_string(),
        }
    }
}

#[derive(Debug)]
struct CachedArchive {
    size: u64,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    archives: HashMap<CacheKey, CachedArchive>,
    reservations: HashMap<CacheKey, u64>,
    used: u64,
    reserved: u64,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Archive cache with LRU eviction.
pub struct ArchiveCache {
    root: PathBuf,
    capacity: u64,
    state: Mutex<CacheState>,
}

impl ArchiveCache {
    /// Open the cache directory, indexing archives left by a previous run.
    ///
    /// Older files (by modification time) are considered least recently used.
    /// Leftover temporary files are removed.
    pub fn open(root: impl Into<PathBuf>, capacity: u64) -> OfferResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let mut found = Vec::new();
        for bucket_dir in std::fs::read_dir(&root)? {
            let bucket_dir = bucket_dir?;
            if !bucket_dir.file_type()?.is_dir() {
                continue;
            }
            let file_bucket_id = bucket_dir.file_name().to_string_lossy().into_owned();
            for file in std::fs::read_dir(bucket_dir.path())? {
                let file = file?;
                let name = file.file_name().to_string_lossy().into_owned();
                if name.contains(".tmp.") {
                    std::fs::remove_file(file.path())?;
                    continue;
                }
                let metadata = file.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                let key = CacheKey::new(&file_bucket_id, &name);
                found.push((metadata.modified()?, key, metadata.len()));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut state = CacheState::default();
        for (_, key, size) in found {
            let last_access = state.tick();
            state.used += size;
            state.archives.insert(key, CachedArchive { size, last_access });
        }
        info!(
            path = %root.display(),
            archives = state.archives.len(),
            used = state.used,
            capacity,
            "Archive cache opened"
        );
        Ok(Self {
            root,
            capacity,
            state: Mutex::new(state),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held plus bytes reserved.
    pub fn used(&self) -> u64 {
        let state = self.lock();
        state.used + state.reserved
    }

    pub fn archive_path(&self, file_bucket_id: &str, tar_id: &str) -> PathBuf {
        self.root.join(file_bucket_id).join(tar_id)
    }

    pub fn contains(&self, file_bucket_id: &str, tar_id: &str) -> bool {
        self.lock()
            .archives
            .contains_key(&CacheKey::new(file_bucket_id, tar_id))
    }

    /// Path of a cached archive, marking it as recently used.
    ///
    /// The caller should open the file right away: an evicted archive stays
    /// readable through handles opened before its removal.
    pub fn try_read(&self, file_bucket_id: &str, tar_id: &str) -> Option<PathBuf> {
        let mut state = self.lock();
        let clock = state.tick();
        let archive = state
            .archives
            .get_mut(&CacheKey::new(file_bucket_id, tar_id))?;
        archive.last_access = clock;
        Some(self.archive_path(file_bucket_id, tar_id))
    }

    /// Reserve `size` bytes for an archive about to be moved in.
    ///
    /// Evicts least recently used archives not in `locked` until the
    /// reservation fits; fails with [`OfferError::CacheFull`] otherwise.
    pub fn reserve(
        &self,
        file_bucket_id: &str,
        tar_id: &str,
        size: u64,
        locked: &HashSet<String>,
    ) -> OfferResult<()> {
        let key = CacheKey::new(file_bucket_id, tar_id);
        let mut state = self.lock();
        if state.archives.contains_key(&key) || state.reservations.contains_key(&key) {
            return Err(OfferError::InvalidArgument(format!(
                "archive {tar_id} is already cached or reserved"
            )));
        }
        if size > self.capacity {
            return Err(OfferError::CacheFull(size));
        }

        while state.used + state.reserved + size > self.capacity {
            let victim = state
                .archives
                .iter()
                .filter(|(k, _)| !locked.contains(&k.tar_id))
                .min_by_key(|(_, a)| a.last_access)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                return Err(OfferError::CacheFull(size));
            };
            self.evict(&mut state, &victim)?;
        }

        state.reserved += size;
        state.reservations.insert(key, size);
        Ok(())
    }

    fn evict(&self, state: &mut CacheState, key: &CacheKey) -> OfferResult<()> {
        let path = self.archive_path(&key.file_bucket_id, &key.tar_id);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        if let Some(archive) = state.archives.remove(key) {
            state.used -= archive.size;
            debug!(tar_id = %key.tar_id, size = archive.size, "Evicted archive from cache");
        }
        Ok(())
    }

    /// Move a fully read archive into the cache under its reservation.
    pub fn move_to_cache(
        &self,
        source: &Path,
        file_bucket_id: &str,
        tar_id: &str,
    ) -> OfferResult<PathBuf> {
        let key = CacheKey::new(file_bucket_id, tar_id);
        let target = self.archive_path(file_bucket_id, tar_id);
        let mut state = self.lock();
        let Some(reserved) = state.reservations.get(&key).copied() else {
            return Err(OfferError::InvalidArgument(format!(
                "no cache reservation for archive {tar_id}"
            )));
        };

        let size = std::fs::metadata(source)?.len();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        move_file(source, &target)?;

        state.reservations.remove(&key);
        state.reserved -= reserved;
        state.used += size;
        let last_access = state.tick();
        state.archives.insert(key, CachedArchive { size, last_access });
        if size > reserved {
            warn!(tar_id, size, reserved, "Cached archive is larger than its reservation");
        }
        Ok(target)
    }

    /// Drop a reservation that will not be used.
    pub fn cancel(&self, file_bucket_id: &str, tar_id: &str) {
        let mut state = self.lock();
        if let Some(size) = state.reservations.remove(&CacheKey::new(file_bucket_id, tar_id)) {
            state.reserved -= size;
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Rename, or copy then remove when `source` is on another filesystem.
fn move_file(source: &Path, target: &Path) -> std::io::Result<()> {
    match std::fs::rename(source, target) {
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            let temp = tapevault_storage::persist::temp_path_for(target);
            std::fs::copy(source, &temp)?;
            std::fs::File::open(&temp)?.sync_all()?;
            std::fs::rename(&temp, target)?;
            std::fs::remove_file(source)
        }
        other => other,
    }
}
