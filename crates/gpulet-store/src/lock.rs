//! Cooperative queue locking
//!
//! A lock on a named resource is a marker tagged with the holder's suffix. To
//! acquire, a holder waits until no marker exists, creates its own, then lists
//! the markers again: if its marker is the only one it holds the lock, otherwise
//! it lost a race, removes its marker and starts over.
//!
//! This emulates compare-and-swap on top of create/list/delete. It is advisory:
//! it only protects a resource whose every writer goes through
//! [`LockCoordinator`], and a filesystem store gives no guarantees on network
//! filesystems with stale directory caches.

use async_trait::async_trait;
use gpulet_core::{GpuletError, GpuletResult};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backing store for lock markers
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Suffixes of all markers currently present for `resource`
    async fn markers(&self, resource: &str) -> GpuletResult<Vec<String>>;

    /// Create the marker `suffix` for `resource`
    async fn create(&self, resource: &str, suffix: &str) -> GpuletResult<()>;

    /// Delete the marker `suffix` for `resource`; a missing marker is not an error
    async fn remove(&self, resource: &str, suffix: &str) -> GpuletResult<()>;
}

/// Markers are zero-byte files named `{resource}.lock_{suffix}` next to the
/// resource; listing the directory is the only collision check.
#[derive(Debug, Default, Clone)]
pub struct FsLockStore;

impl FsLockStore {
    pub fn new() -> Self {
        Self
    }

    /// Path of the marker file for `resource` and `suffix`
    pub fn marker_path(resource: &str, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}.lock_{}", resource, suffix))
    }

    fn split(resource: &str) -> GpuletResult<(PathBuf, String)> {
        let path = Path::new(resource);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| GpuletError::Config(format!("invalid lock resource: {}", resource)))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((dir, format!("{}.lock_", name)))
    }
}

#[async_trait]
impl LockStore for FsLockStore {
    async fn markers(&self, resource: &str) -> GpuletResult<Vec<String>> {
        let (dir, prefix) = Self::split(resource)?;
        let mut found = Vec::new();

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix(&prefix) {
                found.push(suffix.to_string());
            }
        }

        Ok(found)
    }

    async fn create(&self, resource: &str, suffix: &str) -> GpuletResult<()> {
        tokio::fs::File::create(Self::marker_path(resource, suffix)).await?;
        Ok(())
    }

    async fn remove(&self, resource: &str, suffix: &str) -> GpuletResult<()> {
        match tokio::fs::remove_file(Self::marker_path(resource, suffix)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process marker store for single-binary deployments and tests
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    markers: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_markers<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<String>>) -> T) -> GpuletResult<T> {
        let mut markers = self
            .markers
            .lock()
            .map_err(|_| GpuletError::Internal("lock store mutex poisoned".to_string()))?;
        Ok(f(&mut markers))
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn markers(&self, resource: &str) -> GpuletResult<Vec<String>> {
        self.with_markers(|m| m.get(resource).cloned().unwrap_or_default())
    }

    async fn create(&self, resource: &str, suffix: &str) -> GpuletResult<()> {
        self.with_markers(|m| {
            m.entry(resource.to_string())
                .or_default()
                .push(suffix.to_string())
        })
    }

    async fn remove(&self, resource: &str, suffix: &str) -> GpuletResult<()> {
        self.with_markers(|m| {
            if let Some(list) = m.get_mut(resource) {
                list.retain(|s| s != suffix);
                if list.is_empty() {
                    m.remove(resource);
                }
            }
        })
    }
}

/// Holder suffix unique to this process and call
pub fn random_suffix() -> String {
    format!("{}-{:08x}", std::process::id(), rand::thread_rng().gen::<u32>())
}

/// Grants exclusive access to named resources and remembers what it holds so
/// that everything can be released on shutdown.
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    poll_interval: Duration,
    held: Mutex<HashSet<(String, String)>>,
}

impl LockCoordinator {
    /// Create a coordinator over `store`, polling every `poll_interval` while waiting
    pub fn new(store: Arc<dyn LockStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Filesystem-backed coordinator
    pub fn filesystem(poll_interval: Duration) -> Self {
        Self::new(Arc::new(FsLockStore::new()), poll_interval)
    }

    /// Wait until `resource` is free and take it.
    ///
    /// Returns the holder suffix to pass to [`release`](Self::release).
    pub async fn acquire(&self, resource: &str, suffix: Option<&str>) -> GpuletResult<String> {
        let suffix = suffix.map(str::to_string).unwrap_or_else(random_suffix);

        loop {
            while !self.store.markers(resource).await?.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }

            // Tracked before the marker exists so a shutdown mid-acquire still removes it.
            self.track(resource, &suffix, true);
            if let Err(e) = self.store.create(resource, &suffix).await {
                self.track(resource, &suffix, false);
                return Err(e);
            }

            match self.check_sole_holder(resource, &suffix).await {
                Ok(()) => {
                    debug!(resource, suffix = %suffix, "Lock acquired");
                    return Ok(suffix);
                }
                Err(GpuletError::LockRace(detail)) => {
                    debug!(resource, suffix = %suffix, %detail, "Lost lock race, retrying");
                    self.store.remove(resource, &suffix).await?;
                    self.track(resource, &suffix, false);
                    tokio::time::sleep(self.backoff()).await;
                }
                Err(e) => {
                    let _ = self.store.remove(resource, &suffix).await;
                    self.track(resource, &suffix, false);
                    return Err(e);
                }
            }
        }
    }

    /// Give up `resource`. Releasing a lock that is not held is a no-op.
    pub async fn release(&self, resource: &str, suffix: &str) -> GpuletResult<()> {
        self.store.remove(resource, suffix).await?;
        self.track(resource, suffix, false);
        debug!(resource, suffix, "Lock released");
        Ok(())
    }

    /// Release every lock this coordinator still holds
    pub async fn release_all(&self) {
        let held: Vec<(String, String)> = match self.held.lock() {
            Ok(held) => held.iter().cloned().collect(),
            Err(_) => return,
        };

        for (resource, suffix) in held {
            match self.release(&resource, &suffix).await {
                Ok(()) => info!(resource = %resource, suffix = %suffix, "Released lock on shutdown"),
                Err(e) => warn!(resource = %resource, error = %e, "Failed to release lock on shutdown"),
            }
        }
    }

    /// Number of locks currently held
    pub fn held_count(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Suffixes of the markers present on `resource`, whoever holds them
    pub async fn markers(&self, resource: &str) -> GpuletResult<Vec<String>> {
        self.store.markers(resource).await
    }

    async fn check_sole_holder(&self, resource: &str, suffix: &str) -> GpuletResult<()> {
        let markers = self.store.markers(resource).await?;
        if markers.len() == 1 && markers[0] == suffix {
            Ok(())
        } else {
            Err(GpuletError::LockRace(format!(
                "{} has markers {:?}",
                resource, markers
            )))
        }
    }

    fn track(&self, resource: &str, suffix: &str, held: bool) {
        if let Ok(mut set) = self.held.lock() {
            let key = (resource.to_string(), suffix.to_string());
            if held {
                set.insert(key);
            } else {
                set.remove(&key);
            }
        }
    }

    /// Random pause after a lost race so racing holders fall out of step
    fn backoff(&self) -> Duration {
        let max = self.poll_interval.as_millis().max(1) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}
