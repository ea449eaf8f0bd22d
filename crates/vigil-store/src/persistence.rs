//! JSON snapshot persistence around a [`MapContainer`].
//!
//! Every successful mutation serializes the whole entry set and hands it to a
//! background task that writes it to the backing file. The in-memory container
//! stays authoritative for the running process; write failures are logged and
//! otherwise ignored. On open, the snapshot is loaded back; a missing or
//! unreadable file means "start empty".
//!
//! Snapshot layout:
//!
//! ```text
//! { "<entry_id>": { "value": <entry JSON>, "updated_at": <ms since epoch> }, ... }
//! ```

use crate::container::{ContainerError, DestroyHook, Entry, MapContainer};
use crate::lock::{LockCoordinator, LockError, LockKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotItem {
    value: serde_json::Value,
    updated_at: i64,
}

/// A serialized entry set, tagged with the generation it was taken at.
struct Snapshot {
    generation: u64,
    bytes: Vec<u8>,
}

struct Inner<E> {
    container: Mutex<MapContainer<E>>,
    coordinator: Arc<LockCoordinator>,
    path: PathBuf,
    generation: AtomicU64,
    /// Generation of the last snapshot that reached disk.
    written: tokio::sync::Mutex<u64>,
}

/// A container whose contents survive restarts via a JSON snapshot file.
pub struct JsonFilePersistence<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for JsonFilePersistence<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> JsonFilePersistence<E>
where
    E: Entry + Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Wrap `container` (expected empty) and fill it from the snapshot at `path`.
    pub fn open(path: impl Into<PathBuf>, mut container: MapContainer<E>) -> Self {
        let path = path.into();
        let loaded = load_snapshot(&path, &mut container);
        container.check_max_size();
        tracing::info!(
            path = %path.display(),
            loaded,
            kept = container.len(),
            "opened snapshot store"
        );

        let coordinator = container.coordinator().clone();
        Self {
            inner: Arc::new(Inner {
                container: Mutex::new(container),
                coordinator,
                path,
                generation: AtomicU64::new(0),
                written: tokio::sync::Mutex::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub async fn lock(&self) -> LockKey {
        self.inner.coordinator.lock().await
    }

    pub fn unlock(&self, key: LockKey) -> Result<(), LockError> {
        self.inner.coordinator.unlock(key)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.coordinator.is_locked()
    }

    pub fn set_on_destroy(&self, hook: DestroyHook<E>) {
        self.container().set_on_destroy(hook);
    }

    pub fn add(&self, entry: E, key: Option<LockKey>) -> Result<String, ContainerError> {
        self.mutate(|c| c.add(entry, key))
    }

    pub fn update(&self, entry_id: &str, entry: E, key: Option<LockKey>) -> Result<(), ContainerError> {
        self.mutate(|c| c.update(entry_id, entry, key))
    }

    pub fn add_or_update(&self, entry: E, key: Option<LockKey>) -> Result<String, ContainerError> {
        self.mutate(|c| c.add_or_update(entry, key))
    }

    pub fn update_with<R>(
        &self,
        entry_id: &str,
        key: Option<LockKey>,
        f: impl FnOnce(&mut E) -> R,
    ) -> Result<R, ContainerError> {
        self.mutate(|c| c.update_with(entry_id, key, f))
    }

    pub fn remove(&self, entry_id: &str, key: Option<LockKey>) -> Result<E, ContainerError> {
        self.mutate(|c| c.remove(entry_id, key))
    }

    pub fn has(&self, entry_id: &str) -> bool {
        self.container().has(entry_id)
    }

    pub fn get(&self, entry_id: &str) -> Result<E, ContainerError> {
        self.container().get(entry_id).cloned()
    }

    pub fn get_all(&self) -> Vec<E> {
        self.container().get_all().into_iter().cloned().collect()
    }

    pub fn get_all_sorted(&self) -> Vec<E> {
        self.container().get_all_sorted().into_iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.container().len()
    }

    pub fn is_empty(&self) -> bool {
        self.container().is_empty()
    }

    /// Schedule a background write of the current state.
    pub fn persist(&self) {
        let Some(snapshot) = self.snapshot(&self.container()) else {
            return;
        };
        self.spawn_write(snapshot);
    }

    /// Write the current state and wait for it to land.
    ///
    /// Best effort like every other write: failures are logged, not returned.
    pub async fn flush(&self) {
        let Some(snapshot) = self.snapshot(&self.container()) else {
            return;
        };
        self.inner.write(snapshot).await;
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut MapContainer<E>) -> Result<R, ContainerError>,
    ) -> Result<R, ContainerError> {
        let (result, snapshot) = {
            let mut container = self.container();
            let result = f(&mut container)?;
            (result, self.snapshot(&container))
        };
        if let Some(snapshot) = snapshot {
            self.spawn_write(snapshot);
        }
        Ok(result)
    }

    fn snapshot(&self, container: &MapContainer<E>) -> Option<Snapshot> {
        let mut items = BTreeMap::new();
        for entry in container.get_all() {
            let (Some(entry_id), Some(updated_at)) = (entry.entry_id(), entry.updated_at()) else {
                continue;
            };
            match serde_json::to_value(entry) {
                Ok(value) => {
                    items.insert(entry_id.to_string(), SnapshotItem { value, updated_at });
                }
                Err(e) => {
                    tracing::warn!(entry = entry_id, error = %e, "entry not serializable; left out of snapshot");
                }
            }
        }

        match serde_json::to_vec(&items) {
            Ok(bytes) => Some(Snapshot {
                generation: self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1,
                bytes,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot serialization failed");
                None
            }
        }
    }

    fn spawn_write(&self, snapshot: Snapshot) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move { inner.write(snapshot).await });
            }
            Err(_) => {
                tracing::debug!(path = %self.inner.path.display(), "no async runtime; writing snapshot inline");
                if let Err(e) = write_blocking(&self.inner.path, &snapshot.bytes) {
                    tracing::warn!(path = %self.inner.path.display(), error = %e, "snapshot write failed");
                }
            }
        }
    }

    fn container(&self) -> MutexGuard<'_, MapContainer<E>> {
        self.inner.container.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> Inner<E> {
    /// Write a snapshot unless a newer one has already landed.
    async fn write(&self, snapshot: Snapshot) {
        let mut written = self.written.lock().await;
        if snapshot.generation <= *written {
            tracing::debug!(
                generation = snapshot.generation,
                written = *written,
                "skipping stale snapshot"
            );
            return;
        }

        match write_atomic(&self.path, &snapshot.bytes).await {
            Ok(()) => *written = snapshot.generation,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "snapshot write failed");
            }
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

fn write_blocking(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Fill `container` from the snapshot at `path`. Returns the number of entries loaded.
fn load_snapshot<E>(path: &Path, container: &mut MapContainer<E>) -> usize
where
    E: Entry + DeserializeOwned,
{
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no snapshot yet; starting empty");
            return 0;
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "snapshot unreadable; starting empty");
            return 0;
        }
    };

    let items: BTreeMap<String, SnapshotItem> = match serde_json::from_slice(&bytes) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "snapshot malformed; starting empty");
            return 0;
        }
    };

    let mut loaded = 0;
    for (entry_id, item) in items {
        match serde_json::from_value::<E>(item.value) {
            Ok(mut entry) => {
                let meta = entry.meta_mut();
                meta.entry_id = Some(entry_id);
                meta.updated_at = Some(item.updated_at);
                container.restore(entry);
                loaded += 1;
            }
            Err(e) => {
                tracing::warn!(entry = %entry_id, error = %e, "skipping unreadable snapshot entry");
            }
        }
    }
    loaded
}
