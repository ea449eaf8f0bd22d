//! Write-through blob cache over the local filesystem.
//!
//! Blobs are addressed by `(namespace, name)` and live at
//! `<base>/<namespace>/<name>`. A `put` parks the content in memory and writes
//! it from a background task; reads are served from memory until the write has
//! landed. Each put carries a stamp, and a finished writer only publishes its
//! file and drops the in-memory copy if its stamp is still current for the key,
//! so a slow old write can never replace fresher content. `delete` cancels any
//! in-flight writer for the key.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("blob already exists: {namespace}/{name}")]
    AlreadyExists { namespace: String, name: String },
    #[error("file not found: {namespace}/{name}")]
    FileNotFound { namespace: String, name: String },
    #[error("invalid blob path: {0:?}")]
    InvalidName(String),
    #[error("blob write cancelled")]
    Cancelled,
    #[error("no async runtime available for the background write")]
    NoRuntime,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BlobKey {
    namespace: String,
    name: String,
}

impl BlobKey {
    fn not_found(&self) -> StorageError {
        StorageError::FileNotFound {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Content parked in memory while its write is in flight.
struct PendingBlob {
    stamp: u64,
    content: Arc<[u8]>,
    writer: AbortHandle,
}

struct StorageInner {
    base: PathBuf,
    pending: Mutex<HashMap<BlobKey, PendingBlob>>,
    stamps: AtomicU64,
}

/// Filesystem-backed blob store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FsStorage {
    inner: Arc<StorageInner>,
}

/// Handle to a background blob write. Drop it to let the write finish detached.
pub struct PendingWrite {
    handle: JoinHandle<Result<(), StorageError>>,
}

impl PendingWrite {
    /// Wait for the write to land (or be superseded by a newer put).
    pub async fn wait(self) -> Result<(), StorageError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(StorageError::Cancelled),
            Err(e) => Err(StorageError::Io(std::io::Error::other(e.to_string()))),
        }
    }
}

impl FsStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                base: base.into(),
                pending: Mutex::new(HashMap::new()),
                stamps: AtomicU64::new(0),
            }),
        }
    }

    pub fn base(&self) -> &Path {
        &self.inner.base
    }

    /// Store a blob and wait for it to reach disk.
    pub async fn put(
        &self,
        namespace: &str,
        name: &str,
        content: impl Into<Arc<[u8]>>,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        self.begin_put(namespace, name, content, overwrite)?.wait().await
    }

    /// Park a blob in memory and start writing it in the background.
    ///
    /// The content is readable through [`get`](Self::get) as soon as this
    /// returns. Fails with `AlreadyExists` when the blob exists (in memory or on
    /// disk) and `overwrite` is false. Must be called within a Tokio runtime.
    pub fn begin_put(
        &self,
        namespace: &str,
        name: &str,
        content: impl Into<Arc<[u8]>>,
        overwrite: bool,
    ) -> Result<PendingWrite, StorageError> {
        let (key, path) = self.resolve(namespace, name)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StorageError::NoRuntime)?;
        let content = content.into();

        let mut pending = self.pending();
        if !overwrite && (pending.contains_key(&key) || path.exists()) {
            return Err(StorageError::AlreadyExists {
                namespace: key.namespace,
                name: key.name,
            });
        }

        let stamp = self.inner.stamps.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = runtime.spawn(self.inner.clone().write_blob(
            key.clone(),
            stamp,
            path,
            content.clone(),
        ));

        if let Some(previous) = pending.insert(
            key.clone(),
            PendingBlob {
                stamp,
                content,
                writer: handle.abort_handle(),
            },
        ) {
            tracing::debug!(
                namespace = %key.namespace,
                name = %key.name,
                superseded = previous.stamp,
                stamp,
                "newer write queued over in-flight write"
            );
        }

        Ok(PendingWrite { handle })
    }

    /// Read a blob, preferring content still in flight.
    pub async fn get(&self, namespace: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        let (key, path) = self.resolve(namespace, name)?;
        if let Some(content) = self.buffered(&key) {
            return Ok(content);
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(key.not_found()),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking variant of [`get`](Self::get).
    pub fn get_sync(&self, namespace: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        let (key, path) = self.resolve(namespace, name)?;
        if let Some(content) = self.buffered(&key) {
            return Ok(content);
        }

        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(key.not_found()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the blob is readable (in memory or on disk).
    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        match self.resolve(namespace, name) {
            Ok((key, path)) => self.pending().contains_key(&key) || path.exists(),
            Err(_) => false,
        }
    }

    /// Number of blobs whose writes have not landed yet.
    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }

    /// Remove a blob, cancelling an in-flight write for it.
    ///
    /// Returns whether a file was removed from disk; an absent blob is not an error.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<bool, StorageError> {
        let (key, path) = self.resolve(namespace, name)?;

        let cancelled = self.pending().remove(&key);
        if let Some(blob) = cancelled {
            blob.writer.abort();
            let _ = tokio::fs::remove_file(temp_path(&path, blob.stamp)).await;
            tracing::debug!(namespace, name, stamp = blob.stamp, "cancelled in-flight blob write");
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "blob delete failed");
                Ok(false)
            }
        }
    }

    fn buffered(&self, key: &BlobKey) -> Option<Vec<u8>> {
        self.pending().get(key).map(|blob| blob.content.to_vec())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<BlobKey, PendingBlob>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, namespace: &str, name: &str) -> Result<(BlobKey, PathBuf), StorageError> {
        validate_namespace(namespace)?;
        validate_component(name, name)?;

        let path = self.inner.base.join(namespace).join(name);
        Ok((
            BlobKey {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            path,
        ))
    }
}

impl StorageInner {
    async fn write_blob(
        self: Arc<Self>,
        key: BlobKey,
        stamp: u64,
        path: PathBuf,
        content: Arc<[u8]>,
    ) -> Result<(), StorageError> {
        let tmp = temp_path(&path, stamp);

        let staged = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&tmp, &content).await
        }
        .await;

        if let Err(e) = staged {
            // Content stays parked in memory so in-process reads keep working.
            tracing::warn!(path = %path.display(), error = %e, "blob write failed");
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let published = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let current = pending.get(&key).map(|blob| blob.stamp) == Some(stamp);
            if current {
                let renamed = std::fs::rename(&tmp, &path);
                if renamed.is_ok() {
                    pending.remove(&key);
                }
                Some(renamed)
            } else {
                None
            }
        };

        match published {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "blob publish failed");
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
            None => {
                tracing::debug!(path = %path.display(), stamp, "blob write superseded");
                let _ = tokio::fs::remove_file(&tmp).await;
                Ok(())
            }
        }
    }
}

fn temp_path(path: &Path, stamp: u64) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{stamp}.tmp"));
    path.with_file_name(name)
}

fn validate_namespace(namespace: &str) -> Result<(), StorageError> {
    if namespace.is_empty() {
        return Err(StorageError::InvalidName(namespace.to_string()));
    }
    namespace
        .split('/')
        .try_for_each(|part| validate_component(part, namespace))
}

fn validate_component(part: &str, whole: &str) -> Result<(), StorageError> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !part.contains(|c: char| c == '/' || c == '\\') => Ok(()),
        _ => Err(StorageError::InvalidName(whole.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NS: &str = "test_path";

    fn storage() -> (TempDir, FsStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path().join("blobs"));
        (dir, storage)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_dir, storage) = storage();
        storage.put(NS, "subject01", b"face-a".to_vec(), false).await.unwrap();
        assert_eq!(storage.get(NS, "subject01").await.unwrap(), b"face-a");
        assert_eq!(storage.get_sync(NS, "subject01").unwrap(), b"face-a");
        assert_eq!(
            std::fs::read(storage.base().join(NS).join("subject01")).unwrap(),
            b"face-a"
        );
        assert_eq!(storage.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_put_existing_without_overwrite() {
        let (_dir, storage) = storage();
        storage.put(NS, "subject01", b"one".to_vec(), false).await.unwrap();
        let err = storage.put(NS, "subject01", b"two".to_vec(), false).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(storage.get(NS, "subject01").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let (_dir, storage) = storage();
        storage.put(NS, "subject01", b"one".to_vec(), false).await.unwrap();
        storage.put(NS, "subject01", b"two".to_vec(), true).await.unwrap();
        assert_eq!(storage.get(NS, "subject01").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_read_served_while_write_in_flight() {
        let (_dir, storage) = storage();
        let pending = storage.begin_put(NS, "subject01", b"fresh".to_vec(), false).unwrap();

        assert_eq!(storage.in_flight(), 1);
        assert_eq!(storage.get_sync(NS, "subject01").unwrap(), b"fresh");
        assert!(storage.contains(NS, "subject01"));

        pending.wait().await.unwrap();
        assert_eq!(storage.in_flight(), 0);
        assert_eq!(storage.get(NS, "subject01").await.unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_older_write_never_clobbers_newer() {
        let (_dir, storage) = storage();
        let old = storage.begin_put(NS, "subject01", b"old".to_vec(), true).unwrap();
        let new = storage.begin_put(NS, "subject01", b"new".to_vec(), true).unwrap();

        assert_eq!(storage.get_sync(NS, "subject01").unwrap(), b"new");

        // Finish in the "wrong" order.
        new.wait().await.unwrap();
        old.wait().await.unwrap();

        assert_eq!(storage.get(NS, "subject01").await.unwrap(), b"new");
        assert_eq!(
            std::fs::read(storage.base().join(NS).join("subject01")).unwrap(),
            b"new"
        );
        assert_eq!(storage.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_delete_then_get_fails() {
        let (_dir, storage) = storage();
        storage.put(NS, "subject01", b"bytes".to_vec(), false).await.unwrap();
        assert!(storage.delete(NS, "subject01").await.unwrap());

        let err = storage.get(NS, "subject01").await.unwrap_err();
        assert!(matches!(err, StorageError::FileNotFound { .. }));
        assert!(!storage.contains(NS, "subject01"));
    }

    #[tokio::test]
    async fn test_delete_missing_returns_false() {
        let (_dir, storage) = storage();
        assert!(!storage.delete(NS, "subject01").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_cancels_in_flight_write() {
        let (_dir, storage) = storage();
        let pending = storage.begin_put(NS, "subject01", b"doomed".to_vec(), false).unwrap();
        storage.delete(NS, "subject01").await.unwrap();

        // Either aborted before it ran, or ran and found itself superseded.
        match pending.wait().await {
            Ok(()) | Err(StorageError::Cancelled) => {}
            Err(e) => panic!("unexpected write result: {e}"),
        }
        assert!(storage.get(NS, "subject01").await.is_err());
        assert!(!storage.base().join(NS).join("subject01").exists());
    }

    #[tokio::test]
    async fn test_nested_namespace_and_existing_dirs() {
        let (_dir, storage) = storage();
        std::fs::create_dir_all(storage.base().join("a/b")).unwrap();
        storage.put("a/b", "blob", b"x".to_vec(), false).await.unwrap();
        assert!(storage.base().join("a/b/blob").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let (_dir, storage) = storage();
        for (ns, name) in [("..", "x"), (NS, "../x"), (NS, ""), ("a//b", "x"), (NS, "a/b")] {
            let err = storage.put(ns, name, b"x".to_vec(), true).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidName(_)), "{ns}/{name}");
        }
    }

    #[test]
    fn test_begin_put_requires_runtime() {
        let (_dir, storage) = storage();
        let err = storage.begin_put(NS, "x", b"x".to_vec(), true).err().unwrap();
        assert!(matches!(err, StorageError::NoRuntime));
    }
}
