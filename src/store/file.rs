//! File-backed key-value store
//!
//! The whole keyspace is cached in memory and persisted as one JSON object.
//! Each write renders a new snapshot, writes it to a temp file, renames it
//! over the old one and then publishes the new map to readers. A crash
//! mid-write leaves the previous snapshot intact.
//!
//! Writes run on the blocking pool and are serialized by a lock held for
//! the whole persist-then-publish sequence. Dropping the caller's future
//! (for example on a classification deadline) does not stop a write that
//! has started, so the file and the cache never diverge.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::KvBackend;
use crate::error::StoreError;

type Snapshot = BTreeMap<String, String>;

struct Shared {
    path: PathBuf,
    cache: RwLock<Arc<Snapshot>>,
    write_lock: Mutex<()>,
}

impl Shared {
    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.cache.read())
    }

    /// Apply `change` to a copy of the snapshot, persist it, then publish it
    fn apply<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Snapshot) -> bool,
    {
        let _guard = self.write_lock.lock();

        let mut next = (*self.current()).clone();
        if !change(&mut next) {
            return Ok(());
        }

        let bytes = serde_json::to_vec_pretty(&next).map_err(|e| StoreError::Corrupt {
            key: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;

        *self.cache.write() = Arc::new(next);
        Ok(())
    }
}

pub struct FileBackend {
    shared: Arc<Shared>,
}

impl FileBackend {
    /// Open (or create on first write) the snapshot at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Snapshot::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                key: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), entries = snapshot.len(), "Opened file store");
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                cache: RwLock::new(Arc::new(snapshot)),
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn current(&self) -> Arc<Snapshot> {
        self.shared.current()
    }

    /// Run a write to completion on the blocking pool
    async fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Snapshot) -> bool + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.apply(change))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store writer failed: {}", e)))?
    }
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.current().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let key = key.to_string();
        self.update(move |map| {
            map.insert(key, value);
            true
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.update(move |map| map.remove(&key).is_some()).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .current()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lists.json");

        let backend = FileBackend::open(&path).await.unwrap();
        backend.put("blacklist/1.2.3.4", "{}".to_string()).await.unwrap();
        backend.put("exemption/5.6.7.8", "{}".to_string()).await.unwrap();
        backend.delete("exemption/5.6.7.8").await.unwrap();
        drop(backend);

        let reopened = FileBackend::open(&path).await.unwrap();
        assert!(reopened.get("blacklist/1.2.3.4").await.unwrap().is_some());
        assert!(reopened.get("exemption/5.6.7.8").await.unwrap().is_none());
        assert_eq!(reopened.scan("blacklist/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path().join("absent.json")).await.unwrap();
        assert!(backend.scan("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lists.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(
            FileBackend::open(&path).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writes_all_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lists.json");
        let backend = Arc::new(FileBackend::open(&path).await.unwrap());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    backend
                        .put(&format!("blacklist/10.0.0.{}", i), "{}".to_string())
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = FileBackend::open(&path).await.unwrap();
        assert_eq!(reopened.scan("blacklist/").await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_abandoned_write_still_lands() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lists.json");
        let backend = FileBackend::open(&path).await.unwrap();

        // Caller gives up immediately, as a classification deadline would
        let _ = tokio::time::timeout(
            std::time::Duration::ZERO,
            backend.put("blacklist/6.6.6.6", "{}".to_string()),
        )
        .await;

        let mut waited = 0;
        while backend.get("blacklist/6.6.6.6").await.unwrap().is_none() {
            assert!(waited < 200, "abandoned write never published");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 1;
        }

        backend.put("blacklist/7.7.7.7", "{}".to_string()).await.unwrap();

        let reopened = FileBackend::open(&path).await.unwrap();
        let on_disk = reopened.scan("blacklist/").await.unwrap();
        assert_eq!(on_disk, backend.scan("blacklist/").await.unwrap());
        assert_eq!(on_disk.len(), 2);
    }
}
