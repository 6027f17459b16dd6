use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::{ParqueError, Result, StorageErrorKind};

/// Metadata for one stored object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// The narrow storage contract every higher layer depends on.
///
/// Keys are `/`-separated relative paths. Writes are atomic at single-key
/// granularity; there is no cross-key transaction.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

fn not_found(path: &str) -> ParqueError {
    ParqueError::Storage {
        kind: StorageErrorKind::Io,
        detail: format!("object not found: {path}"),
    }
}

/// Filesystem-backed store rooted at a directory.
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| ParqueError::storage_io(format!("failed to create store root: {e}")))?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(path)),
            Err(e) => Err(ParqueError::storage_io(format!(
                "read {}: {e}",
                full.display()
            ))),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ParqueError::storage_io(format!("mkdir {}: {e}", parent.display()))
            })?;
        }
        // Write-then-rename keeps single-key writes atomic.
        let tmp = full.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| ParqueError::storage_io(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|e| ParqueError::storage_io(format!("rename {}: {e}", full.display())))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(path)),
            Err(e) => Err(ParqueError::storage_io(format!(
                "delete {}: {e}",
                full.display()
            ))),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path))
            .await
            .unwrap_or(false))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut results = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(ParqueError::storage_io(format!(
                        "list {}: {e}",
                        dir.display()
                    )))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ParqueError::storage_io(format!("list entry: {e}")))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                if !rel.starts_with(prefix) {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| ParqueError::storage_io(format!("stat {rel}: {e}")))?;
                let last_modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
                    .unwrap_or_else(Utc::now);
                results.push(ObjectMeta {
                    path: rel,
                    size: meta.len(),
                    last_modified,
                });
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }
}

/// In-memory store for tests and ephemeral databases.
#[derive(Default)]
pub struct InMemoryStore {
    objects: DashMap<String, (Vec<u8>, DateTime<Utc>)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.objects
            .get(path)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| not_found(path))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects
            .insert(path.to_string(), (data.to_vec(), Utc::now()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut results: Vec<ObjectMeta> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ObjectMeta {
                path: entry.key().clone(),
                size: entry.value().0.len() as u64,
                last_modified: entry.value().1,
            })
            .collect();
        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }
}
