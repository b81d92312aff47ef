//! The underlying storage primitive the gate forwards approved writes to.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};

/// Storage that accepts positioned writes.
///
/// The gate wraps one of these and implements the trait itself, so a gated
/// storage can be used anywhere a plain one is expected.
#[async_trait]
pub trait WriteStorage: Send + Sync {
    /// Read the whole file at `path`.
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Write `data` at `offset`, creating the file if needed. Returns bytes written.
    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> StorageResult<usize>;

    /// Truncate or extend the file at `path` to `size` bytes.
    async fn set_size(&self, path: &str, size: u64) -> StorageResult<()>;

    /// Current length of the file at `path`.
    async fn size(&self, path: &str) -> StorageResult<u64> {
        Ok(self.read(path).await?.len() as u64)
    }
}

#[async_trait]
impl<S: WriteStorage + ?Sized> WriteStorage for std::sync::Arc<S> {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> StorageResult<usize> {
        (**self).write_at(path, offset, data).await
    }

    async fn set_size(&self, path: &str, size: u64) -> StorageResult<()> {
        (**self).set_size(path, size).await
    }

    async fn size(&self, path: &str) -> StorageResult<u64> {
        (**self).size(path).await
    }
}

/// In-memory storage keyed by path.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage holding `files`.
    pub fn with_files<I, P, D>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, D)>,
        P: Into<String>,
        D: Into<Vec<u8>>,
    {
        Self {
            files: RwLock::new(
                files
                    .into_iter()
                    .map(|(p, d)| (p.into(), d.into()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl WriteStorage for InMemoryStorage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let files = self.files.read().await;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> StorageResult<usize> {
        let end = usize::try_from(offset)
            .ok()
            .and_then(|offset| offset.checked_add(data.len()))
            .ok_or_else(|| StorageError::InvalidPath(format!("{path}: offset too large")))?;
        let offset = end - data.len();
        let mut files = self.files.write().await;
        let existing = files.entry(path.to_string()).or_default();
        if end > existing.len() {
            existing.resize(end, 0);
        }
        existing[offset..end].copy_from_slice(data);
        Ok(data.len())
    }

    async fn set_size(&self, path: &str, size: u64) -> StorageResult<()> {
        let size = usize::try_from(size)
            .map_err(|_| StorageError::InvalidPath(format!("{path}: size too large")))?;
        let mut files = self.files.write().await;
        let data = files
            .get_mut(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        data.resize(size, 0);
        Ok(())
    }

    async fn size(&self, path: &str) -> StorageResult<u64> {
        let files = self.files.read().await;
        files
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}

/// Storage backed by the host filesystem.
///
/// With a root, absolute paths are resolved beneath it (`/etc/passwd` under
/// root `/srv/jail` is `/srv/jail/etc/passwd`) and `..` is rejected. Without
/// one, paths are used as given.
#[derive(Debug, Clone, Default)]
pub struct FsStorage {
    root: Option<PathBuf>,
}

impl FsStorage {
    /// Storage over the real filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage confined to `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Map a storage path to a host path.
    pub fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(path));
        };
        let mut resolved = root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(resolved)
    }
}

fn map_io(path: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
        _ => StorageError::Io(err),
    }
}

#[async_trait]
impl WriteStorage for FsStorage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let host = self.resolve(path)?;
        tokio::fs::read(&host).await.map_err(|e| map_io(path, e))
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> StorageResult<usize> {
        let host = self.resolve(path)?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&host)
            .await
            .map_err(|e| map_io(path, e))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }

    async fn set_size(&self, path: &str, size: u64) -> StorageResult<()> {
        let host = self.resolve(path)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&host)
            .await
            .map_err(|e| map_io(path, e))?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn size(&self, path: &str) -> StorageResult<u64> {
        let host = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&host)
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(metadata.len())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_write_at_extends_and_overwrites() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.write_at("/f", 0, b"hello").await.unwrap(), 5);
        storage.write_at("/f", 3, b"p!").await.unwrap();
        assert_eq!(storage.read("/f").await.unwrap(), b"help!");

        storage.write_at("/f", 7, b"x").await.unwrap();
        assert_eq!(storage.read("/f").await.unwrap(), b"help!\0\0x");
    }

    #[tokio::test]
    async fn test_memory_rejects_overflowing_offset() {
        let storage = InMemoryStorage::new();
        assert!(matches!(
            storage.write_at("/f", u64::MAX, b"x").await,
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_missing_file() {
        let storage = InMemoryStorage::new();
        match storage.read("/nope").await {
            Err(StorageError::NotFound(p)) => assert_eq!(p, "/nope"),
            other => panic!("expected NotFound, got {:?}", other),
        }
        assert!(storage.set_size("/nope", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_set_size() {
        let storage = InMemoryStorage::with_files([("/f", b"abcdef".to_vec())]);
        storage.set_size("/f", 3).await.unwrap();
        assert_eq!(storage.read("/f").await.unwrap(), b"abc");
        assert_eq!(storage.size("/f").await.unwrap(), 3);
        assert!(matches!(
            storage.size("/nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_roundtrip_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("etc")).unwrap();
        let storage = FsStorage::rooted(dir.path());

        storage.write_at("/etc/passwd", 0, b"root:x:0\n").await.unwrap();
        storage.write_at("/etc/passwd", 9, b"operator:x:1000\n").await.unwrap();

        let on_disk = std::fs::read(dir.path().join("etc/passwd")).unwrap();
        assert_eq!(on_disk, b"root:x:0\noperator:x:1000\n");
        assert_eq!(storage.read("/etc/passwd").await.unwrap(), on_disk);

        assert_eq!(storage.size("/etc/passwd").await.unwrap(), 25);

        storage.set_size("/etc/passwd", 9).await.unwrap();
        assert_eq!(storage.read("/etc/passwd").await.unwrap(), b"root:x:0\n");
        assert_eq!(storage.size("/etc/./passwd").await.unwrap(), 9);
        assert!(matches!(
            storage.size("/etc/shadow").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_fs_rejects_escape_from_root() {
        let storage = FsStorage::rooted("/srv/jail");
        assert_eq!(
            storage.resolve("/etc/passwd").unwrap(),
            PathBuf::from("/srv/jail/etc/passwd")
        );
        assert!(storage.resolve("/etc/../../passwd").is_err());
        assert_eq!(
            FsStorage::new().resolve("/etc/passwd").unwrap(),
            PathBuf::from("/etc/passwd")
        );
    }
}
