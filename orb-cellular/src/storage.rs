use async_trait::async_trait;
use color_eyre::{
    eyre::{ensure, WrapErr as _},
    Result,
};
use dashmap::DashMap;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;

/// Durable key/value storage the cellular state is persisted to.
#[async_trait]
pub trait Persistence: 'static + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// One file per key inside `dir`.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        ensure!(
            !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
            "invalid storage key {key:?}"
        );

        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key)?;

        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).wrap_err_with(|| format!("failed to read {}", path.display())),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path(key)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));

        fs::create_dir_all(&self.dir)
            .await
            .wrap_err_with(|| format!("failed to create {}", self.dir.display()))?;

        fs::write(&tmp, value)
            .await
            .wrap_err_with(|| format!("failed to write {}", tmp.display()))?;

        fs::rename(&tmp, &path)
            .await
            .wrap_err_with(|| format!("failed to move {} into place", path.display()))?;

        Ok(())
    }
}

/// Volatile storage, for tests and for running without a persistent partition.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_tempfile::TempDir;

    #[tokio::test]
    async fn it_round_trips_values_on_disk() {
        // Arrange
        let tmpdir = TempDir::new().await.unwrap();
        let dir = tmpdir.to_path_buf().join("nested");
        let storage = FilePersistence::new(&dir);

        // Act
        let missing = storage.get("activation-v1").await.unwrap();
        storage.put("activation-v1", b"hello".to_vec()).await.unwrap();
        storage.put("activation-v1", b"world".to_vec()).await.unwrap();

        // Assert
        assert_eq!(missing, None);
        let reopened = FilePersistence::new(&dir);
        assert_eq!(
            reopened.get("activation-v1").await.unwrap(),
            Some(b"world".to_vec())
        );
    }

    #[tokio::test]
    async fn it_rejects_keys_that_escape_the_directory() {
        let storage = FilePersistence::new("/tmp");

        assert!(storage.get("../etc/passwd").await.is_err());
        assert!(storage.put("", vec![]).await.is_err());
    }
}
