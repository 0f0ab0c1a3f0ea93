use std::{collections::HashMap, io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, RecordingErrorKind};

/// Durable key/value storage for the persisted recording record.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, Error>;
    async fn save(&self, key: &str, value: &str) -> Result<(), Error>;
    async fn remove(&self, key: &str) -> Result<(), Error>;
}

fn storage_full(key: &str, len: usize, quota: usize) -> Error {
    Error::new_recording(
        format!("{} needs {} bytes, quota is {}", key, len, quota),
        RecordingErrorKind::StorageFull,
    )
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileChunkStore {
    dir: PathBuf,
    quota: Option<usize>,
}

impl FileChunkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quota: None,
        }
    }

    /// Rejects writes larger than `quota` bytes with [`RecordingErrorKind::StorageFull`].
    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn load(&self, key: &str) -> Result<Option<String>, Error> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), Error> {
        if let Some(quota) = self.quota {
            if value.len() > quota {
                return Err(storage_full(key, value.len(), quota));
            }
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    values: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn load(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), Error> {
        if let Some(quota) = self.quota {
            if value.len() > quota {
                return Err(storage_full(key, value.len(), quota));
            }
        }
        self.values
            .lock()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}
