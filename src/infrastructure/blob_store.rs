// File-backed blob store for the persisted result cache
use crate::application::cache_store::BlobStore;
use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;

/// One file per key under `dir`. Writes land in a temporary file first and
/// are renamed into place.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.br"))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read cache blob {key}")),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let target = self.path(key);
        let tmp = self.dir.join(format!("{key}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write cache blob {key}"))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .with_context(|| format!("Failed to move cache blob {key} into place"))?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "br" || ext == "tmp") {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}
