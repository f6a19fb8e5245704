//! Seekable-file backend.

use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{Artifact, BackendKind, Storage, artifact_key};
use crate::error::Result;

/// Stores each artifact as one file, written in place at arbitrary offsets.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens the backend rooted at `dir`, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Location of the file holding `artifact_id`.
    #[must_use]
    pub fn path(&self, artifact_id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", artifact_key(artifact_id)))
    }

    async fn file_size(path: &Path) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Storage for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn write(&self, artifact_id: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(artifact_id))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await
    }

    async fn current_size(&self, artifact_id: &str) -> io::Result<u64> {
        Ok(Self::file_size(&self.path(artifact_id)).await?.unwrap_or(0))
    }

    async fn finalize(&self, artifact_id: &str, _expected: u64) -> Result<u64> {
        let path = self.path(artifact_id);
        // A zero-length artifact never saw a write; make sure the file exists.
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await?;
        file.sync_all().await?;
        Ok(file.metadata().await?.len())
    }

    async fn read(&self, artifact_id: &str) -> io::Result<Option<Artifact>> {
        let path = self.path(artifact_id);
        Ok(Self::file_size(&path)
            .await?
            .map(|size| Artifact::File { path, size }))
    }

    async fn delete(&self, artifact_id: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path(artifact_id)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
