//! Chunk-keyed fallback store.
//!
//! Each chunk is a whole file at `<root>/<artifact key>/<index>.chunk`,
//! written to a temporary name and renamed into place.

use std::io::{self, ErrorKind};
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use super::consolidate::Consolidator;
use super::{Artifact, BackendKind, Storage, artifact_key};
use crate::error::Result;

const CHUNK_EXTENSION: &str = "chunk";

/// One stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Position of the chunk within the artifact, from 0.
    pub index: u64,
    /// Length of the chunk in bytes.
    pub len: u64,
    /// File holding the chunk.
    pub path: PathBuf,
}

/// Table of chunks keyed by `(artifact id, chunk index)`.
///
/// The chunk size of an artifact is whatever its first chunk holds: every
/// later chunk has that length except possibly the last.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn artifact_dir(&self, artifact_id: &str) -> PathBuf {
        self.root.join(artifact_key(artifact_id))
    }

    fn chunk_path(&self, artifact_id: &str, index: u64) -> PathBuf {
        self.artifact_dir(artifact_id)
            .join(format!("{index:08}.{CHUNK_EXTENSION}"))
    }

    /// Stores `data` as chunk `index` of the artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk cannot be written.
    pub async fn put(&self, artifact_id: &str, index: u64, data: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(self.artifact_dir(artifact_id)).await?;
        let path = self.chunk_path(artifact_id, index);
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &path).await
    }

    /// Reads chunk `index` of the artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk does not exist or cannot be read.
    pub async fn get(&self, artifact_id: &str, index: u64) -> io::Result<Bytes> {
        tokio::fs::read(self.chunk_path(artifact_id, index))
            .await
            .map(Bytes::from)
    }

    /// Lists the artifact's usable chunks in index order.
    ///
    /// Only the contiguous run starting at index 0 counts, and it ends at the
    /// first chunk shorter than chunk 0. Nothing is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk directory cannot be read.
    pub async fn list(&self, artifact_id: &str) -> io::Result<Vec<ChunkEntry>> {
        let (mut found, usable) = self.scan(artifact_id).await?;
        found.truncate(usable);
        Ok(found)
    }

    /// Every chunk file of the artifact, sorted, plus the length of the
    /// usable run at its front.
    async fn scan(&self, artifact_id: &str) -> io::Result<(Vec<ChunkEntry>, usize)> {
        let mut dir = match tokio::fs::read_dir(self.artifact_dir(artifact_id)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != CHUNK_EXTENSION) {
                continue;
            }
            let Some(index) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            let len = entry.metadata().await?.len();
            found.push(ChunkEntry { index, len, path });
        }
        found.sort_by_key(|c| c.index);

        let mut usable = 0;
        for (expected, chunk) in (0u64..).zip(&found) {
            let after_short = usable > 0 && found[usable - 1].len < found[0].len;
            if chunk.index != expected || after_short || chunk.len > found[0].len {
                break;
            }
            usable += 1;
        }
        Ok((found, usable))
    }

    /// Number of usable chunks and their total length.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk directory cannot be read.
    pub async fn summary(&self, artifact_id: &str) -> io::Result<(u64, u64)> {
        let chunks = self.list(artifact_id).await?;
        let bytes = chunks.iter().map(|c| c.len).sum();
        Ok((chunks.len() as u64, bytes))
    }

    /// Removes every chunk of the artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk directory exists but cannot be removed.
    pub async fn purge(&self, artifact_id: &str) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.artifact_dir(artifact_id)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Chunk store plus consolidator, behind the [`Storage`] contract.
#[derive(Debug, Clone)]
pub struct ChunkBackend {
    chunks: ChunkStore,
    consolidator: Consolidator,
}

impl ChunkBackend {
    /// Opens the backend, creating both directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub async fn open(
        chunks_dir: impl Into<PathBuf>,
        consolidated_dir: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        let chunks_dir = chunks_dir.into();
        let consolidated_dir = consolidated_dir.into();
        tokio::fs::create_dir_all(&chunks_dir).await?;
        tokio::fs::create_dir_all(&consolidated_dir).await?;
        Ok(Self {
            chunks: ChunkStore::new(chunks_dir),
            consolidator: Consolidator::new(consolidated_dir),
        })
    }

    /// The underlying chunk table.
    #[must_use]
    pub const fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// The consolidator producing finished artifacts.
    #[must_use]
    pub const fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }
}

#[async_trait]
impl Storage for ChunkBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Chunked
    }

    /// Appends `data` as the next chunk; `offset` must be the current end.
    ///
    /// The first chunk fixes the artifact's chunk size. Chunk files left past
    /// the usable run are discarded before the new chunk takes their place.
    async fn write(&self, artifact_id: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let (found, usable) = self.chunks.scan(artifact_id).await?;
        let chunks = &found[..usable];
        let end: u64 = chunks.iter().map(|c| c.len).sum();
        if offset != end {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("chunk writes must append at byte {end}, got offset {offset}"),
            ));
        }
        if data.is_empty() {
            return Err(io::Error::new(ErrorKind::InvalidInput, "empty chunk"));
        }
        if let (Some(first), Some(last)) = (chunks.first(), chunks.last()) {
            if data.len() as u64 > first.len {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!(
                        "chunk of {} bytes exceeds the artifact's chunk size {}",
                        data.len(),
                        first.len
                    ),
                ));
            }
            if last.len < first.len {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "artifact already ends with its final short chunk",
                ));
            }
        }

        for orphan in &found[usable..] {
            log::warn!(
                "Discarding chunk {} of '{artifact_id}' past the stored run",
                orphan.index
            );
            tokio::fs::remove_file(&orphan.path).await?;
        }
        self.chunks.put(artifact_id, usable as u64, data).await
    }

    async fn current_size(&self, artifact_id: &str) -> io::Result<u64> {
        let (count, bytes) = self.chunks.summary(artifact_id).await?;
        if count > 0 {
            return Ok(bytes);
        }
        Ok(self.consolidator.size(artifact_id).await?.unwrap_or(0))
    }

    async fn finalize(&self, artifact_id: &str, expected: u64) -> Result<u64> {
        self.consolidator
            .consolidate(&self.chunks, artifact_id, expected)
            .await
    }

    async fn read(&self, artifact_id: &str) -> io::Result<Option<Artifact>> {
        if let Some(size) = self.consolidator.size(artifact_id).await? {
            return Ok(Some(Artifact::File {
                path: self.consolidator.path(artifact_id),
                size,
            }));
        }
        let rebuilt = self.consolidator.reconstruct(&self.chunks, artifact_id).await?;
        if rebuilt.is_some() {
            log::warn!("Consolidated copy of '{artifact_id}' missing; rebuilt from chunks");
        }
        Ok(rebuilt.map(Artifact::Memory))
    }

    async fn delete(&self, artifact_id: &str) -> io::Result<()> {
        self.chunks.purge(artifact_id).await?;
        self.consolidator.remove(artifact_id).await
    }
}
