//! Merging chunks into a single artifact.

use std::io::{self, ErrorKind};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::artifact_key;
use super::chunk::ChunkStore;
use crate::error::{Error, Result};

/// Produces consolidated artifacts from a [`ChunkStore`].
#[derive(Debug, Clone)]
pub struct Consolidator {
    dir: PathBuf,
}

impl Consolidator {
    /// Creates a consolidator writing into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Location of the consolidated artifact.
    #[must_use]
    pub fn path(&self, artifact_id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", artifact_key(artifact_id)))
    }

    fn part_path(&self, artifact_id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin.part", artifact_key(artifact_id)))
    }

    /// Length of the consolidated artifact, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be inspected.
    pub async fn size(&self, artifact_id: &str) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(self.path(artifact_id)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Concatenates the artifact's chunks into the consolidated file and then
    /// deletes the chunks. Returns the consolidated length.
    ///
    /// Chunks are streamed one at a time. The result is written to a `.part`
    /// file and renamed into place only once its length equals `expected`.
    /// On any failure the chunks are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] if the chunks do not add up to
    /// `expected`, or [`Error::Consolidation`] if an I/O step fails.
    pub async fn consolidate(
        &self,
        chunks: &ChunkStore,
        artifact_id: &str,
        expected: u64,
    ) -> Result<u64> {
        let entries = chunks.list(artifact_id).await?;

        if entries.is_empty()
            && let Some(size) = self.size(artifact_id).await?
        {
            // Chunks were already freed by an earlier run.
            return if size == expected {
                Ok(size)
            } else {
                Err(Error::SizeMismatch {
                    expected,
                    actual: size,
                })
            };
        }

        let sum: u64 = entries.iter().map(|c| c.len).sum();
        if sum != expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: sum,
            });
        }

        let part = self.part_path(artifact_id);
        let written = match self.write_part(chunks, artifact_id, &part).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(Error::Consolidation(e.to_string()));
            }
        };
        if written != expected {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(Error::SizeMismatch {
                expected,
                actual: written,
            });
        }

        tokio::fs::rename(&part, self.path(artifact_id))
            .await
            .map_err(|e| Error::Consolidation(e.to_string()))?;
        chunks.purge(artifact_id).await?;

        log::info!(
            "Consolidated {} chunk(s) of '{artifact_id}' into {written} bytes",
            entries.len()
        );
        Ok(written)
    }

    async fn write_part(
        &self,
        chunks: &ChunkStore,
        artifact_id: &str,
        part: &std::path::Path,
    ) -> io::Result<u64> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut out = BufWriter::new(tokio::fs::File::create(part).await?);
        let mut written = 0u64;
        for entry in chunks.list(artifact_id).await? {
            let data = chunks.get(artifact_id, entry.index).await?;
            out.write_all(&data).await?;
            written += data.len() as u64;
        }
        out.flush().await?;
        out.get_ref().sync_all().await?;
        Ok(written)
    }

    /// Reassembles the artifact in memory from its chunks, without touching
    /// the store. Returns `None` if there are no chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if a chunk cannot be read.
    pub async fn reconstruct(
        &self,
        chunks: &ChunkStore,
        artifact_id: &str,
    ) -> io::Result<Option<Bytes>> {
        let entries = chunks.list(artifact_id).await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let capacity = entries.iter().map(|c| c.len).sum::<u64>();
        let mut buf = BytesMut::with_capacity(usize::try_from(capacity).unwrap_or(0));
        for entry in entries {
            buf.extend_from_slice(&chunks.get(artifact_id, entry.index).await?);
        }
        Ok(Some(buf.freeze()))
    }

    /// Removes the consolidated artifact and any leftover `.part` file.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be removed.
    pub async fn remove(&self, artifact_id: &str) -> io::Result<()> {
        for path in [self.path(artifact_id), self.part_path(artifact_id)] {
            match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (ChunkStore, Consolidator) {
        (
            ChunkStore::new(dir.path().join("chunks")),
            Consolidator::new(dir.path().join("consolidated")),
        )
    }

    #[tokio::test]
    async fn consolidates_in_index_order() {
        let dir = TempDir::new().unwrap();
        let (store, consolidator) = setup(&dir);
        store.put("m", 1, b"efgh").await.unwrap();
        store.put("m", 0, b"abcd").await.unwrap();
        store.put("m", 2, b"i").await.unwrap();

        assert_eq!(consolidator.consolidate(&store, "m", 9).await.unwrap(), 9);
        assert_eq!(
            std::fs::read(consolidator.path("m")).unwrap(),
            b"abcdefghi".to_vec()
        );
        assert!(store.list("m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn size_mismatch_keeps_chunks() {
        let dir = TempDir::new().unwrap();
        let (store, consolidator) = setup(&dir);
        store.put("m", 0, b"abcd").await.unwrap();

        let err = consolidator.consolidate(&store, "m", 8).await.unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch {
                expected: 8,
                actual: 4
            }
        ));
        assert_eq!(store.summary("m").await.unwrap(), (1, 4));
        assert!(consolidator.size("m").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn io_failure_keeps_chunks() {
        let dir = TempDir::new().unwrap();
        let (store, consolidator) = setup(&dir);
        store.put("m", 0, b"abcd").await.unwrap();
        store.put("m", 1, b"ef").await.unwrap();
        // A plain file where the output directory should be.
        std::fs::write(dir.path().join("consolidated"), b"").unwrap();

        let err = consolidator.consolidate(&store, "m", 6).await.unwrap_err();
        assert!(matches!(err, Error::Consolidation(_)));
        assert_eq!(store.summary("m").await.unwrap(), (2, 6));
        assert_eq!(store.get("m", 1).await.unwrap().as_ref(), b"ef");
    }

    #[tokio::test]
    async fn rerun_after_chunks_were_freed_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let (store, consolidator) = setup(&dir);
        store.put("m", 0, b"ab").await.unwrap();

        assert_eq!(consolidator.consolidate(&store, "m", 2).await.unwrap(), 2);
        assert_eq!(consolidator.consolidate(&store, "m", 2).await.unwrap(), 2);
        assert!(matches!(
            consolidator.consolidate(&store, "m", 3).await,
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn reconstruct_leaves_chunks_in_place() {
        let dir = TempDir::new().unwrap();
        let (store, consolidator) = setup(&dir);
        assert!(consolidator.reconstruct(&store, "m").await.unwrap().is_none());

        store.put("m", 0, b"abcd").await.unwrap();
        store.put("m", 1, b"e").await.unwrap();
        let bytes = consolidator.reconstruct(&store, "m").await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), b"abcde");
        assert_eq!(store.summary("m").await.unwrap(), (2, 5));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, consolidator) = setup(&dir);
        store.put("m", 0, b"ab").await.unwrap();
        consolidator.consolidate(&store, "m", 2).await.unwrap();

        consolidator.remove("m").await.unwrap();
        consolidator.remove("m").await.unwrap();
        assert!(consolidator.size("m").await.unwrap().is_none());
    }
}
