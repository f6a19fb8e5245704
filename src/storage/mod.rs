//! Storage backends for artifact bytes.
//!
//! Two implementations share the [`Storage`] contract:
//!
//! - [`FileBackend`] writes into one seekable file per artifact.
//! - [`ChunkBackend`] persists fixed-size chunks as whole files and merges them
//!   with a [`Consolidator`] once the transfer is complete. It needs nothing
//!   beyond sequential whole-file writes, so it works where positional writes
//!   are unavailable.
//!
//! [`select_backend`] picks one of them once per process.

mod chunk;
mod consolidate;
mod file;

use std::fmt::Write as _;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::config::{BackendPreference, DownloadConfig, PathConfig};
use crate::error::Result;

pub use chunk::{ChunkBackend, ChunkEntry, ChunkStore};
pub use consolidate::Consolidator;
pub use file::FileBackend;

/// Identifies which backend holds an artifact's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One seekable file per artifact.
    #[default]
    File,
    /// Fixed-size chunks plus a consolidated blob.
    Chunked,
}

/// A finished artifact handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Bytes live in a file on disk; nothing was copied.
    File {
        /// Location of the artifact.
        path: PathBuf,
        /// Measured length in bytes.
        size: u64,
    },
    /// Bytes were reassembled in memory from chunks.
    Memory(Bytes),
}

impl Artifact {
    /// Length of the artifact in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::File { size, .. } => *size,
            Self::Memory(bytes) => bytes.len() as u64,
        }
    }

    /// Returns true if the artifact holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the artifact, when it is file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Memory(_) => None,
        }
    }

    /// Returns the artifact contents, reading the file if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be read.
    pub async fn bytes(&self) -> io::Result<Bytes> {
        match self {
            Self::File { path, .. } => tokio::fs::read(path).await.map(Bytes::from),
            Self::Memory(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Persistence contract shared by both backends.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Writes `data` at byte `offset` of the artifact.
    async fn write(&self, artifact_id: &str, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Number of bytes durably stored for the artifact.
    async fn current_size(&self, artifact_id: &str) -> io::Result<u64>;

    /// Turns the stored bytes into the finished artifact and returns its
    /// measured length. `expected` is the length announced by the server.
    async fn finalize(&self, artifact_id: &str, expected: u64) -> Result<u64>;

    /// Returns the finished artifact, if one is stored.
    async fn read(&self, artifact_id: &str) -> io::Result<Option<Artifact>>;

    /// Removes everything stored for the artifact. Missing data is not an error.
    async fn delete(&self, artifact_id: &str) -> io::Result<()>;
}

/// Escapes an artifact id into a name safe to use as a single path component.
///
/// ASCII alphanumerics, `-`, `_` and non-leading `.` pass through; every other
/// byte becomes `%XX`. The mapping is injective.
#[must_use]
pub fn artifact_key(artifact_id: &str) -> String {
    let mut key = String::with_capacity(artifact_id.len());
    for (i, byte) in artifact_id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            key.push(char::from(byte));
        } else {
            let _ = write!(key, "%{byte:02X}");
        }
    }
    key
}

/// Checks whether `dir` supports positional writes into an open file handle.
///
/// Writes one byte at a non-zero offset of a probe file and verifies the
/// resulting length. Any failure means the file backend cannot be used.
pub async fn probe_positional_writes(dir: &Path) -> bool {
    const PROBE_OFFSET: u64 = 4096;

    let probe = dir.join(".probe");
    let result: io::Result<bool> = async {
        tokio::fs::create_dir_all(dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&probe)
            .await?;
        file.seek(SeekFrom::Start(PROBE_OFFSET)).await?;
        file.write_all(b"p").await?;
        file.flush().await?;
        drop(file);
        let len = tokio::fs::metadata(&probe).await?.len();
        Ok(len == PROBE_OFFSET + 1)
    }
    .await;

    let _ = tokio::fs::remove_file(&probe).await;
    match result {
        Ok(supported) => supported,
        Err(e) => {
            log::warn!("Positional writes unavailable in {}: {e}", dir.display());
            false
        }
    }
}

/// Selects the backend for this process according to `config.backend`.
///
/// # Errors
///
/// Returns an error if the chosen backend's directories cannot be created.
pub async fn select_backend(
    paths: &PathConfig,
    config: &DownloadConfig,
) -> Result<Arc<dyn Storage>> {
    let use_file = match config.backend {
        BackendPreference::File => true,
        BackendPreference::Chunked => false,
        BackendPreference::Auto => probe_positional_writes(&paths.files_dir()).await,
    };

    let storage: Arc<dyn Storage> = if use_file {
        Arc::new(FileBackend::open(paths.files_dir()).await?)
    } else {
        Arc::new(ChunkBackend::open(paths.chunks_dir(), paths.consolidated_dir()).await?)
    };
    log::info!("Using {:?} storage backend", storage.kind());
    Ok(storage)
}
