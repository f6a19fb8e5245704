//! Configuration types for artifact transfers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default size of a chunk on the chunk-store path (5 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Default size of the write buffer on the file path (2 MiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Environment variable overriding [`PathConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "ARTIFACT_DL_DATA_DIR";

/// Which storage backend the manager should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Probe for positional file writes and fall back to the chunk store.
    #[default]
    Auto,
    /// Always use the seekable file backend.
    File,
    /// Always use the chunk store.
    Chunked,
}

/// Configuration for transfer operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Byte length of each ranged request on the chunk-store path.
    pub chunk_size: u64,
    /// Bytes buffered in memory before a write on the file path.
    pub write_buffer_size: usize,
    /// Backend selection policy.
    pub backend: BackendPreference,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Idle read timeout in seconds.
    pub read_timeout_secs: u64,
    /// Capacity of the broadcast channel carrying progress events.
    pub event_capacity: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            backend: BackendPreference::Auto,
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            event_capacity: 256,
        }
    }
}

impl DownloadConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the chunk size used on the chunk-store path.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the write buffer size used on the file path.
    #[must_use]
    pub const fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Sets the backend selection policy.
    #[must_use]
    pub const fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the capacity of the progress event channel.
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Checks that every size is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a size or capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()));
        }
        if self.write_buffer_size == 0 {
            return Err(Error::Config(
                "write_buffer_size must be greater than zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Location of all persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root directory holding metadata, chunks, and artifact files.
    pub data_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: data_dir.join("artifact-dl"),
        }
    }
}

impl PathConfig {
    /// Uses `dir` as the data directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
        }
    }

    /// Directory holding one TOML record per artifact.
    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }

    /// Directory holding file-backend artifacts.
    #[must_use]
    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    /// Directory holding per-artifact chunk directories.
    #[must_use]
    pub fn chunks_dir(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }

    /// Directory holding consolidated artifacts.
    #[must_use]
    pub fn consolidated_dir(&self) -> PathBuf {
        self.data_dir.join("consolidated")
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Transfer configuration.
    pub download: DownloadConfig,
    /// Path configuration.
    pub paths: PathConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the config file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("artifact-dl")
            .join("config.toml")
    }

    /// Loads configuration from `path`, using defaults when the file is absent.
    ///
    /// The [`DATA_DIR_ENV`] environment variable overrides the data directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(Error::Config(format!("{}: {e}", path.display())));
            }
        };
        Ok(config.with_data_dir_override(std::env::var(DATA_DIR_ENV).ok()))
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the string is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.download.validate()?;
        Ok(config)
    }

    /// Replaces the data directory when an override is present and non-empty.
    #[must_use]
    pub fn with_data_dir_override(mut self, dir: Option<String>) -> Self {
        if let Some(dir) = dir.filter(|d| !d.trim().is_empty()) {
            self.paths.data_dir = PathBuf::from(dir);
        }
        self
    }
}
