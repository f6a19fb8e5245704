//! artifact-dl - resumable downloads of large model artifacts.
//!
//! Artifacts are fetched over HTTP with `HEAD` and `Range` requests and
//! stored either in a directly addressable file or, where the platform lacks
//! positional writes, as fixed-size chunks that are consolidated at the end.
//! Progress is persisted per artifact, so a paused, failed or crashed
//! transfer continues from its last durable byte.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use artifact_dl::{AppConfig, DownloadManager, NoProgress};
//!
//! # async fn example() -> artifact_dl::Result<()> {
//! let manager = DownloadManager::new(AppConfig::default()).await?;
//!
//! let outcome = manager
//!     .start("llama-7b", "https://models.example.com/llama-7b.bin", "token", Arc::new(NoProgress))
//!     .await?;
//! outcome.wait().await?;
//!
//! if let Some(artifact) = manager.artifact("llama-7b").await? {
//!     println!("{} bytes at {:?}", artifact.len(), artifact.path());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod manager;
pub mod metadata;
pub mod progress;
pub mod record;
pub mod stats;
pub mod storage;

// Re-export main types for convenience
pub use config::{AppConfig, BackendPreference, DownloadConfig, PathConfig};
pub use engine::{TransferEngine, TransferMode, TransferOutcome, TransferRequest};
pub use error::{Error, Result};
pub use format::{format_bytes, format_duration, format_percent, format_speed};
pub use manager::{DownloadManager, StartOutcome, TransferHandle};
pub use metadata::MetadataStore;
pub use progress::{NoProgress, ProgressEvent, ProgressSink};
pub use record::{ArtifactRecord, ArtifactStatus, StatusReport};
pub use stats::TransferStats;
pub use storage::{Artifact, BackendKind, Storage};
