//! Public entry point: one registry of live transfers per process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, DownloadConfig};
use crate::engine::{
    TransferEngine, TransferMode, TransferOutcome, TransferRequest, build_http_client,
};
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::progress::{ProgressEmitter, ProgressEvent, ProgressSink};
use crate::record::{ArtifactRecord, ArtifactStatus, StatusReport};
use crate::storage::{Artifact, BackendKind, Storage, select_backend};

/// Tokens of one running transfer loop.
#[derive(Debug, Default)]
struct ActiveTransfer {
    /// Cancelled by `pause` and `delete`.
    cancel: CancellationToken,
    /// Cancelled once the loop has persisted its outcome and left the registry.
    finished: CancellationToken,
}

type Transfers = HashMap<String, ActiveTransfer>;
type Registry = Arc<Mutex<Transfers>>;

fn lock(registry: &Mutex<Transfers>) -> MutexGuard<'_, Transfers> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the registry entry when the transfer task ends, even by panic.
struct RegistryGuard {
    registry: Registry,
    artifact_id: String,
    finished: CancellationToken,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.artifact_id);
        self.finished.cancel();
    }
}

/// Handle to a spawned transfer.
#[derive(Debug)]
pub struct TransferHandle {
    artifact_id: String,
    join: JoinHandle<TransferOutcome>,
}

impl TransferHandle {
    /// Artifact being transferred.
    #[must_use]
    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    /// Waits for the transfer to complete, pause, or fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Task`] if the transfer task panicked.
    pub async fn wait(self) -> Result<TransferOutcome> {
        Ok(self.join.await?)
    }
}

/// What `start` or `resume` did.
#[derive(Debug)]
pub enum StartOutcome {
    /// A transfer loop was spawned.
    Spawned(TransferHandle),
    /// A loop for this artifact is already running; nothing was started.
    AlreadyActive,
    /// The artifact is complete and verified; nothing was started.
    AlreadyComplete(StatusReport),
}

impl StartOutcome {
    /// Waits for the spawned transfer, if any, and returns its report.
    ///
    /// Returns `None` when no transfer was spawned by this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Task`] if the transfer task panicked.
    pub async fn wait(self) -> Result<Option<StatusReport>> {
        match self {
            Self::Spawned(handle) => Ok(Some(handle.wait().await?.report)),
            Self::AlreadyComplete(report) => Ok(Some(report)),
            Self::AlreadyActive => Ok(None),
        }
    }
}

/// Resumable artifact downloader.
///
/// Owns the storage backend chosen at construction, the metadata store, and
/// the registry of live transfers. At most one transfer loop runs per
/// artifact id; different ids transfer concurrently.
pub struct DownloadManager {
    engine: Arc<TransferEngine>,
    storage: Arc<dyn Storage>,
    metadata: Arc<MetadataStore>,
    active: Registry,
    events: broadcast::Sender<ProgressEvent>,
}

impl DownloadManager {
    /// Creates a manager from `config`, probing for the storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the HTTP client
    /// cannot be built, or the storage directories cannot be created.
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.download.validate()?;
        let client = build_http_client(&config.download)?;
        let storage = select_backend(&config.paths, &config.download).await?;
        let metadata = MetadataStore::new(config.paths.metadata_dir());
        Ok(Self::with_parts(client, storage, metadata, config.download))
    }

    /// Creates a manager from already constructed parts.
    #[must_use]
    pub fn with_parts(
        client: reqwest::Client,
        storage: Arc<dyn Storage>,
        metadata: MetadataStore,
        config: DownloadConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let metadata = Arc::new(metadata);
        let engine = Arc::new(TransferEngine::new(
            client,
            Arc::clone(&storage),
            Arc::clone(&metadata),
            config,
        ));
        Self {
            engine,
            storage,
            metadata,
            active: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Backend chosen for this process.
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.storage.kind()
    }

    /// Stream of progress events for every artifact.
    ///
    /// A subscriber that falls behind by more than the configured event
    /// capacity sees a lag error in place of the dropped events.
    #[must_use]
    pub fn subscribe(&self) -> BroadcastStream<ProgressEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Returns true if a transfer loop for `artifact_id` is running.
    #[must_use]
    pub fn is_active(&self, artifact_id: &str) -> bool {
        lock(&self.active).contains_key(artifact_id)
    }

    /// Begins a fresh transfer, discarding any stored bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArtifactId`] for an empty id and
    /// [`Error::AuthMissing`] for an empty token (recorded as `Error`).
    pub async fn start(
        &self,
        artifact_id: &str,
        url: &str,
        auth_token: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StartOutcome> {
        validate_id(artifact_id)?;
        let request = TransferRequest::new(artifact_id, url, auth_token, TransferMode::Fresh);
        self.launch(request, progress).await
    }

    /// Continues a paused or failed transfer from its stored bytes.
    ///
    /// Behaves like [`start`](Self::start) when nothing is recorded. A
    /// completed artifact that still verifies is left alone.
    ///
    /// # Errors
    ///
    /// As for [`start`](Self::start), plus metadata read failures.
    pub async fn resume(
        &self,
        artifact_id: &str,
        url: &str,
        auth_token: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StartOutcome> {
        validate_id(artifact_id)?;
        if self.is_active(artifact_id) {
            log::warn!("Transfer of '{artifact_id}' is already running");
            return Ok(StartOutcome::AlreadyActive);
        }

        let mode = match self.metadata.load(artifact_id).await? {
            None => TransferMode::Fresh,
            Some(record) if record.status == ArtifactStatus::Completed => {
                if self.verified_artifact(&record).await?.is_some() {
                    log::info!("'{artifact_id}' is already complete");
                    return Ok(StartOutcome::AlreadyComplete(record.report()));
                }
                TransferMode::Resume
            }
            Some(_) => TransferMode::Resume,
        };

        let request = TransferRequest::new(artifact_id, url, auth_token, mode);
        self.launch(request, progress).await
    }

    async fn launch(
        &self,
        request: TransferRequest,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<StartOutcome> {
        let id = request.artifact_id.clone();
        // The slot is held before anything is persisted for this id.
        let (cancel, guard) = {
            let mut active = lock(&self.active);
            if active.contains_key(&id) {
                log::warn!("Transfer of '{id}' is already running");
                return Ok(StartOutcome::AlreadyActive);
            }
            let entry = ActiveTransfer::default();
            let cancel = entry.cancel.clone();
            let guard = RegistryGuard {
                registry: Arc::clone(&self.active),
                artifact_id: id.clone(),
                finished: entry.finished.clone(),
            };
            active.insert(id.clone(), entry);
            (cancel, guard)
        };

        let emitter = ProgressEmitter::new(&id, progress, self.events.clone());
        if request.auth_token.trim().is_empty() {
            let err = Error::AuthMissing {
                artifact_id: id.clone(),
            };
            self.engine.record_failure(&id, &err, &emitter).await;
            drop(guard);
            return Err(err);
        }

        let engine = Arc::clone(&self.engine);
        let join = tokio::spawn(async move {
            let _guard = guard;
            engine.run(&request, &cancel, &emitter).await
        });

        Ok(StartOutcome::Spawned(TransferHandle {
            artifact_id: id,
            join,
        }))
    }

    /// Signals the running transfer for `artifact_id` to stop.
    ///
    /// Returns false if nothing was running. The loop persists its byte count
    /// and the `Paused` status before it exits.
    pub fn pause(&self, artifact_id: &str) -> bool {
        match lock(&self.active).get(artifact_id) {
            Some(transfer) => {
                transfer.cancel.cancel();
                log::info!("Pausing '{artifact_id}'");
                true
            }
            None => false,
        }
    }

    /// Waits until the running transfer for `artifact_id`, if any, has ended
    /// and returns the resulting status.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be read.
    pub async fn wait(&self, artifact_id: &str) -> Result<StatusReport> {
        let finished = lock(&self.active)
            .get(artifact_id)
            .map(|t| t.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
        self.status(artifact_id).await
    }

    /// Stops any running transfer and removes every trace of the artifact.
    ///
    /// Deleting an unknown artifact is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if stored data or metadata cannot be removed.
    pub async fn delete(&self, artifact_id: &str) -> Result<()> {
        let finished = lock(&self.active).get(artifact_id).map(|t| {
            t.cancel.cancel();
            t.finished.clone()
        });
        if let Some(finished) = finished {
            finished.cancelled().await;
        }

        self.storage.delete(artifact_id).await?;
        self.metadata.remove(artifact_id).await?;
        log::info!("Deleted '{artifact_id}'");
        Ok(())
    }

    /// Current progress of `artifact_id`.
    ///
    /// Unless the artifact is complete, the byte count is measured from the
    /// backend rather than trusted from the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record or the stored bytes cannot be read.
    pub async fn status(&self, artifact_id: &str) -> Result<StatusReport> {
        let Some(record) = self.metadata.load(artifact_id).await? else {
            return Ok(StatusReport::not_started());
        };
        if record.status == ArtifactStatus::Completed {
            return Ok(record.report());
        }

        let downloaded = if record.backend == self.storage.kind() {
            let measured = self.storage.current_size(artifact_id).await?;
            if record.total_bytes > 0 {
                measured.min(record.total_bytes)
            } else {
                measured
            }
        } else {
            record.downloaded_bytes
        };
        Ok(StatusReport::new(
            downloaded,
            record.total_bytes,
            record.status,
            record.last_error,
        ))
    }

    /// Reports for every recorded artifact, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata directory cannot be read.
    pub async fn list(&self) -> Result<Vec<(String, StatusReport)>> {
        Ok(self
            .metadata
            .list()
            .await?
            .into_iter()
            .map(|record| {
                let report = record.report();
                (record.artifact_id, report)
            })
            .collect())
    }

    /// The finished artifact, if it is complete and its length verifies.
    ///
    /// A completed artifact whose stored length differs from the recorded
    /// total is marked `Error` and `None` is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the record or the stored bytes cannot be read.
    pub async fn artifact(&self, artifact_id: &str) -> Result<Option<Artifact>> {
        match self.metadata.load(artifact_id).await? {
            Some(record) if record.status == ArtifactStatus::Completed => {
                self.verified_artifact(&record).await
            }
            _ => Ok(None),
        }
    }

    async fn verified_artifact(&self, record: &ArtifactRecord) -> Result<Option<Artifact>> {
        let id = record.artifact_id.as_str();
        let artifact = self.storage.read(id).await?;
        let actual = artifact.as_ref().map_or(0, Artifact::len);
        if artifact.is_some() && actual == record.total_bytes {
            return Ok(artifact);
        }

        let err = Error::SizeMismatch {
            expected: record.total_bytes,
            actual,
        };
        log::error!("Completed artifact '{id}' failed verification: {err}");
        self.metadata
            .update(id, record.backend, |r| {
                r.status = ArtifactStatus::Error;
                r.downloaded_bytes = actual.min(r.total_bytes);
                r.last_error = Some(err.to_string());
            })
            .await?;
        Ok(None)
    }
}

fn validate_id(artifact_id: &str) -> Result<()> {
    if artifact_id.trim().is_empty() {
        return Err(Error::InvalidArtifactId);
    }
    Ok(())
}
