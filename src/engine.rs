//! Transfer engine: a HEAD request followed by ranged GETs, streamed into
//! whichever backend is active.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::format::{format_bytes, format_duration, format_speed};
use crate::metadata::MetadataStore;
use crate::progress::ProgressEmitter;
use crate::record::{ArtifactStatus, StatusReport};
use crate::stats::{TransferStats, TransferStatsTracker};
use crate::storage::{BackendKind, Storage};

/// Builds the HTTP client used for every transfer.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_http_client(config: &DownloadConfig) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.read_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

/// Whether a transfer starts over or continues from stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Discard stored bytes and query the length again.
    Fresh,
    /// Continue from the bytes already stored, if the length is known.
    Resume,
}

/// Everything needed to run one transfer attempt.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Artifact being transferred.
    pub artifact_id: String,
    /// Endpoint serving the artifact; must honor `HEAD` and `Range`.
    pub url: String,
    /// Bearer token sent with every request.
    pub auth_token: String,
    /// Fresh start or resume.
    pub mode: TransferMode,
}

impl TransferRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(artifact_id: &str, url: &str, auth_token: &str, mode: TransferMode) -> Self {
        Self {
            artifact_id: artifact_id.to_string(),
            url: url.to_string(),
            auth_token: auth_token.to_string(),
            mode,
        }
    }
}

/// Result of a finished transfer attempt.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Final state of the artifact, as persisted.
    pub report: StatusReport,
    /// Statistics of the attempt.
    pub stats: TransferStats,
}

/// Per-attempt context shared by both fetch loops.
struct Attempt<'a> {
    request: &'a TransferRequest,
    token: &'a CancellationToken,
    emitter: &'a ProgressEmitter,
    stats: &'a TransferStatsTracker,
    total: u64,
    chunk_size: u64,
}

impl Attempt<'_> {
    fn id(&self) -> &str {
        &self.request.artifact_id
    }

    fn in_flight(&self, downloaded: u64) {
        self.emitter.emit(StatusReport::new(
            downloaded,
            self.total,
            ArtifactStatus::Downloading,
            None,
        ));
    }
}

/// Runs `fut` unless `token` is cancelled first.
async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Error::Cancelled),
        out = fut => Ok(out),
    }
}

/// Start offset announced by a `Content-Range: bytes <start>-<end>/<total>` header.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// Moves bytes from the network into storage and keeps metadata in step.
pub struct TransferEngine {
    client: Client,
    storage: Arc<dyn Storage>,
    metadata: Arc<MetadataStore>,
    config: DownloadConfig,
}

impl TransferEngine {
    /// Creates an engine writing into `storage`.
    #[must_use]
    pub fn new(
        client: Client,
        storage: Arc<dyn Storage>,
        metadata: Arc<MetadataStore>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            client,
            storage,
            metadata,
            config,
        }
    }

    /// Runs one attempt to completion, pause, or failure.
    ///
    /// Never returns an error: every outcome is persisted to the metadata
    /// store and reported through `emitter` before this returns.
    pub async fn run(
        &self,
        request: &TransferRequest,
        token: &CancellationToken,
        emitter: &ProgressEmitter,
    ) -> TransferOutcome {
        let stats = TransferStatsTracker::new();
        let report = match self.transfer(request, token, emitter, &stats).await {
            Ok(report) => {
                let snapshot = stats.snapshot();
                log::info!(
                    "Completed '{}': {} in {} ({})",
                    request.artifact_id,
                    format_bytes(report.total_bytes),
                    format_duration(snapshot.elapsed),
                    format_speed(snapshot.average_speed)
                );
                report
            }
            Err(err) => self.record_failure(&request.artifact_id, &err, emitter).await,
        };
        TransferOutcome {
            report,
            stats: stats.snapshot(),
        }
    }

    /// Persists `err` as the artifact's outcome and reports it.
    ///
    /// A cancellation becomes `Paused`; anything else becomes `Error` with the
    /// error's message. The byte count is re-measured from storage so it only
    /// covers durably written data.
    pub(crate) async fn record_failure(
        &self,
        artifact_id: &str,
        err: &Error,
        emitter: &ProgressEmitter,
    ) -> StatusReport {
        let cancelled = err.is_cancelled();
        if cancelled {
            log::info!("Paused '{artifact_id}'");
        } else {
            log::error!("Transfer of '{artifact_id}' failed: {err}");
        }

        let durable = match self.storage.current_size(artifact_id).await {
            Ok(size) => Some(size),
            Err(e) => {
                log::warn!("Could not measure stored bytes of '{artifact_id}': {e}");
                None
            }
        };
        let (status, message) = if cancelled {
            (ArtifactStatus::Paused, None)
        } else {
            (ArtifactStatus::Error, Some(err.to_string()))
        };

        let persisted = self
            .metadata
            .update(artifact_id, self.storage.kind(), |r| {
                if let Some(size) = durable {
                    r.downloaded_bytes = if r.total_bytes > 0 {
                        size.min(r.total_bytes)
                    } else {
                        size
                    };
                }
                r.status = status;
                r.last_error.clone_from(&message);
            })
            .await;

        let report = match persisted {
            Ok(record) => record.report(),
            Err(e) => {
                log::error!("Could not persist state of '{artifact_id}': {e}");
                StatusReport::new(durable.unwrap_or(0), 0, status, message)
            }
        };
        emitter.emit(report.clone());
        report
    }

    async fn transfer(
        &self,
        request: &TransferRequest,
        token: &CancellationToken,
        emitter: &ProgressEmitter,
        stats: &TransferStatsTracker,
    ) -> Result<StatusReport> {
        let id = request.artifact_id.as_str();
        let kind = self.storage.kind();

        let resumable = match request.mode {
            TransferMode::Resume => self
                .metadata
                .load(id)
                .await?
                .filter(|r| r.total_bytes > 0 && r.backend == kind),
            TransferMode::Fresh => None,
        };

        let (total, downloaded, recorded_chunk_size) = if let Some(record) = resumable {
            let total = record.total_bytes;
            let downloaded = self.storage.current_size(id).await?;
            if downloaded > total {
                log::error!(
                    "'{id}' holds {downloaded} bytes but expects {total}; start a fresh download to discard them"
                );
                return Err(Error::SizeMismatch {
                    expected: total,
                    actual: downloaded,
                });
            }
            log::info!("Resuming '{id}' at {downloaded} of {total} bytes");
            (total, downloaded, record.chunk_size)
        } else {
            self.storage.delete(id).await?;
            let total = cancellable(token, self.content_length(request)).await??;
            log::info!("Starting '{id}': {}", format_bytes(total));
            (total, 0, 0)
        };
        let chunk_size = match kind {
            BackendKind::File => 0,
            BackendKind::Chunked if recorded_chunk_size > 0 => {
                if recorded_chunk_size != self.config.chunk_size {
                    log::info!(
                        "Keeping chunk size {recorded_chunk_size} of '{id}' (configured {})",
                        self.config.chunk_size
                    );
                }
                recorded_chunk_size
            }
            BackendKind::Chunked => self.config.chunk_size,
        };
        stats.set_resumed_from(downloaded);

        let record = self
            .metadata
            .update(id, kind, |r| {
                r.total_bytes = total;
                r.downloaded_bytes = downloaded;
                r.status = ArtifactStatus::Downloading;
                r.last_error = None;
                r.url = Some(request.url.clone());
                r.backend = kind;
                r.chunk_size = chunk_size;
            })
            .await?;
        emitter.emit(record.report());

        let attempt = Attempt {
            request,
            token,
            emitter,
            stats,
            total,
            chunk_size,
        };
        match kind {
            BackendKind::File => self.stream_file(&attempt, downloaded).await?,
            BackendKind::Chunked => {
                self.fetch_chunks(&attempt, downloaded).await?;
                let record = self
                    .metadata
                    .update(id, kind, |r| r.status = ArtifactStatus::Consolidating)
                    .await?;
                emitter.emit(record.report());
            }
        }

        let measured = self.storage.finalize(id, total).await?;
        if measured != total {
            return Err(Error::SizeMismatch {
                expected: total,
                actual: measured,
            });
        }

        let record = self
            .metadata
            .update(id, kind, |r| {
                r.status = ArtifactStatus::Completed;
                r.downloaded_bytes = total;
                r.last_error = None;
            })
            .await?;
        let report = record.report();
        emitter.emit(report.clone());
        Ok(report)
    }

    /// Issues the HEAD request and returns the announced length.
    async fn content_length(&self, request: &TransferRequest) -> Result<u64> {
        let response = self
            .client
            .head(&request.url)
            .bearer_auth(&request.auth_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network {
                status,
                url: request.url.clone(),
            });
        }

        // Read the header directly: the body of a HEAD response is empty, so
        // the length hint derived from it is always zero.
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|&len| len > 0)
            .ok_or_else(|| Error::SizeUnknown {
                url: request.url.clone(),
            })
    }

    /// File path: one open-ended ranged GET streamed straight into the file.
    async fn stream_file(&self, attempt: &Attempt<'_>, mut offset: u64) -> Result<()> {
        if offset >= attempt.total {
            return Ok(());
        }
        let request = attempt.request;

        let response = cancellable(
            attempt.token,
            self.client
                .get(&request.url)
                .bearer_auth(&request.auth_token)
                .header(RANGE, format!("bytes={offset}-"))
                .send(),
        )
        .await??;

        let status = response.status();
        if status == StatusCode::OK && offset > 0 {
            log::warn!(
                "Server ignored Range for '{}'; restarting from byte 0",
                attempt.id()
            );
            offset = 0;
        } else if !status.is_success() {
            return Err(Error::Network {
                status,
                url: request.url.clone(),
            });
        } else if status == StatusCode::PARTIAL_CONTENT
            && content_range_start(response.headers()).is_some_and(|start| start != offset)
        {
            return Err(Error::RangeIgnored {
                url: request.url.clone(),
            });
        }

        let remaining = usize::try_from(attempt.total - offset).unwrap_or(usize::MAX);
        let mut buffer = BytesMut::with_capacity(self.config.write_buffer_size.min(remaining));
        let mut flushed = offset;
        let mut body = response.bytes_stream();

        loop {
            let item = tokio::select! {
                biased;
                () = attempt.token.cancelled() => {
                    self.flush(attempt.id(), &mut flushed, &mut buffer).await?;
                    return Err(Error::Cancelled);
                }
                item = body.next() => item,
            };
            let Some(item) = item else { break };

            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.flush(attempt.id(), &mut flushed, &mut buffer).await?;
                    return Err(e.into());
                }
            };

            let received = flushed + buffer.len() as u64 + bytes.len() as u64;
            if received > attempt.total {
                self.flush(attempt.id(), &mut flushed, &mut buffer).await?;
                return Err(Error::SizeMismatch {
                    expected: attempt.total,
                    actual: received,
                });
            }

            buffer.extend_from_slice(&bytes);
            attempt.stats.record_bytes(bytes.len() as u64);
            attempt.in_flight(received);

            if buffer.len() >= self.config.write_buffer_size {
                self.flush(attempt.id(), &mut flushed, &mut buffer).await?;
            }
        }

        self.flush(attempt.id(), &mut flushed, &mut buffer).await
    }

    /// Writes the buffered bytes at `flushed` and records the new durable count.
    async fn flush(&self, id: &str, flushed: &mut u64, buffer: &mut BytesMut) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.storage.write(id, *flushed, buffer).await?;
        *flushed += buffer.len() as u64;
        buffer.clear();

        let durable = *flushed;
        self.metadata
            .update(id, self.storage.kind(), |r| r.downloaded_bytes = durable)
            .await?;
        Ok(())
    }

    /// Chunk path: one bounded ranged GET per chunk, each stored whole.
    ///
    /// Progress is reported per stored chunk, so the reported count never
    /// runs ahead of what a pause would keep.
    async fn fetch_chunks(&self, attempt: &Attempt<'_>, mut downloaded: u64) -> Result<()> {
        let chunk_size = attempt.chunk_size;
        let mut chunk_index = downloaded / chunk_size;

        while downloaded < attempt.total {
            if attempt.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let end = downloaded.saturating_add(chunk_size).min(attempt.total);
            let data = cancellable(attempt.token, self.fetch_range(attempt, downloaded, end)).await??;

            self.storage.write(attempt.id(), downloaded, &data).await?;
            downloaded += data.len() as u64;

            let durable = downloaded;
            let record = self
                .metadata
                .update(attempt.id(), BackendKind::Chunked, |r| {
                    r.downloaded_bytes = durable;
                })
                .await?;
            attempt.emitter.emit(record.report());
            log::debug!(
                "Stored chunk {chunk_index} of '{}' ({downloaded}/{} bytes)",
                attempt.id(),
                attempt.total
            );
            chunk_index += 1;
        }
        Ok(())
    }

    /// Fetches bytes `start..end` and returns them only if complete.
    async fn fetch_range(&self, attempt: &Attempt<'_>, start: u64, end: u64) -> Result<Bytes> {
        let request = attempt.request;
        let response = self
            .client
            .get(&request.url)
            .bearer_auth(&request.auth_token)
            .header(RANGE, format!("bytes={start}-{}", end - 1))
            .send()
            .await?;

        let status = response.status();
        let whole_body = start == 0 && end == attempt.total;
        if status == StatusCode::OK && !whole_body {
            return Err(Error::RangeIgnored {
                url: request.url.clone(),
            });
        }
        if !status.is_success() {
            return Err(Error::Network {
                status,
                url: request.url.clone(),
            });
        }
        if status == StatusCode::PARTIAL_CONTENT
            && content_range_start(response.headers()).is_some_and(|s| s != start)
        {
            return Err(Error::RangeIgnored {
                url: request.url.clone(),
            });
        }

        let expected = end - start;
        let mut buf = BytesMut::with_capacity(usize::try_from(expected).unwrap_or(0));
        let mut body = response.bytes_stream();
        while let Some(item) = body.next().await {
            if attempt.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let bytes = item?;
            let len = buf.len() as u64 + bytes.len() as u64;
            if len > expected {
                return Err(Error::SizeMismatch {
                    expected,
                    actual: len,
                });
            }
            buf.extend_from_slice(&bytes);
            attempt.stats.record_bytes(bytes.len() as u64);
        }

        // Paused while the final buffer arrived.
        if attempt.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if (buf.len() as u64) < expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: buf.len() as u64,
            });
        }
        Ok(buf.freeze())
    }
}
