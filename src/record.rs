//! Persisted per-artifact state and the status reports derived from it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::format::format_bytes;
use crate::storage::BackendKind;

/// Lifecycle state of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArtifactStatus {
    /// No transfer has been attempted.
    #[default]
    NotStarted,
    /// A transfer loop is (or was, before a crash) receiving bytes.
    Downloading,
    /// The user paused the transfer.
    Paused,
    /// Chunks are being merged into the final artifact.
    Consolidating,
    /// The artifact is complete and verified.
    Completed,
    /// The last attempt failed; see `last_error`.
    Error,
}

impl ArtifactStatus {
    /// Lowercase name used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Consolidating => "consolidating",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Opaque artifact identifier.
    pub artifact_id: String,
    /// Length announced by the server's HEAD response; 0 until known.
    pub total_bytes: u64,
    /// Bytes durably written to the backend.
    pub downloaded_bytes: u64,
    /// Current lifecycle state.
    pub status: ArtifactStatus,
    /// Message of the last failure, if the status is `Error`.
    pub last_error: Option<String>,
    /// URL of the last transfer attempt.
    pub url: Option<String>,
    /// Backend that holds the bytes.
    pub backend: BackendKind,
    /// Chunk size the stored chunks were cut with; 0 for file-backed records.
    #[serde(default)]
    pub chunk_size: u64,
    /// Time of the last persisted change.
    pub updated_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Creates an empty record for an artifact that has never been transferred.
    #[must_use]
    pub fn new(artifact_id: &str, backend: BackendKind) -> Self {
        Self {
            artifact_id: artifact_id.to_string(),
            total_bytes: 0,
            downloaded_bytes: 0,
            status: ArtifactStatus::NotStarted,
            last_error: None,
            url: None,
            backend,
            chunk_size: 0,
            updated_at: Utc::now(),
        }
    }

    /// Builds the report for this record as persisted.
    #[must_use]
    pub fn report(&self) -> StatusReport {
        if self.status == ArtifactStatus::Completed {
            return StatusReport::completed(self.total_bytes);
        }
        StatusReport::new(
            self.downloaded_bytes,
            self.total_bytes,
            self.status,
            self.last_error.clone(),
        )
    }
}

/// Snapshot of an artifact's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Bytes received so far.
    pub downloaded_bytes: u64,
    /// Total length, or 0 if not yet known.
    pub total_bytes: u64,
    /// Completion in percent, 0 to 100.
    pub percent: f64,
    /// Lifecycle state.
    pub status: ArtifactStatus,
    /// Failure message when `status` is `Error`.
    pub error: Option<String>,
}

impl StatusReport {
    /// Creates a report, computing the percentage from the byte counts.
    #[must_use]
    pub fn new(
        downloaded_bytes: u64,
        total_bytes: u64,
        status: ArtifactStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            downloaded_bytes,
            total_bytes,
            percent: percent(downloaded_bytes, total_bytes),
            status,
            error,
        }
    }

    /// Report for a finished artifact of `total_bytes`.
    #[must_use]
    pub const fn completed(total_bytes: u64) -> Self {
        Self {
            downloaded_bytes: total_bytes,
            total_bytes,
            percent: 100.0,
            status: ArtifactStatus::Completed,
            error: None,
        }
    }

    /// Report for an artifact without a record.
    #[must_use]
    pub const fn not_started() -> Self {
        Self {
            downloaded_bytes: 0,
            total_bytes: 0,
            percent: 0.0,
            status: ArtifactStatus::NotStarted,
            error: None,
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} ({:.1}%) {}",
            format_bytes(self.downloaded_bytes),
            format_bytes(self.total_bytes),
            self.percent,
            self.status
        )?;
        if let Some(ref error) = self.error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}

/// Percentage of `total` covered by `downloaded`, clamped to 0..=100.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percent(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (downloaded as f64 / total as f64 * 100.0).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_unknown_total() {
        assert!((percent(10, 0) - 0.0).abs() < f64::EPSILON);
        assert!((percent(5, 10) - 50.0).abs() < f64::EPSILON);
        assert!((percent(20, 10) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn completed_record_reports_full_progress() {
        let mut record = ArtifactRecord::new("model", BackendKind::File);
        record.total_bytes = 1000;
        record.downloaded_bytes = 10;
        record.status = ArtifactStatus::Completed;

        let report = record.report();
        assert_eq!(report.downloaded_bytes, 1000);
        assert!((report.percent - 100.0).abs() < f64::EPSILON);
        assert!(report.error.is_none());
    }

    #[test]
    fn error_record_keeps_message() {
        let mut record = ArtifactRecord::new("model", BackendKind::Chunked);
        record.total_bytes = 400;
        record.downloaded_bytes = 100;
        record.status = ArtifactStatus::Error;
        record.last_error = Some("HTTP 503".into());

        let report = record.report();
        assert_eq!(report.status, ArtifactStatus::Error);
        assert!((report.percent - 25.0).abs() < f64::EPSILON);
        assert_eq!(report.error.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn record_round_trips_through_toml() {
        let mut record = ArtifactRecord::new("org/model:q4", BackendKind::Chunked);
        record.total_bytes = 15 * 1024 * 1024;
        record.downloaded_bytes = 10 * 1024 * 1024;
        record.status = ArtifactStatus::Paused;
        record.url = Some("https://models.example/q4.bin".into());
        record.chunk_size = 5 * 1024 * 1024;

        let toml_str = toml::to_string(&record).unwrap();
        let loaded: ArtifactRecord = toml::from_str(&toml_str).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn record_without_chunk_size_loads_as_zero() {
        let loaded: ArtifactRecord = toml::from_str(
            r#"
            artifact_id = "m"
            total_bytes = 10
            downloaded_bytes = 4
            status = "Paused"
            backend = "chunked"
            updated_at = "2026-01-01T00:00:00Z"
            "#,
        )
        .unwrap();
        assert_eq!(loaded.chunk_size, 0);
        assert_eq!(loaded.status, ArtifactStatus::Paused);
    }

    #[test]
    fn report_display() {
        let report = StatusReport::new(512, 1024, ArtifactStatus::Paused, None);
        assert_eq!(report.to_string(), "512 B / 1.00 KB (50.0%) paused");

        let report = StatusReport::new(0, 0, ArtifactStatus::Error, Some("boom".into()));
        assert_eq!(report.to_string(), "0 B / 0 B (0.0%) error: boom");
    }
}
