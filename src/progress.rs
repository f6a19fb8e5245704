//! Progress events and the sinks that receive them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::record::StatusReport;

/// Progress of one artifact at one point in time.
///
/// Within one attempt `downloaded_bytes` never decreases: the file path
/// flushes before reporting a pause or failure, and the chunk path reports
/// only stored chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Artifact the event belongs to.
    pub artifact_id: String,
    /// Byte counts, percentage, status and error.
    #[serde(flatten)]
    pub report: StatusReport,
}

/// Receives progress events for a single transfer.
///
/// Events are delivered synchronously from the transfer loop, so
/// implementations must return quickly.
pub trait ProgressSink: Send + Sync {
    /// Called as bytes arrive (per buffer for files, per stored chunk for
    /// chunks) and on every status change.
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// A null sink that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn on_event(&self, event: &ProgressEvent) {
        let _ = self.send(event.clone());
    }
}

/// Fans events for one artifact out to the per-call sink and to every
/// subscriber of the manager's broadcast channel.
#[derive(Clone)]
pub struct ProgressEmitter {
    artifact_id: String,
    sink: Arc<dyn ProgressSink>,
    broadcast: broadcast::Sender<ProgressEvent>,
}

impl ProgressEmitter {
    /// Creates an emitter for `artifact_id`.
    #[must_use]
    pub fn new(
        artifact_id: &str,
        sink: Arc<dyn ProgressSink>,
        broadcast: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            artifact_id: artifact_id.to_string(),
            sink,
            broadcast,
        }
    }

    /// Delivers `report` to every observer.
    pub fn emit(&self, report: StatusReport) {
        let event = ProgressEvent {
            artifact_id: self.artifact_id.clone(),
            report,
        };
        self.sink.on_event(&event);
        // No subscribers is not an error.
        let _ = self.broadcast.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ArtifactStatus;

    #[test]
    fn no_progress_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoProgress>();
        assert_send_sync::<ProgressEmitter>();
    }

    #[test]
    fn emitter_reaches_sink_and_subscribers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (btx, mut brx) = broadcast::channel(4);
        let emitter = ProgressEmitter::new("m", Arc::new(tx), btx);

        emitter.emit(StatusReport::new(5, 10, ArtifactStatus::Downloading, None));

        let direct = rx.try_recv().unwrap();
        let broadcast = brx.try_recv().unwrap();
        assert_eq!(direct, broadcast);
        assert_eq!(direct.artifact_id, "m");
        assert_eq!(direct.report.downloaded_bytes, 5);
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let (btx, brx) = broadcast::channel(1);
        drop(brx);
        ProgressEmitter::new("m", Arc::new(NoProgress), btx)
            .emit(StatusReport::not_started());
    }

    #[test]
    fn event_serializes_flat() {
        let event = ProgressEvent {
            artifact_id: "m".into(),
            report: StatusReport::completed(42),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["artifact_id"], "m");
        assert_eq!(json["downloaded_bytes"], 42);
        assert_eq!(json["status"], "Completed");
    }
}
