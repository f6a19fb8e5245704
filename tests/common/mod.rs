//! Shared fixtures for the end-to-end transfer tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use artifact_dl::{
    AppConfig, BackendPreference, DownloadConfig, DownloadManager, PathConfig, ProgressEvent,
    ProgressSink,
};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const TOKEN: &str = "secret-token";
pub const ARTIFACT_PATH: &str = "/models/artifact.bin";
pub const MIB: usize = 1024 * 1024;

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 256).unwrap())
        .collect()
}

/// Serves `body` honoring `HEAD` and single `Range` requests.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    honor_range: bool,
}

impl RangeResponder {
    pub fn new(body: &[u8]) -> Self {
        Self {
            body: Arc::new(body.to_vec()),
            honor_range: true,
        }
    }

    /// Answers every GET with the whole body and status 200.
    pub fn ignoring_range(body: &[u8]) -> Self {
        Self {
            honor_range: false,
            ..Self::new(body)
        }
    }

    fn requested_range(&self, request: &Request) -> Option<(usize, usize)> {
        let len = self.body.len();
        let value = request.headers.get("range")?.to_str().ok()?;
        let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
        let start: usize = start.parse().ok()?;
        let end = if end.is_empty() {
            len - 1
        } else {
            end.parse::<usize>().ok()?.min(len - 1)
        };
        (start <= end).then_some((start, end))
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len();
        if request.method.as_str() == "HEAD" {
            return ResponseTemplate::new(200)
                .insert_header("content-length", len.to_string())
                .set_body_bytes(self.body.to_vec());
        }
        match self.requested_range(request).filter(|_| self.honor_range) {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header("content-range", format!("bytes {start}-{end}/{len}"))
                .set_body_bytes(self.body[start..=end].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.to_vec()),
        }
    }
}

/// Mounts a responder for `body` that requires the bearer token.
pub async fn serve(server: &MockServer, responder: RangeResponder) {
    Mock::given(path(ARTIFACT_PATH))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .respond_with(responder)
        .mount(server)
        .await;
}

pub fn artifact_url(server: &MockServer) -> String {
    format!("{}{ARTIFACT_PATH}", server.uri())
}

pub async fn manager(dir: &TempDir, download: DownloadConfig) -> Arc<DownloadManager> {
    let config = AppConfig {
        download,
        paths: PathConfig::new(dir.path()),
    };
    Arc::new(DownloadManager::new(config).await.unwrap())
}

pub fn chunked(chunk_size: u64) -> DownloadConfig {
    DownloadConfig::default()
        .with_backend(BackendPreference::Chunked)
        .with_chunk_size(chunk_size)
}

pub fn file_backed(write_buffer_size: usize) -> DownloadConfig {
    DownloadConfig::default()
        .with_backend(BackendPreference::File)
        .with_write_buffer_size(write_buffer_size)
}

/// Range headers of every GET the server has seen, in order.
pub async fn get_ranges(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .map(|r| {
            r.headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

pub async fn head_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "HEAD")
        .count()
}

/// Pauses the transfer the first time progress passes `threshold` bytes.
pub struct PauseAfter {
    manager: Arc<DownloadManager>,
    artifact_id: String,
    threshold: u64,
    fired: AtomicBool,
}

impl PauseAfter {
    pub fn new(manager: &Arc<DownloadManager>, artifact_id: &str, threshold: u64) -> Arc<Self> {
        Arc::new(Self {
            manager: Arc::clone(manager),
            artifact_id: artifact_id.to_string(),
            threshold,
            fired: AtomicBool::new(false),
        })
    }
}

impl ProgressSink for PauseAfter {
    fn on_event(&self, event: &ProgressEvent) {
        if event.report.downloaded_bytes > self.threshold && !self.fired.swap(true, Ordering::SeqCst)
        {
            self.manager.pause(&self.artifact_id);
        }
    }
}

/// Serves the HEAD request only, with no usable length.
pub async fn serve_head_without_length(server: &MockServer) {
    Mock::given(method("HEAD"))
        .and(path(ARTIFACT_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}
