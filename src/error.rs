//! Error types for the artifact-dl library.

use thiserror::Error;

/// Errors that can occur while transferring or storing an artifact.
///
/// Every variant except [`Error::Cancelled`] leaves the artifact in the
/// `Error` state. A cancellation is a user pause and leaves it `Paused`.
#[derive(Error, Debug)]
pub enum Error {
    /// No bearer token was supplied for a transfer.
    #[error("no auth token supplied for artifact '{artifact_id}'")]
    AuthMissing {
        /// Artifact the transfer was requested for.
        artifact_id: String,
    },

    /// The artifact id is empty.
    #[error("artifact id must not be empty")]
    InvalidArtifactId,

    /// The server answered with a non-success status.
    #[error("server returned HTTP {status} for {url}")]
    Network {
        /// Status code returned by the server.
        status: reqwest::StatusCode,
        /// Requested URL.
        url: String,
    },

    /// The server answered a ranged request with the wrong range.
    #[error("server ignored the requested byte range for {url}")]
    RangeIgnored {
        /// Requested URL.
        url: String,
    },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The HEAD response carried no usable `Content-Length`.
    #[error("server did not report a usable Content-Length for {url}")]
    SizeUnknown {
        /// Requested URL.
        url: String,
    },

    /// The stored artifact does not have the expected length.
    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        /// Length announced by the server.
        expected: u64,
        /// Length actually measured.
        actual: u64,
    },

    /// I/O error during storage operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk consolidation failed.
    #[error("consolidation failed: {0}")]
    Consolidation(String),

    /// A persisted metadata record could not be read or written.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// The configuration file could not be read.
    #[error("config error: {0}")]
    Config(String),

    /// The background transfer task panicked or was aborted.
    #[error("transfer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The transfer was paused by the user.
    #[error("transfer cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if this error is a user pause rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A specialized `Result` type for artifact-dl operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cancelled_is_cancelled() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::InvalidArtifactId.is_cancelled());
        assert!(
            !Error::SizeMismatch {
                expected: 10,
                actual: 9
            }
            .is_cancelled()
        );
    }

    #[test]
    fn messages_are_human_readable() {
        let err = Error::AuthMissing {
            artifact_id: "whisper-large".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "no auth token supplied for artifact 'whisper-large'"
        );

        let err = Error::SizeMismatch {
            expected: 15,
            actual: 14,
        };
        assert_eq!(err.to_string(), "size mismatch: expected 15 bytes, found 14");
    }
}
