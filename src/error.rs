use std::path::{Path, PathBuf};

use reqwest::StatusCode;

/// Failure kinds for a VOD download run.
///
/// Transient variants are retried inside the worker (see [`crate::retry`]);
/// every other variant terminates the task that produced it and is surfaced
/// to the join, where the first terminal error wins.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid playlist: {reason}")]
    InvalidPlaylist { reason: String },

    #[error("unsupported tag `{tag}` on line {line}")]
    UnsupportedTag { tag: String, line: usize },

    #[error("No segments found in playlist")]
    EmptyPlaylist,

    #[error("failed to fetch decryption key {uri}: {reason}")]
    KeyFetchFailed { uri: String, reason: String },

    #[error("decryption key from {uri} has length {len}, expected 16")]
    KeyLengthInvalid { uri: String, len: usize },

    #[error("decryption key for segment {index} was never populated")]
    KeyMissing { index: u64 },

    #[error("transient fetch failure: {reason}")]
    FetchTransient { reason: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("segment {index} failed: {reason}")]
    SegmentFailed { index: u64, reason: String },

    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    #[error("I/O error at {path}: {source}")]
    IOFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("segment file for index {index} is missing")]
    MissingSegment { index: u64 },

    #[error("download cancelled")]
    Cancelled,

    #[error("interrupted while waiting on the pipeline")]
    Interrupted,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl DownloadError {
    pub fn invalid_playlist(reason: impl Into<String>) -> Self {
        Self::InvalidPlaylist {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::IOFailed {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this failure is safe to retry.
    ///
    /// Socket resets, timeouts and server-side (5xx) responses are transient;
    /// everything else is terminal for the attempt that produced it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FetchTransient { .. } => true,
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Whether this failure represents cooperative cancellation rather than a
    /// genuine fault. Cancellation outcomes terminate the run as CANCELLED,
    /// not ERROR.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Interrupted)
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, and body read errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
