//! Data models for the download manager.
//!
//! Defines the download error taxonomy, local payloads and transfer telemetry.

use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Type of error encountered while fetching a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadErrorKind {
    AuthOrExpired, // 401/403 - signed URL expired, try next URL then refresh
    NotFound,      // 404 - try next URL then refresh
    Http,          // Any other non-success status
    Timeout,       // Probe or stream timed out
    Connection,    // Connect/reset/body errors
    TooLarge,      // Declared or streamed size over the cap
    Storage,       // Local temp file errors
    InvalidUrl,    // Not an absolute http(s) URL
    Throttled,     // No download permit could be taken
}

impl DownloadErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadErrorKind::AuthOrExpired => "auth_or_expired",
            DownloadErrorKind::NotFound => "not_found",
            DownloadErrorKind::Http => "http",
            DownloadErrorKind::Timeout => "timeout",
            DownloadErrorKind::Connection => "connection",
            DownloadErrorKind::TooLarge => "too_large",
            DownloadErrorKind::Storage => "storage",
            DownloadErrorKind::InvalidUrl => "invalid_url",
            DownloadErrorKind::Throttled => "throttled",
        }
    }
}

/// A failed fetch of one URL.
#[derive(Debug, Clone, Error)]
#[error("{} fetching {url}: {message}", .kind.as_str())]
pub struct DownloadError {
    pub kind: DownloadErrorKind,
    pub status: Option<u16>,
    pub url: String,
    pub message: String,
}

impl DownloadError {
    pub fn new(kind: DownloadErrorKind, url: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Maps a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: u16, url: &str) -> Self {
        let kind = match status {
            401 | 403 => DownloadErrorKind::AuthOrExpired,
            404 => DownloadErrorKind::NotFound,
            _ => DownloadErrorKind::Http,
        };
        Self {
            kind,
            status: Some(status),
            url: url.to_string(),
            message: format!("HTTP {}", status),
        }
    }

    pub fn from_reqwest(error: &reqwest::Error, url: &str) -> Self {
        if let Some(status) = error.status() {
            return Self::from_status(status.as_u16(), url);
        }
        let kind = if error.is_timeout() {
            DownloadErrorKind::Timeout
        } else {
            DownloadErrorKind::Connection
        };
        Self::new(kind, url, error.to_string())
    }

    pub fn too_large(url: &str, bytes: u64, cap: u64) -> Self {
        Self::new(
            DownloadErrorKind::TooLarge,
            url,
            format!("{} bytes exceeds limit of {} bytes", bytes, cap),
        )
    }

    pub fn http_status(&self) -> Option<u16> {
        self.status
    }

    /// True for failures that may succeed against a different URL for the
    /// same media: auth/expiry, not-found, server errors and network errors.
    pub fn is_chain_fallback(&self) -> bool {
        match self.kind {
            DownloadErrorKind::AuthOrExpired
            | DownloadErrorKind::NotFound
            | DownloadErrorKind::Timeout
            | DownloadErrorKind::Connection => true,
            DownloadErrorKind::Http => self.status.is_some_and(|s| s >= 500),
            DownloadErrorKind::TooLarge
            | DownloadErrorKind::Storage
            | DownloadErrorKind::InvalidUrl
            | DownloadErrorKind::Throttled => false,
        }
    }

    /// Expected, non-escalated restriction (size cap).
    pub fn is_restricted(&self) -> bool {
        self.kind == DownloadErrorKind::TooLarge
    }
}

/// Timing and size numbers for one successful fetch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadTelemetry {
    pub probe_ms: u64,
    pub stream_ms: u64,
    pub bytes: u64,
    pub declared_size: Option<u64>,
    pub chunk_size: usize,
    /// URLs tried before this one succeeded, plus one.
    pub attempts: usize,
    pub used_motion_variant: bool,
    pub refreshed: bool,
}

/// Downloaded media in a temp file. The file is deleted when this is
/// dropped, so every failure and cancellation path cleans up.
#[derive(Debug)]
pub struct LocalPayload {
    pub file: NamedTempFile,
    pub resolved_url: String,
    pub sha256: String,
    pub content_type: Option<String>,
    pub telemetry: DownloadTelemetry,
}

impl LocalPayload {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.telemetry.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.telemetry.bytes == 0
    }
}

/// Every URL in the chain failed.
#[derive(Debug, Clone, Error)]
#[error("all {} candidate URLs failed, last error: {error}", .attempted_urls.len())]
pub struct DownloadFailure {
    pub error: DownloadError,
    pub attempted_urls: Vec<String>,
    pub refreshed: bool,
}
