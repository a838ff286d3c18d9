//! Fallback policy for failed downloads.
//!
//! Decides whether a failed URL moves on to the next candidate in the chain,
//! whether the owning message should be re-fetched for a freshly signed URL,
//! or whether the item fails immediately.

use crate::download_manager::{DownloadError, DownloadErrorKind};

/// URL-chain fallback policy.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    /// Maximum number of URLs tried per item, refreshed ones included.
    pub max_attempts: usize,
    /// Statuses that move on to the next candidate URL.
    pub chain_statuses: Vec<u16>,
    /// Whether 5xx responses move on to the next candidate URL.
    pub chain_on_server_error: bool,
    /// Whether timeouts and connection failures move on to the next candidate.
    pub chain_on_network_error: bool,
    /// Statuses that make a last-resort URL refresh worthwhile.
    pub refresh_statuses: Vec<u16>,
}

impl FallbackPolicy {
    /// Check if `error` should move on to the next URL, given how many URLs
    /// were already tried.
    pub fn should_fall_back(&self, error: &DownloadError, attempts: usize) -> bool {
        if attempts >= self.max_attempts {
            return false;
        }
        match error.kind {
            DownloadErrorKind::TooLarge
            | DownloadErrorKind::Storage
            | DownloadErrorKind::InvalidUrl
            | DownloadErrorKind::Throttled => false,
            DownloadErrorKind::Timeout | DownloadErrorKind::Connection => {
                self.chain_on_network_error
            }
            DownloadErrorKind::AuthOrExpired
            | DownloadErrorKind::NotFound
            | DownloadErrorKind::Http => match error.http_status() {
                Some(status) if self.chain_statuses.contains(&status) => true,
                Some(status) if status >= 500 => self.chain_on_server_error,
                _ => false,
            },
        }
    }

    /// Check if `error` justifies re-fetching the owning message once.
    pub fn should_refresh(&self, error: &DownloadError) -> bool {
        error
            .http_status()
            .is_some_and(|status| self.refresh_statuses.contains(&status))
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            chain_statuses: vec![401, 403, 404],
            chain_on_server_error: true,
            chain_on_network_error: true,
            refresh_statuses: vec![401, 403, 404],
        }
    }
}
