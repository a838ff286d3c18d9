//! URL fallback chain.
//!
//! Tries a work item's candidate URLs in order under a [`FallbackPolicy`].
//! When the chain runs out after an auth/expiry failure, the refresher is
//! asked once for freshly signed URLs, which are tried last.

use async_trait::async_trait;
use tracing::debug;

use super::fallback_policy::FallbackPolicy;
use super::fetcher::MediaFetcher;
use super::models::{DownloadError, DownloadErrorKind, DownloadFailure, LocalPayload};
use crate::metrics;

/// Source of freshly signed URLs for media whose URLs expired.
#[async_trait]
pub trait UrlRefresher: Send + Sync {
    /// Current URLs for the media, best first. Empty when unavailable.
    async fn refreshed_urls(&self) -> Vec<String>;
}

/// One item's download request.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub urls: &'a [String],
    pub cap: Option<u64>,
    pub ext_hint: Option<&'a str>,
    pub prefer_video: bool,
}

impl MediaFetcher {
    /// Fetches the first URL of the chain that succeeds.
    pub async fn fetch_with_fallbacks(
        &self,
        request: FetchRequest<'_>,
        policy: &FallbackPolicy,
        refresher: Option<&dyn UrlRefresher>,
    ) -> Result<LocalPayload, DownloadFailure> {
        let mut candidates: Vec<String> = Vec::with_capacity(request.urls.len());
        for url in request.urls {
            if !url.is_empty() && !candidates.contains(url) {
                candidates.push(url.clone());
            }
        }

        let mut attempted: Vec<String> = Vec::new();
        let mut refreshed = false;
        let mut wants_refresh = false;
        let mut last_error: Option<DownloadError> = None;
        let mut next = 0;

        loop {
            if next >= candidates.len() {
                // Chain exhausted; the refresh is the last resort
                let Some(refresher) = refresher.filter(|_| wants_refresh && !refreshed) else {
                    break;
                };
                refreshed = true;
                let fresh: Vec<String> = refresher
                    .refreshed_urls()
                    .await
                    .into_iter()
                    .filter(|url| !url.is_empty() && !candidates.contains(url))
                    .collect();
                if fresh.is_empty() {
                    debug!("URL refresh produced no new candidates");
                    break;
                }
                debug!(count = fresh.len(), "Trying refreshed URLs");
                candidates.extend(fresh);
                continue;
            }

            let url = candidates[next].clone();
            next += 1;
            attempted.push(url.clone());

            match self
                .fetch(&url, request.cap, request.ext_hint, request.prefer_video)
                .await
            {
                Ok(mut payload) => {
                    payload.telemetry.attempts = attempted.len();
                    payload.telemetry.refreshed = refreshed;
                    metrics::record_download("ok", payload.telemetry.bytes);
                    return Ok(payload);
                }
                Err(error) => {
                    // Only an auth/expiry failure at the end of the chain earns a refresh
                    wants_refresh = policy.should_refresh(&error);
                    let fall_back = policy.should_fall_back(&error, attempted.len());
                    debug!(
                        url = %url,
                        kind = error.kind.as_str(),
                        status = ?error.status,
                        fall_back,
                        "Download attempt failed"
                    );
                    last_error = Some(error);
                    if !fall_back {
                        break;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            DownloadError::new(
                DownloadErrorKind::InvalidUrl,
                "",
                "work item has no candidate URLs",
            )
        });
        let result = if error.is_restricted() {
            "restricted"
        } else {
            "failed"
        };
        metrics::record_download(result, 0);
        debug!(
            attempts = attempted.len(),
            refreshed,
            kind = error.kind.as_str(),
            "All download candidates failed"
        );

        Err(DownloadFailure {
            error,
            attempted_urls: attempted,
            refreshed,
        })
    }
}
