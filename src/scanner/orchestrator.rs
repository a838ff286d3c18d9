//! Per-item scan state machine.
//!
//! `claim-cache` -> `download` -> `hash-check` -> `classify` ->
//! `resolve-cache`. Every claim taken here is settled exactly once: by
//! `resolve`, by `fail`, or by the token's drop when the scan is cancelled.

use std::time::Instant;

use tracing::{debug, warn};

use super::classify::{classify_payload, PayloadVerdict};
use super::context::{ScanContext, ScanJob};
use super::models::{ItemOutcome, ItemResult, ItemStatus, SkipReason};
use crate::collector::MediaWorkItem;
use crate::download_manager::{
    DownloadError, DownloadErrorKind, DownloadFailure, FetchRequest, LocalPayload, UrlRefresher,
};
use crate::limits::Resource;
use crate::verdict_cache::{CacheError, ClaimToken, Reservation, Verdict, VerdictCache, VerdictSource};

/// Outcome of a claim once any in-flight computation has settled.
enum Claimed {
    Settled(Verdict),
    Owner(ClaimToken),
    Failed(CacheError),
}

/// Claims `key`, waiting on another owner if there is one. A waiter whose
/// owner was cancelled claims again once.
async fn claim_or_wait(cache: &VerdictCache, key: &str) -> Claimed {
    let mut retried = false;
    loop {
        match cache.claim(key) {
            Reservation::Ready(verdict) => return Claimed::Settled(verdict),
            Reservation::Owner(token) => return Claimed::Owner(token),
            Reservation::Pending(waiter) => {
                match waiter.wait().await {
                    Ok(verdict) => return Claimed::Settled(verdict),
                    Err(CacheError::Cancelled | CacheError::Abandoned) if !retried => {
                        debug!(cache_key = %key, "Owner went away, claiming again");
                        retried = true;
                    }
                    Err(error) => return Claimed::Failed(error),
                }
            }
        }
    }
}

async fn download(
    ctx: &ScanContext,
    job: &ScanJob,
    item: &MediaWorkItem,
) -> Result<LocalPayload, DownloadFailure> {
    let _permit = ctx
        .pool
        .acquire(&job.tenant_id, Resource::Download, job.limits)
        .await
        .map_err(|e| DownloadFailure {
            error: DownloadError::new(DownloadErrorKind::Throttled, "", e.to_string()),
            attempted_urls: Vec::new(),
            refreshed: false,
        })?;
    let urls = item.candidate_urls();
    let refresher = ctx.collector.refresher_for(item);
    ctx.fetcher
        .fetch_with_fallbacks(
            FetchRequest {
                urls: &urls,
                cap: job.limits.download_cap_bytes,
                ext_hint: item.extension_hint.as_deref(),
                prefer_video: item.prefer_video,
            },
            &ctx.fallback,
            refresher.as_ref().map(|r| r as &dyn UrlRefresher),
        )
        .await
}

fn skip_reason(failure: &DownloadFailure) -> SkipReason {
    if failure.error.kind == DownloadErrorKind::Throttled {
        SkipReason::Exception
    } else if failure.attempted_urls.is_empty() {
        SkipReason::MissingSource
    } else if failure.error.is_restricted() {
        SkipReason::DownloadRestricted
    } else {
        SkipReason::HttpError
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Result for a verdict that came out of the cache. Flagged verdicts still
/// need the media as evidence, so it is downloaded unless already at hand.
async fn cached(
    ctx: &ScanContext,
    job: &ScanJob,
    item: &MediaWorkItem,
    verdict: Verdict,
    payload: Option<LocalPayload>,
) -> ItemOutcome {
    let evidence = if !verdict.is_flagged {
        None
    } else if payload.is_some() {
        payload
    } else {
        match download(ctx, job, item).await {
            Ok(payload) => Some(payload),
            Err(failure) => {
                debug!(item = %item.label, "Evidence download failed: {}", failure);
                None
            }
        }
    };
    ItemOutcome {
        result: ItemResult::new(item, ItemStatus::Cached, Some(verdict)),
        evidence,
    }
}

fn from_cache_error(item: &MediaWorkItem, error: CacheError) -> ItemResult {
    match error {
        CacheError::Failed(message) => {
            let (reason, detail) = SkipReason::from_failure_message(&message);
            ItemResult::skipped(item, reason, detail)
        }
        other => ItemResult::skipped(item, SkipReason::Exception, other.to_string()),
    }
}

fn fail_claims(ctx: &ScanContext, tokens: Vec<ClaimToken>, message: &str) {
    for token in tokens {
        ctx.cache.fail(token, CacheError::failed(message));
    }
}

fn resolve_claims(ctx: &ScanContext, tokens: Vec<ClaimToken>, verdict: &Verdict) {
    for token in tokens {
        ctx.cache.resolve(token, verdict.clone());
    }
}

/// Runs one work item to a terminal state.
pub(crate) async fn scan_item(ctx: &ScanContext, job: &ScanJob, item: &MediaWorkItem) -> ItemOutcome {
    let started = Instant::now();
    let mut outcome = run(ctx, job, item).await;
    outcome.result.duration_ms = started.elapsed().as_millis() as u64;
    debug!(
        item = %item.label,
        cache_key = %item.cache_key(),
        status = outcome.result.status.label(),
        duration_ms = outcome.result.duration_ms,
        "Item scanned"
    );
    outcome
}

async fn run(ctx: &ScanContext, job: &ScanJob, item: &MediaWorkItem) -> ItemOutcome {
    let url_token = match claim_or_wait(&ctx.cache, item.cache_key()).await {
        Claimed::Settled(verdict) => return cached(ctx, job, item, verdict, None).await,
        Claimed::Failed(error) => return ItemOutcome::done(from_cache_error(item, error)),
        Claimed::Owner(token) => token,
    };

    let payload = match download(ctx, job, item).await {
        Ok(payload) => payload,
        Err(failure) => {
            let reason = skip_reason(&failure);
            let detail = failure.error.to_string();
            if reason == SkipReason::HttpError {
                let host = host_of(&failure.error.url);
                if ctx.diagnostics.should_emit(&format!("http_error:{}", host)) {
                    warn!(
                        host = %host,
                        attempts = failure.attempted_urls.len(),
                        refreshed = failure.refreshed,
                        "Media download failed: {}",
                        failure.error
                    );
                }
            }
            fail_claims(ctx, vec![url_token], &reason.failure_message(&detail));
            return ItemOutcome::done(ItemResult::skipped(item, reason, detail));
        }
    };

    let hash_key = format!("sha256::{}", payload.sha256);
    let mut tokens = vec![url_token];
    match claim_or_wait(&ctx.cache, &hash_key).await {
        Claimed::Settled(verdict) => {
            debug!(item = %item.label, "Byte-identical media already classified");
            resolve_claims(ctx, tokens, &verdict);
            return cached(ctx, job, item, verdict, Some(payload)).await;
        }
        Claimed::Failed(error) => {
            let result = from_cache_error(item, error);
            if let ItemStatus::Skipped { reason, detail } = &result.status {
                fail_claims(ctx, tokens, &reason.failure_message(detail));
            }
            return ItemOutcome::done(result);
        }
        Claimed::Owner(token) => tokens.push(token),
    }

    let mut verdict = match classify_payload(ctx, job, item, &payload).await {
        Ok(PayloadVerdict::Verdict(verdict)) => verdict,
        Ok(PayloadVerdict::Unsupported(mime)) => {
            let mut verdict = Verdict::clean("unsupported_type");
            verdict.metrics.source = VerdictSource::Unsupported;
            verdict.metrics.bytes_downloaded = payload.len();
            resolve_claims(ctx, tokens, &verdict);
            let mut result = ItemResult::skipped(item, SkipReason::UnsupportedType, mime);
            result.verdict = Some(verdict);
            return ItemOutcome::done(result);
        }
        Err(e) => {
            let detail = e.to_string();
            if ctx.diagnostics.should_emit(&format!("exception:{}", item.source.as_str())) {
                warn!(item = %item.label, "Media classification failed: {}", detail);
            }
            fail_claims(ctx, tokens, &SkipReason::Exception.failure_message(&detail));
            return ItemOutcome::done(ItemResult::skipped(item, SkipReason::Exception, detail));
        }
    };

    verdict.metrics.bytes_downloaded = payload.len();
    verdict.metrics.download_ms = payload.telemetry.probe_ms + payload.telemetry.stream_ms;
    resolve_claims(ctx, tokens, &verdict);

    if verdict.is_flagged {
        ItemOutcome {
            result: ItemResult::new(item, ItemStatus::Flagged, Some(verdict)),
            evidence: Some(payload),
        }
    } else {
        ItemOutcome::done(ItemResult::new(item, ItemStatus::Clean, Some(verdict)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict_cache::VerdictCacheConfig;

    fn failure(error: DownloadError, attempted: usize) -> DownloadFailure {
        DownloadFailure {
            error,
            attempted_urls: (0..attempted).map(|i| format!("https://x/{}", i)).collect(),
            refreshed: false,
        }
    }

    #[test]
    fn test_skip_reasons() {
        assert_eq!(
            skip_reason(&failure(DownloadError::too_large("u", 10, 5), 1)),
            SkipReason::DownloadRestricted
        );
        assert_eq!(
            skip_reason(&failure(DownloadError::from_status(503, "u"), 2)),
            SkipReason::HttpError
        );
        assert_eq!(
            skip_reason(&failure(
                DownloadError::new(DownloadErrorKind::InvalidUrl, "", "none"),
                0
            )),
            SkipReason::MissingSource
        );
        assert_eq!(
            skip_reason(&failure(
                DownloadError::new(DownloadErrorKind::Throttled, "", "download budget is closed"),
                0
            )),
            SkipReason::Exception
        );
    }

    #[tokio::test]
    async fn test_waiter_sees_owner_outcome() {
        let cache = VerdictCache::new(VerdictCacheConfig::default());
        let Claimed::Owner(token) = claim_or_wait(&cache, "k").await else {
            panic!("first claim must own the key");
        };

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                match claim_or_wait(&cache, "k").await {
                    Claimed::Settled(v) => Some(v),
                    _ => None,
                }
            })
        };
        tokio::task::yield_now().await;
        cache.resolve(token, Verdict::clean("classifier"));

        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(seen.reason, "classifier");
    }

    #[tokio::test]
    async fn test_waiter_reclaims_after_cancelled_owner() {
        let cache = VerdictCache::new(VerdictCacheConfig::default());
        let Reservation::Owner(token) = cache.claim("k") else {
            panic!("first claim must own the key");
        };

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { claim_or_wait(&cache, "k").await })
        };
        tokio::task::yield_now().await;
        drop(token);

        assert!(matches!(waiter.await.unwrap(), Claimed::Owner(_)));
    }

    #[tokio::test]
    async fn test_failure_reaches_waiters_with_reason() {
        let cache = VerdictCache::new(VerdictCacheConfig::default());
        let Reservation::Owner(token) = cache.claim("k") else {
            panic!("first claim must own the key");
        };
        let Reservation::Pending(waiter) = cache.claim("k") else {
            panic!("second claim must wait");
        };
        cache.fail(
            token,
            CacheError::failed(SkipReason::HttpError.failure_message("HTTP 500")),
        );

        let item = MediaWorkItem::new(
            crate::collector::MediaSource::Embed,
            "x",
            "https://x/a.png",
            Default::default(),
        );
        let result = from_cache_error(&item, waiter.wait().await.unwrap_err());
        assert_eq!(
            result.status,
            ItemStatus::Skipped {
                reason: SkipReason::HttpError,
                detail: "HTTP 500".to_string()
            }
        );
    }
}
