//! Per-item and per-message scan results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::collector::{MediaSource, MediaWorkItem};
use crate::download_manager::LocalPayload;
use crate::limits::PlanTier;
use crate::verdict_cache::Verdict;

/// Why an item was not classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Over the plan's size cap.
    DownloadRestricted,
    /// Every candidate URL failed.
    HttpError,
    /// Payload is not an image, animation or video.
    UnsupportedType,
    /// Decode or classification failed.
    Exception,
    /// Nothing left to download from.
    MissingSource,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DownloadRestricted => "download_restricted",
            SkipReason::HttpError => "http_error",
            SkipReason::UnsupportedType => "unsupported_type",
            SkipReason::Exception => "exception",
            SkipReason::MissingSource => "missing_source",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "download_restricted" => Some(SkipReason::DownloadRestricted),
            "http_error" => Some(SkipReason::HttpError),
            "unsupported_type" => Some(SkipReason::UnsupportedType),
            "exception" => Some(SkipReason::Exception),
            "missing_source" => Some(SkipReason::MissingSource),
            _ => None,
        }
    }

    /// Failure message handed to the verdict cache, so waiters can report
    /// the owner's skip reason.
    pub fn failure_message(&self, detail: &str) -> String {
        format!("{}: {}", self.as_str(), detail)
    }

    /// Inverse of [`SkipReason::failure_message`].
    pub fn from_failure_message(message: &str) -> (Self, String) {
        match message.split_once(": ") {
            Some((reason, detail)) => match Self::parse(reason) {
                Some(reason) => (reason, detail.to_string()),
                None => (SkipReason::Exception, message.to_string()),
            },
            None => (SkipReason::Exception, message.to_string()),
        }
    }
}

/// Terminal state of one work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    /// Verdict came from the cache, by URL key or by content hash.
    Cached,
    Flagged,
    Clean,
    /// Not classified, treated as not flagged.
    Skipped { reason: SkipReason, detail: String },
    /// Stopped because a sibling item was flagged first.
    Cancelled,
}

impl ItemStatus {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            ItemStatus::Cached => "cached",
            ItemStatus::Flagged => "flagged",
            ItemStatus::Clean => "clean",
            ItemStatus::Skipped { reason, .. } => reason.as_str(),
            ItemStatus::Cancelled => "cancelled",
        }
    }
}

/// Result for one work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub label: String,
    pub source: MediaSource,
    pub cache_key: String,
    #[serde(flatten)]
    pub status: ItemStatus,
    pub verdict: Option<Verdict>,
    pub duration_ms: u64,
}

impl ItemResult {
    pub fn new(item: &MediaWorkItem, status: ItemStatus, verdict: Option<Verdict>) -> Self {
        Self {
            label: item.label.clone(),
            source: item.source,
            cache_key: item.cache_key().to_string(),
            status,
            verdict,
            duration_ms: 0,
        }
    }

    pub fn skipped(item: &MediaWorkItem, reason: SkipReason, detail: impl Into<String>) -> Self {
        Self::new(
            item,
            ItemStatus::Skipped {
                reason,
                detail: detail.into(),
            },
            None,
        )
    }

    pub fn cancelled(item: &MediaWorkItem) -> Self {
        Self::new(item, ItemStatus::Cancelled, None)
    }

    pub fn is_flagged(&self) -> bool {
        !matches!(self.status, ItemStatus::Cancelled)
            && self.verdict.as_ref().is_some_and(|v| v.is_flagged)
    }
}

/// Result of one item scan plus the payload kept as evidence.
#[derive(Debug)]
pub(crate) struct ItemOutcome {
    pub result: ItemResult,
    /// Only set for flagged results whose media could be downloaded.
    pub evidence: Option<LocalPayload>,
}

impl ItemOutcome {
    pub fn done(result: ItemResult) -> Self {
        Self {
            result,
            evidence: None,
        }
    }
}

/// Result of scanning one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    /// Correlates the report with the scan's log lines.
    pub scan_id: String,
    pub scanned_at: DateTime<Utc>,
    pub flagged: bool,
    pub tenant_id: String,
    pub plan: PlanTier,
    pub items: Vec<ItemResult>,
}

impl ScanReport {
    pub fn new(scan_id: String, tenant_id: String, plan: PlanTier, items: Vec<ItemResult>) -> Self {
        Self {
            scan_id,
            scanned_at: Utc::now(),
            flagged: items.iter().any(|i| i.is_flagged()),
            tenant_id,
            plan,
            items,
        }
    }

    /// First flagged item, in collection order.
    pub fn flagged_item(&self) -> Option<&ItemResult> {
        self.items.iter().find(|i| i.is_flagged())
    }
}

/// Message-level failures. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("not a scannable media URL: {0}")]
    InvalidUrl(String),

    #[error("scanner setup failed: {0}")]
    Setup(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ItemMetadata;

    fn item() -> MediaWorkItem {
        MediaWorkItem::new(
            MediaSource::Embed,
            "https://x/a.png",
            "https://x/a.png",
            ItemMetadata::default(),
        )
    }

    #[test]
    fn test_failure_message_keeps_reason() {
        let message = SkipReason::HttpError.failure_message("HTTP 502");
        assert_eq!(
            SkipReason::from_failure_message(&message),
            (SkipReason::HttpError, "HTTP 502".to_string())
        );
        assert_eq!(
            SkipReason::from_failure_message("boom"),
            (SkipReason::Exception, "boom".to_string())
        );
    }

    #[test]
    fn test_cancelled_items_never_count_as_flagged() {
        let mut result = ItemResult::new(
            &item(),
            ItemStatus::Flagged,
            Some(Verdict::flagged("violence", "classifier", 0.9)),
        );
        assert!(result.is_flagged());

        result.status = ItemStatus::Cancelled;
        assert!(!result.is_flagged());
    }

    #[test]
    fn test_item_result_serializes_status_inline() {
        let result = ItemResult::skipped(&item(), SkipReason::DownloadRestricted, "too big");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "download_restricted");
        assert_eq!(json["cache_key"], "url::https://x/a.png");
    }
}
