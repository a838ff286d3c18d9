//! Runs every work item of one message concurrently.
//!
//! Width is bounded by the plan. The first item to come back flagged
//! cancels its siblings and is the only one reported to the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::context::{ScanContext, ScanJob};
use super::models::{ItemOutcome, ItemResult, ItemStatus, SkipReason};
use super::orchestrator;
use crate::collector::MediaWorkItem;
use crate::metrics;
use crate::services::{Evidence, FlaggedContentHandler, FlaggedEvent};

/// State shared by the tasks of one fan-out group.
struct Group {
    ctx: Arc<ScanContext>,
    job: Arc<ScanJob>,
    handler: Arc<dyn FlaggedContentHandler>,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
    reported: AtomicBool,
}

fn flagged_event(job: &ScanJob, item: &MediaWorkItem, outcome: &ItemOutcome) -> FlaggedEvent {
    let verdict = outcome.result.verdict.as_ref();
    FlaggedEvent {
        actor_id: job.message.as_ref().and_then(|m| m.author_id.clone()),
        tenant_id: job.tenant_id.clone(),
        reason: verdict
            .map(|v| v.reason.clone())
            .unwrap_or_else(|| "flagged".to_string()),
        category: verdict.and_then(|v| v.category.clone()),
        confidence: verdict.and_then(|v| v.score),
        evidence: outcome.evidence.as_ref().map(|payload| Evidence {
            path: payload.path().to_path_buf(),
            filename: item.evidence_filename(),
            content_type: payload.content_type.clone(),
            sha256: payload.sha256.clone(),
        }),
        message: job.message.as_deref().cloned(),
        item_label: item.label.clone(),
    }
}

impl Group {
    async fn scan_one(&self, item: &MediaWorkItem) -> ItemResult {
        let started = Instant::now();
        let mut result = self.run_one(item).await;
        if matches!(result.status, ItemStatus::Cancelled) {
            result.duration_ms = started.elapsed().as_millis() as u64;
        }
        metrics::record_item_outcome(result.status.label(), started.elapsed());
        result
    }

    async fn run_one(&self, item: &MediaWorkItem) -> ItemResult {
        let _slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return ItemResult::cancelled(item),
            slot = self.slots.clone().acquire_owned() => slot.ok(),
        };

        // Dropping the scan future settles its claims and deletes partial
        // downloads.
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return ItemResult::cancelled(item),
            outcome = orchestrator::scan_item(&self.ctx, &self.job, item) => outcome,
        };
        drop(_slot);

        if outcome.result.is_flagged() && !self.reported.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            info!(
                scan_id = %self.job.scan_id,
                tenant = %self.job.tenant_id,
                item = %item.label,
                category = ?outcome.result.verdict.as_ref().and_then(|v| v.category.as_deref()),
                "Flagged media, cancelling sibling scans"
            );
            self.handler
                .on_flagged(flagged_event(&self.job, item, &outcome))
                .await;
        }
        outcome.result
    }
}

/// Scans `items` and returns their results in input order.
pub(crate) async fn run(
    ctx: Arc<ScanContext>,
    job: Arc<ScanJob>,
    items: Vec<MediaWorkItem>,
    handler: Arc<dyn FlaggedContentHandler>,
) -> Vec<ItemResult> {
    let width = job.limits.fan_out_width(items.len());
    let group = Arc::new(Group {
        ctx,
        job,
        handler,
        cancel: CancellationToken::new(),
        slots: Arc::new(Semaphore::new(width)),
        reported: AtomicBool::new(false),
    });

    let fallbacks: Vec<ItemResult> = items
        .iter()
        .map(|item| ItemResult::skipped(item, SkipReason::Exception, "scan task failed"))
        .collect();
    let mut results: Vec<Option<ItemResult>> = vec![None; items.len()];

    let mut tasks = JoinSet::new();
    for (index, item) in items.into_iter().enumerate() {
        let group = group.clone();
        tasks.spawn(async move { (index, group.scan_one(&item).await) });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => error!("Item scan task failed: {}", e),
        }
    }

    results
        .into_iter()
        .zip(fallbacks)
        .map(|(result, fallback)| result.unwrap_or(fallback))
        .collect()
}
