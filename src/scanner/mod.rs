//! Per-message media scanning.
//!
//! [`Scanner::scan`] collects the media of a chat message, then scans every
//! item concurrently: download, dedup through the verdict cache, then
//! similarity lookup and classifier fallback (per frame for animations and
//! videos). The first flagged item is handed to the
//! [`FlaggedContentHandler`] together with the downloaded evidence.

mod classify;
mod context;
mod diagnostics;
mod fan_out;
#[cfg(test)]
mod fixtures;
mod frames;
mod media_kind;
mod models;
mod orchestrator;
mod settings;
mod video;

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collector::{ChatMessage, MediaCollector, MediaWorkItem};
use crate::download_manager::MediaFetcher;
use crate::limits::{ConcurrencyPool, PlanTier};
use crate::services::{
    ContentClassifier, FlaggedContentHandler, MessageSource, PlanResolver, ScanPolicy,
    SimilarityIndex, TenantSettings,
};
use crate::verdict_cache::VerdictCache;

use context::{ScanContext, ScanJob};

pub use diagnostics::DiagnosticRateLimiter;
pub use frames::{
    adaptive_cap, FrameConfig, FrameError, FrameSample, FrameSampler, SampledFrame,
};
pub use media_kind::{sniff, AnimatedFormat, Sniffed};
pub use models::{ItemResult, ItemStatus, ScanError, ScanReport, SkipReason};
pub use settings::{ClassificationConfig, ScannerSettings};
pub use video::{ffmpeg_available, VideoMeta};

/// Collaborators the scanner depends on.
pub struct ScannerDeps {
    /// Usually shared by every scanner of the process.
    pub cache: VerdictCache,
    pub tenant_settings: Arc<dyn TenantSettings>,
    pub plans: Arc<dyn PlanResolver>,
    pub similarity: Arc<dyn SimilarityIndex>,
    pub classifier: Arc<dyn ContentClassifier>,
    /// Used for message hydration and attachment URL refresh.
    pub message_source: Option<Arc<dyn MessageSource>>,
}

pub struct Scanner {
    ctx: Arc<ScanContext>,
}

impl Scanner {
    pub fn new(settings: ScannerSettings, deps: ScannerDeps) -> Result<Self, ScanError> {
        let fetcher = MediaFetcher::new(settings.download)
            .map_err(|e| ScanError::Setup(format!("HTTP client: {}", e)))?;
        let frames = FrameSampler::new(settings.frames)
            .map_err(|e| ScanError::Setup(format!("frame pool: {}", e)))?;
        let collector = MediaCollector::new(
            settings.collector,
            deps.tenant_settings.clone(),
            deps.message_source,
        );

        Ok(Self {
            ctx: Arc::new(ScanContext {
                cache: deps.cache,
                fetcher,
                fallback: settings.fallback,
                collector,
                similarity: deps.similarity,
                classifier: deps.classifier,
                tenant_settings: deps.tenant_settings,
                plans: deps.plans,
                pool: ConcurrencyPool::new(),
                frames,
                classification: settings.classification,
                diagnostics: DiagnosticRateLimiter::new(settings.diagnostics_window),
                lookup_timeout: settings.lookup_timeout,
            }),
        })
    }

    pub fn cache(&self) -> &VerdictCache {
        &self.ctx.cache
    }

    pub fn frame_sampler(&self) -> &FrameSampler {
        &self.ctx.frames
    }

    async fn resolve_plan(&self, tenant_id: &str) -> PlanTier {
        match tokio::time::timeout(self.ctx.lookup_timeout, self.ctx.plans.resolve_plan(tenant_id))
            .await
        {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => {
                warn!(tenant = %tenant_id, "Plan lookup failed, using free tier: {}", e);
                PlanTier::Free
            }
            Err(_) => {
                warn!(tenant = %tenant_id, "Plan lookup timed out, using free tier");
                PlanTier::Free
            }
        }
    }

    async fn load_policy(&self, tenant_id: &str) -> ScanPolicy {
        match tokio::time::timeout(
            self.ctx.lookup_timeout,
            self.ctx.tenant_settings.scan_policy(tenant_id),
        )
        .await
        {
            Ok(Ok(policy)) => policy,
            Ok(Err(e)) => {
                warn!(tenant = %tenant_id, "Scan policy lookup failed, using defaults: {}", e);
                ScanPolicy::default()
            }
            Err(_) => {
                warn!(tenant = %tenant_id, "Scan policy lookup timed out, using defaults");
                ScanPolicy::default()
            }
        }
    }

    async fn job(&self, tenant_id: &str, message: Option<Arc<ChatMessage>>) -> (PlanTier, ScanJob) {
        let (plan, policy) = tokio::join!(self.resolve_plan(tenant_id), self.load_policy(tenant_id));
        let job = ScanJob {
            scan_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            limits: plan.limits(),
            policy,
            message,
        };
        (plan, job)
    }

    /// Scans every piece of media in `message`.
    ///
    /// Returns as soon as all items have settled. When one is flagged,
    /// `handler` has already been called once the report comes back.
    pub async fn scan(
        &self,
        message: &ChatMessage,
        tenant_id: &str,
        handler: Arc<dyn FlaggedContentHandler>,
    ) -> Result<ScanReport, ScanError> {
        let (plan, job) = self.job(tenant_id, Some(Arc::new(message.clone()))).await;

        let Some(items) = self.ctx.collector.collect(message, tenant_id).await else {
            debug!(scan_id = %job.scan_id, message_id = %message.id, "No media to scan");
            return Ok(ScanReport::new(job.scan_id, job.tenant_id, plan, Vec::new()));
        };

        info!(
            scan_id = %job.scan_id,
            message_id = %message.id,
            tenant = %tenant_id,
            plan = plan.as_str(),
            items = items.len(),
            "Scanning message media"
        );
        Ok(self.run(plan, job, items, handler).await)
    }

    /// Scans a single URL outside of any message.
    pub async fn scan_url(
        &self,
        url: &str,
        tenant_id: &str,
        handler: Arc<dyn FlaggedContentHandler>,
    ) -> Result<ScanReport, ScanError> {
        let item = self
            .ctx
            .collector
            .build_url_item(url)
            .ok_or_else(|| ScanError::InvalidUrl(url.to_string()))?;
        let (plan, job) = self.job(tenant_id, None).await;
        Ok(self.run(plan, job, vec![item], handler).await)
    }

    async fn run(
        &self,
        plan: PlanTier,
        job: ScanJob,
        items: Vec<MediaWorkItem>,
        handler: Arc<dyn FlaggedContentHandler>,
    ) -> ScanReport {
        let scan_id = job.scan_id.clone();
        let tenant_id = job.tenant_id.clone();
        let items = fan_out::run(self.ctx.clone(), Arc::new(job), items, handler).await;
        ScanReport::new(scan_id, tenant_id, plan, items)
    }
}
