//! Long-lived scanner state and per-scan job data.

use std::sync::Arc;
use std::time::Duration;

use super::diagnostics::DiagnosticRateLimiter;
use super::frames::FrameSampler;
use super::settings::ClassificationConfig;
use crate::collector::{ChatMessage, MediaCollector};
use crate::download_manager::{FallbackPolicy, MediaFetcher};
use crate::limits::{ConcurrencyPool, PlanLimits};
use crate::services::{
    ContentClassifier, PlanResolver, ScanPolicy, SimilarityIndex, TenantSettings,
};
use crate::verdict_cache::VerdictCache;

/// Shared by every scan of one [`super::Scanner`].
pub(crate) struct ScanContext {
    pub cache: VerdictCache,
    pub fetcher: MediaFetcher,
    pub fallback: FallbackPolicy,
    pub collector: MediaCollector,
    pub similarity: Arc<dyn SimilarityIndex>,
    pub classifier: Arc<dyn ContentClassifier>,
    pub tenant_settings: Arc<dyn TenantSettings>,
    pub plans: Arc<dyn PlanResolver>,
    pub pool: ConcurrencyPool,
    pub frames: FrameSampler,
    pub classification: ClassificationConfig,
    pub diagnostics: DiagnosticRateLimiter,
    pub lookup_timeout: Duration,
}

/// Per-message scan parameters, fixed for the duration of the scan.
pub(crate) struct ScanJob {
    pub scan_id: String,
    pub tenant_id: String,
    pub limits: &'static PlanLimits,
    pub policy: ScanPolicy,
    pub message: Option<Arc<ChatMessage>>,
}
