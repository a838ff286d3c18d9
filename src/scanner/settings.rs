//! Scanner settings. Every default lives here.

use std::time::Duration;

use super::frames::FrameConfig;
use crate::collector::CollectorConfig;
use crate::download_manager::{DownloadConfig, FallbackPolicy};

/// Thresholds and timeouts for the similarity/classifier stage.
#[derive(Debug, Clone)]
pub struct ClassificationConfig {
    /// Similarity score at which a match decides the verdict.
    pub similarity_threshold: f32,
    /// Best score required before the shortcut is taken for tenants in
    /// high-accuracy mode.
    pub high_accuracy_similarity: f32,
    /// Clean classifier results are only written back to the index when
    /// nothing in it scored above this.
    pub sfw_vector_max_similarity: f32,
    /// One in `refresh_divisor` similarity hits is deleted and recomputed;
    /// 0 disables.
    pub refresh_divisor: u32,
    pub similarity_timeout: Duration,
    pub classifier_timeout: Duration,
    pub vector_write_timeout: Duration,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            high_accuracy_similarity: 0.90,
            sfw_vector_max_similarity: 0.70,
            refresh_divisor: 0,
            similarity_timeout: Duration::from_secs(5),
            classifier_timeout: Duration::from_secs(30),
            vector_write_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the scanner needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub download: DownloadConfig,
    pub fallback: FallbackPolicy,
    pub collector: CollectorConfig,
    pub classification: ClassificationConfig,
    pub frames: FrameConfig,
    /// Timeout for plan and policy lookups.
    pub lookup_timeout: Duration,
    /// Window of the skipped-item diagnostic rate limiter.
    pub diagnostics_window: Duration,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            fallback: FallbackPolicy::default(),
            collector: CollectorConfig::default(),
            classification: ClassificationConfig::default(),
            frames: FrameConfig::default(),
            lookup_timeout: Duration::from_secs(5),
            diagnostics_window: Duration::from_secs(300),
        }
    }
}
