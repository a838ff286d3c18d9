//! Verdict records stored by the cache.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which signal produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Similarity index match above the shortcut threshold.
    Similarity,
    /// Tenant-scoped similarity record.
    CustomBlock,
    /// External classifier.
    Classifier,
    /// Payload type we do not classify (documents, Lottie stickers, ...).
    Unsupported,
    /// Neither collaborator was available.
    #[default]
    NoSignal,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictSource::Similarity => "similarity",
            VerdictSource::CustomBlock => "custom_block",
            VerdictSource::Classifier => "classifier",
            VerdictSource::Unsupported => "unsupported",
            VerdictSource::NoSignal => "no_signal",
        }
    }
}

/// Numbers gathered while computing a verdict. Informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineMetrics {
    pub source: VerdictSource,
    pub bytes_downloaded: u64,
    pub download_ms: u64,
    pub classify_ms: u64,
    /// Best similarity score seen, if the index was consulted.
    pub best_similarity: Option<f32>,
    pub classifier_calls: u32,
    pub frames_scanned: usize,
    pub frames_total: Option<usize>,
}

/// Outcome of classifying one media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_flagged: bool,
    pub category: Option<String>,
    pub reason: String,
    /// Confidence of the deciding signal, 0.0 to 1.0.
    pub score: Option<f32>,
    #[serde(default)]
    pub metrics: PipelineMetrics,
}

impl Verdict {
    pub fn flagged(category: impl Into<String>, reason: impl Into<String>, score: f32) -> Self {
        Self {
            is_flagged: true,
            category: Some(category.into()),
            reason: reason.into(),
            score: Some(score),
            metrics: PipelineMetrics::default(),
        }
    }

    pub fn clean(reason: impl Into<String>) -> Self {
        Self {
            is_flagged: false,
            category: None,
            reason: reason.into(),
            score: None,
            metrics: PipelineMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Error observed by waiters when the owner did not produce a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Owner was cancelled or dropped its claim without settling it.
    #[error("verdict computation was cancelled")]
    Cancelled,

    /// Owner failed; failures are never cached.
    #[error("verdict computation failed: {0}")]
    Failed(String),

    /// The cache dropped the in-flight record without an outcome.
    #[error("verdict computation was abandoned")]
    Abandoned,
}

impl CacheError {
    pub fn failed(message: impl Into<String>) -> Self {
        CacheError::Failed(message.into())
    }
}
