//! External collaborators.
//!
//! The scanner talks to everything it does not own through these traits:
//! tenant settings, plan resolution, the similarity index, the content
//! classifier, the chat platform (for re-fetching messages) and the
//! flagged-content callback.

pub mod http;
mod local;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collector::ChatMessage;
use crate::limits::PlanTier;

pub use local::{DisabledClassifier, DisabledSimilarityIndex, LoggingFlagHandler, StaticTenantSettings};

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("service unavailable")]
    Unavailable,

    #[error("service call timed out")]
    Timeout,

    #[error("service returned HTTP {0}")]
    Http(u16),

    #[error("service request failed: {0}")]
    Request(String),

    #[error("invalid service response: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ServiceError::Timeout
        } else if let Some(status) = error.status() {
            ServiceError::Http(status.as_u16())
        } else if error.is_decode() {
            ServiceError::Decode(error.to_string())
        } else {
            ServiceError::Request(error.to_string())
        }
    }
}

/// Image bytes sent to the similarity index or the classifier.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub record_id: String,
    pub score: f32,
    /// `None` marks a record of known-clean content.
    #[serde(default)]
    pub category: Option<String>,
    /// Set on tenant-scoped records; such hits only apply to that tenant.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Metadata stored with a new similarity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub category: Option<String>,
    pub score: f32,
}

/// Nearest-neighbour vector search service.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Health flag. Callers must check it before querying.
    fn is_available(&self) -> bool;

    async fn query_similar(&self, payload: &MediaPayload)
        -> Result<Vec<SimilarityMatch>, ServiceError>;

    async fn add_record(
        &self,
        payload: &MediaPayload,
        metadata: RecordMetadata,
    ) -> Result<String, ServiceError>;

    async fn delete_record(&self, record_id: &str) -> Result<(), ServiceError>;
}

/// What to classify.
#[derive(Debug, Clone)]
pub enum ClassifierInput {
    Image(MediaPayload),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ClassifyRequest {
    pub input: ClassifierInput,
    pub tenant_id: String,
    /// Best similarity score already seen for this payload, if any.
    pub similarity_hint: Option<f32>,
}

/// Score for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: String,
    pub score: f32,
    /// The classifier's own decision for this category.
    #[serde(default)]
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierResponse {
    pub flagged: bool,
    #[serde(default)]
    pub categories: Vec<CategoryScore>,
}

impl ClassifierResponse {
    /// Highest scoring category the tenant cares about at its threshold.
    pub fn decide(&self, policy: &ScanPolicy) -> Option<&CategoryScore> {
        self.categories
            .iter()
            .filter(|c| c.score >= policy.threshold)
            .filter(|c| policy.allows(&c.category))
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }

    /// Highest scoring category the classifier itself flagged.
    pub fn top_flagged(&self) -> Option<&CategoryScore> {
        self.categories
            .iter()
            .filter(|c| c.flagged)
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// External content classifier.
#[async_trait]
pub trait ContentClassifier: Send + Sync {
    fn is_available(&self) -> bool;

    async fn classify(&self, request: ClassifyRequest) -> Result<ClassifierResponse, ServiceError>;
}

/// Per-tenant decision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPolicy {
    /// Minimum category score for a classifier result to count.
    pub threshold: f32,
    /// Categories the tenant acts on. Empty means all.
    pub allowed_categories: Vec<String>,
    /// Require a stronger similarity match before skipping the classifier.
    pub high_accuracy: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            allowed_categories: Vec::new(),
            high_accuracy: false,
        }
    }
}

impl ScanPolicy {
    pub fn allows(&self, category: &str) -> bool {
        if self.allowed_categories.is_empty() {
            return true;
        }
        let normalized = normalize_category(category);
        self.allowed_categories
            .iter()
            .any(|allowed| normalize_category(allowed) == normalized)
    }
}

/// `sexual/minors` and `sexual-minors` both become `sexual_minors`.
pub fn normalize_category(category: &str) -> String {
    category.replace(['/', '-'], "_").to_ascii_lowercase()
}

/// Tenant settings storage.
#[async_trait]
pub trait TenantSettings: Send + Sync {
    async fn get_toggle(&self, tenant_id: &str, name: &str) -> Result<bool, ServiceError>;

    async fn scan_policy(&self, tenant_id: &str) -> Result<ScanPolicy, ServiceError>;
}

/// Billing-side plan lookup.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    async fn resolve_plan(&self, tenant_id: &str) -> Result<PlanTier, ServiceError>;
}

/// Chat platform read access, used to re-fetch messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<ChatMessage>, ServiceError>;
}

/// Local copy of the flagged media. The file only exists for the duration
/// of the callback.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub path: PathBuf,
    pub filename: String,
    pub content_type: Option<String>,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct FlaggedEvent {
    pub actor_id: Option<String>,
    pub tenant_id: String,
    pub reason: String,
    pub category: Option<String>,
    pub confidence: Option<f32>,
    pub evidence: Option<Evidence>,
    pub message: Option<ChatMessage>,
    pub item_label: String,
}

/// Caller-supplied action for flagged content. Invoked at most once per
/// scanned message.
#[async_trait]
pub trait FlaggedContentHandler: Send + Sync {
    async fn on_flagged(&self, event: FlaggedEvent);
}
