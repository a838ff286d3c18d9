//! In-process collaborators for running without external services.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use super::{
    ClassifierResponse, ClassifyRequest, ContentClassifier, FlaggedContentHandler, FlaggedEvent,
    MediaPayload, PlanResolver, RecordMetadata, ScanPolicy, ServiceError, SimilarityIndex,
    SimilarityMatch, TenantSettings,
};
use crate::limits::PlanTier;

/// Similarity index that is never available.
pub struct DisabledSimilarityIndex;

#[async_trait]
impl SimilarityIndex for DisabledSimilarityIndex {
    fn is_available(&self) -> bool {
        false
    }

    async fn query_similar(&self, _: &MediaPayload) -> Result<Vec<SimilarityMatch>, ServiceError> {
        Err(ServiceError::Unavailable)
    }

    async fn add_record(&self, _: &MediaPayload, _: RecordMetadata) -> Result<String, ServiceError> {
        Err(ServiceError::Unavailable)
    }

    async fn delete_record(&self, _: &str) -> Result<(), ServiceError> {
        Err(ServiceError::Unavailable)
    }
}

/// Classifier that is never available.
pub struct DisabledClassifier;

#[async_trait]
impl ContentClassifier for DisabledClassifier {
    fn is_available(&self) -> bool {
        false
    }

    async fn classify(&self, _: ClassifyRequest) -> Result<ClassifierResponse, ServiceError> {
        Err(ServiceError::Unavailable)
    }
}

/// Settings and plan taken from configuration, identical for every tenant
/// unless overridden per tenant.
#[derive(Debug, Default)]
pub struct StaticTenantSettings {
    pub plan: PlanTier,
    pub policy: ScanPolicy,
    pub toggles: HashMap<String, bool>,
    pub plan_overrides: HashMap<String, PlanTier>,
}

#[async_trait]
impl TenantSettings for StaticTenantSettings {
    async fn get_toggle(&self, _tenant_id: &str, name: &str) -> Result<bool, ServiceError> {
        Ok(self.toggles.get(name).copied().unwrap_or(true))
    }

    async fn scan_policy(&self, _tenant_id: &str) -> Result<ScanPolicy, ServiceError> {
        Ok(self.policy.clone())
    }
}

#[async_trait]
impl PlanResolver for StaticTenantSettings {
    async fn resolve_plan(&self, tenant_id: &str) -> Result<PlanTier, ServiceError> {
        Ok(self
            .plan_overrides
            .get(tenant_id)
            .copied()
            .unwrap_or(self.plan))
    }
}

/// Logs flagged events and keeps them for later inspection.
#[derive(Default)]
pub struct LoggingFlagHandler {
    events: Mutex<Vec<FlaggedEvent>>,
}

impl LoggingFlagHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_events(&self) -> Vec<FlaggedEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

#[async_trait]
impl FlaggedContentHandler for LoggingFlagHandler {
    async fn on_flagged(&self, event: FlaggedEvent) {
        warn!(
            tenant = %event.tenant_id,
            item = %event.item_label,
            category = ?event.category,
            confidence = ?event.confidence,
            evidence = event.evidence.is_some(),
            "Flagged content: {}",
            event.reason
        );
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_settings_defaults_and_overrides() {
        let settings = StaticTenantSettings {
            plan: PlanTier::Core,
            toggles: HashMap::from([("check-tenor-gifs".to_string(), false)]),
            plan_overrides: HashMap::from([("vip".to_string(), PlanTier::Ultra)]),
            ..Default::default()
        };

        assert!(!settings.get_toggle("t", "check-tenor-gifs").await.unwrap());
        assert!(settings.get_toggle("t", "unknown").await.unwrap());
        assert_eq!(settings.resolve_plan("t").await.unwrap(), PlanTier::Core);
        assert_eq!(settings.resolve_plan("vip").await.unwrap(), PlanTier::Ultra);
    }
}
