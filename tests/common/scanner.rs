//! Scanner wired to the fakes, with its own scratch directory

use super::constants::*;
use super::fakes::{FakeClassifier, FakeMessageSource, FakeSimilarityIndex, RecordingHandler};
use media_scanner::collector::ChatMessage;
use media_scanner::limits::PlanTier;
use media_scanner::scanner::{ScanReport, Scanner, ScannerDeps, ScannerSettings};
use media_scanner::services::{ScanPolicy, StaticTenantSettings};
use media_scanner::verdict_cache::{VerdictCache, VerdictCacheConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestScannerBuilder {
    similarity: FakeSimilarityIndex,
    classifier: FakeClassifier,
    plan: PlanTier,
    policy: ScanPolicy,
    toggles: HashMap<String, bool>,
    cache: Option<VerdictCache>,
    settings: ScannerSettings,
}

impl TestScannerBuilder {
    pub fn similarity(mut self, similarity: FakeSimilarityIndex) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn classifier(mut self, classifier: FakeClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn plan(mut self, plan: PlanTier) -> Self {
        self.plan = plan;
        self
    }

    pub fn policy(mut self, policy: ScanPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn toggle(mut self, name: &str, value: bool) -> Self {
        self.toggles.insert(name.to_string(), value);
        self
    }

    /// Shares a verdict cache with another scanner.
    pub fn cache(mut self, cache: VerdictCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut ScannerSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn build(self) -> TestScanner {
        let tmp_dir = TempDir::new().expect("Failed to create scratch dir");
        let mut settings = self.settings;
        settings.download.tmp_dir = Some(tmp_dir.path().to_path_buf());

        let tenant_settings = Arc::new(StaticTenantSettings {
            plan: self.plan,
            policy: self.policy,
            toggles: self.toggles,
            plan_overrides: HashMap::new(),
        });
        let similarity = Arc::new(self.similarity);
        let classifier = Arc::new(self.classifier);
        let message_source = Arc::new(FakeMessageSource::new());

        let scanner = Scanner::new(
            settings,
            ScannerDeps {
                cache: self
                    .cache
                    .unwrap_or_else(|| VerdictCache::new(VerdictCacheConfig::default())),
                tenant_settings: tenant_settings.clone(),
                plans: tenant_settings,
                similarity: similarity.clone(),
                classifier: classifier.clone(),
                message_source: Some(message_source.clone()),
            },
        )
        .expect("Failed to build scanner");

        TestScanner {
            scanner,
            similarity,
            classifier,
            message_source,
            handler: Arc::new(RecordingHandler::new()),
            tmp_dir,
        }
    }
}

pub struct TestScanner {
    pub scanner: Scanner,
    pub similarity: Arc<FakeSimilarityIndex>,
    pub classifier: Arc<FakeClassifier>,
    pub message_source: Arc<FakeMessageSource>,
    pub handler: Arc<RecordingHandler>,
    tmp_dir: TempDir,
}

impl TestScanner {
    pub fn builder() -> TestScannerBuilder {
        let mut settings = ScannerSettings::default();
        settings.frames.worker_threads = 2;
        settings.download.request_timeout = Duration::from_secs(5);
        settings.download.probe_timeout = Duration::from_secs(1);
        TestScannerBuilder {
            similarity: FakeSimilarityIndex::new(true),
            classifier: FakeClassifier::new(),
            plan: PlanTier::Core,
            policy: ScanPolicy::default(),
            toggles: HashMap::new(),
            cache: None,
            settings,
        }
    }

    pub async fn scan(&self, message: &ChatMessage) -> ScanReport {
        tokio::time::timeout(
            Duration::from_millis(SCAN_TIMEOUT_MS),
            self.scanner.scan(message, TENANT_ID, self.handler.clone()),
        )
        .await
        .expect("Scan timed out")
        .expect("Scan failed")
    }

    pub async fn scan_url(&self, url: &str) -> ScanReport {
        tokio::time::timeout(
            Duration::from_millis(SCAN_TIMEOUT_MS),
            self.scanner.scan_url(url, TENANT_ID, self.handler.clone()),
        )
        .await
        .expect("Scan timed out")
        .expect("Scan failed")
    }

    /// Files left in the scratch directory.
    pub fn leftover_files(&self) -> usize {
        std::fs::read_dir(self.tmp_dir.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}
