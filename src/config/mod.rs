mod file_config;

pub use file_config::{
    CacheConfig, ClassificationFileConfig, CollectorFileConfig, DownloadFileConfig, FileConfig,
    FramesFileConfig, PolicyConfig, ServicesConfig,
};

use crate::limits::PlanTier;
use crate::scanner::ScannerSettings;
use crate::services::http::HttpServiceConfig;
use crate::services::ScanPolicy;
use crate::verdict_cache::VerdictCacheConfig;
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const KIB: usize = 1024;
const MIB: u64 = 1024 * 1024;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub plan: Option<PlanTier>,
    pub similarity_url: Option<String>,
    pub classifier_url: Option<String>,
    pub tmp_dir: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub plan: PlanTier,
    pub tenant_plans: HashMap<String, PlanTier>,
    pub toggles: HashMap<String, bool>,
    pub policy: ScanPolicy,
    pub cache: VerdictCacheConfig,
    pub scanner: ScannerSettings,
    /// `None` when no similarity index is configured.
    pub similarity: Option<HttpServiceConfig>,
    /// `None` when no classifier is configured.
    pub classifier: Option<HttpServiceConfig>,
}

fn parse_plan(s: &str) -> Result<PlanTier> {
    PlanTier::parse(s).ok_or_else(|| anyhow!("Unknown plan tier: {:?}", s))
}

fn check_unit_interval(name: &str, value: f32) -> Result<f32> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be between 0 and 1, got {}", name, value);
    }
    Ok(value)
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let plan = match file.plan.as_deref() {
            Some(s) => parse_plan(s)?,
            None => cli.plan.unwrap_or_default(),
        };
        let tenant_plans = file
            .tenant_plans
            .unwrap_or_default()
            .into_iter()
            .map(|(tenant, plan)| Ok((tenant, parse_plan(&plan)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        let cache_file = file.cache.unwrap_or_default();
        let cache_defaults = VerdictCacheConfig::default();
        let cache = VerdictCacheConfig {
            capacity: cache_file.capacity.unwrap_or(cache_defaults.capacity),
            ttl: cache_file
                .ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(cache_defaults.ttl),
        };
        if cache.capacity == 0 {
            bail!("cache.capacity must be at least 1");
        }

        let mut scanner = ScannerSettings::default();

        let download = file.download.unwrap_or_default();
        let dl = &mut scanner.download;
        if let Some(secs) = download.probe_timeout_secs {
            dl.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = download.connect_timeout_secs {
            dl.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = download.request_timeout_secs {
            dl.request_timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = download.probe_window_mb {
            dl.probe_window_bytes = mb * MIB;
        }
        dl.tmp_dir = download
            .tmp_dir
            .map(PathBuf::from)
            .or_else(|| cli.tmp_dir.clone());
        if let Some(kb) = download.min_chunk_kb {
            dl.min_chunk_size = kb * KIB;
        }
        if let Some(kb) = download.default_chunk_kb {
            dl.default_chunk_size = kb * KIB;
        }
        if let Some(kb) = download.max_chunk_kb {
            dl.max_chunk_size = kb * KIB;
        }
        if dl.min_chunk_size > dl.max_chunk_size {
            bail!("download.min_chunk_kb must not exceed download.max_chunk_kb");
        }
        if let Some(attempts) = download.max_attempts {
            scanner.fallback.max_attempts = attempts.max(1);
        }

        let collector = file.collector.unwrap_or_default();
        let col = &mut scanner.collector;
        if let Some(cdn_base) = collector.cdn_base {
            col.cdn_base = cdn_base.trim_end_matches('/').to_string();
        }
        if let Some(max) = collector.max_text_urls {
            col.max_text_urls = max;
        }
        if let Some(secs) = collector.toggle_ttl_secs {
            col.toggles.ttl = Duration::from_secs(secs);
        }
        if let Some(size) = collector.toggle_cache_size {
            col.toggles.max_entries = size;
        }
        if let Some(ms) = collector.toggle_timeout_ms {
            col.toggles.lookup_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = collector.hydration_timeout_ms {
            col.hydration_timeout = Duration::from_millis(ms);
        }

        let classification = file.classification.unwrap_or_default();
        let cls = &mut scanner.classification;
        if let Some(v) = classification.similarity_threshold {
            cls.similarity_threshold = check_unit_interval("similarity_threshold", v)?;
        }
        if let Some(v) = classification.high_accuracy_similarity {
            cls.high_accuracy_similarity = check_unit_interval("high_accuracy_similarity", v)?;
        }
        if let Some(v) = classification.sfw_vector_max_similarity {
            cls.sfw_vector_max_similarity = check_unit_interval("sfw_vector_max_similarity", v)?;
        }
        if let Some(divisor) = classification.refresh_divisor {
            cls.refresh_divisor = divisor;
        }
        if let Some(secs) = classification.similarity_timeout_secs {
            cls.similarity_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = classification.classifier_timeout_secs {
            cls.classifier_timeout = Duration::from_secs(secs);
        }

        let frames = file.frames.unwrap_or_default();
        let fr = &mut scanner.frames;
        if let Some(path) = frames.ffmpeg_path.map(PathBuf::from).or_else(|| cli.ffmpeg_path.clone()) {
            fr.ffmpeg_path = path;
        }
        if let Some(path) = frames.ffprobe_path {
            fr.ffprobe_path = PathBuf::from(path);
        }
        if let Some(size) = frames.preview_size {
            if size == 0 {
                bail!("frames.preview_size must be at least 1");
            }
            fr.preview_size = size;
        }
        if let Some(threads) = frames.worker_threads {
            fr.worker_threads = threads;
        }

        let services = file.services.unwrap_or_default();
        let service_config = |base_url: String| HttpServiceConfig {
            base_url,
            timeout: Duration::from_secs(services.timeout_secs.unwrap_or(30)),
            failure_cooldown: Duration::from_secs(services.failure_cooldown_secs.unwrap_or(30)),
        };
        let similarity = services
            .similarity_url
            .clone()
            .or_else(|| cli.similarity_url.clone())
            .map(service_config);
        let classifier = services
            .classifier_url
            .clone()
            .or_else(|| cli.classifier_url.clone())
            .map(service_config);

        let policy_file = file.policy.unwrap_or_default();
        let policy_defaults = ScanPolicy::default();
        let policy = ScanPolicy {
            threshold: match policy_file.threshold {
                Some(v) => check_unit_interval("policy.threshold", v)?,
                None => policy_defaults.threshold,
            },
            allowed_categories: policy_file
                .allowed_categories
                .unwrap_or(policy_defaults.allowed_categories),
            high_accuracy: policy_file
                .high_accuracy
                .unwrap_or(policy_defaults.high_accuracy),
        };

        Ok(Self {
            plan,
            tenant_plans,
            toggles: file.toggles.unwrap_or_default(),
            policy,
            cache,
            scanner,
            similarity,
            classifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_defaults() {
        let config = AppConfig::resolve(&CliConfig::default(), None).unwrap();

        assert_eq!(config.plan, PlanTier::Free);
        assert_eq!(config.cache.capacity, 512);
        assert_eq!(config.cache.ttl, Duration::from_secs(900));
        assert_eq!(config.scanner.classification.similarity_threshold, 0.85);
        assert_eq!(config.scanner.classification.refresh_divisor, 0);
        assert_eq!(config.scanner.collector.motion_gif_toggle, "check-tenor-gifs");
        assert_eq!(config.policy, ScanPolicy::default());
        assert!(config.similarity.is_none());
        assert!(config.classifier.is_none());
    }

    #[test]
    fn test_resolve_cli_only() {
        let cli = CliConfig {
            plan: Some(PlanTier::Pro),
            similarity_url: Some("http://index:8000".to_string()),
            classifier_url: Some("http://classifier:8001".to_string()),
            tmp_dir: Some(PathBuf::from("/scratch")),
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg")),
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.plan, PlanTier::Pro);
        assert_eq!(
            config.similarity.as_ref().map(|s| s.base_url.as_str()),
            Some("http://index:8000")
        );
        assert_eq!(
            config.classifier.as_ref().map(|s| s.base_url.as_str()),
            Some("http://classifier:8001")
        );
        assert_eq!(config.scanner.download.tmp_dir, Some(PathBuf::from("/scratch")));
        assert_eq!(config.scanner.frames.ffmpeg_path, PathBuf::from("/opt/ffmpeg"));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let cli = CliConfig {
            plan: Some(PlanTier::Core),
            similarity_url: Some("http://cli-index".to_string()),
            classifier_url: Some("http://cli-classifier".to_string()),
            ..Default::default()
        };
        let file_config: FileConfig = toml::from_str(
            r#"
            plan = "ultra"

            [cache]
            capacity = 64
            ttl_secs = 60

            [classification]
            similarity_threshold = 0.9
            refresh_divisor = 50

            [services]
            similarity_url = "http://toml-index"
            timeout_secs = 7

            [policy]
            threshold = 0.5
            allowed_categories = ["sexual/minors"]
            "#,
        )
        .unwrap();

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.plan, PlanTier::Ultra);
        assert_eq!(config.cache.capacity, 64);
        assert_eq!(config.cache.ttl, Duration::from_secs(60));
        assert_eq!(config.scanner.classification.similarity_threshold, 0.9);
        assert_eq!(config.scanner.classification.refresh_divisor, 50);
        let similarity = config.similarity.unwrap();
        assert_eq!(similarity.base_url, "http://toml-index");
        assert_eq!(similarity.timeout, Duration::from_secs(7));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.classifier.unwrap().base_url, "http://cli-classifier");
        assert_eq!(config.policy.threshold, 0.5);
        assert!(config.policy.allows("sexual-minors"));
        assert!(!config.policy.allows("violence"));
    }

    #[test]
    fn test_resolve_tenant_plans_and_toggles() {
        let file_config: FileConfig = toml::from_str(
            r#"
            [tenant_plans]
            g1 = "pro"

            [toggles]
            check-tenor-gifs = false
            "#,
        )
        .unwrap();

        let config = AppConfig::resolve(&CliConfig::default(), Some(file_config)).unwrap();
        assert_eq!(config.tenant_plans.get("g1"), Some(&PlanTier::Pro));
        assert_eq!(config.toggles.get("check-tenor-gifs"), Some(&false));
    }

    #[test]
    fn test_resolve_unknown_plan_error() {
        let file_config = FileConfig {
            plan: Some("platinum".to_string()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&CliConfig::default(), Some(file_config));
        assert!(result.unwrap_err().to_string().contains("Unknown plan tier"));
    }

    #[test]
    fn test_resolve_threshold_out_of_range_error() {
        let file_config = FileConfig {
            classification: Some(ClassificationFileConfig {
                similarity_threshold: Some(1.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&CliConfig::default(), Some(file_config));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("similarity_threshold must be between 0 and 1"));
    }

    #[test]
    fn test_resolve_chunk_sizes_validated() {
        let file_config = FileConfig {
            download: Some(DownloadFileConfig {
                min_chunk_kb: Some(2048),
                max_chunk_kb: Some(1024),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&CliConfig::default(), Some(file_config)).is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[frames]\npreview_size = 32\nworker_threads = 2").unwrap();

        let file_config = FileConfig::load(file.path()).unwrap();
        let config = AppConfig::resolve(&CliConfig::default(), Some(file_config)).unwrap();
        assert_eq!(config.scanner.frames.preview_size, 32);
        assert_eq!(config.scanner.frames.worker_threads, 2);
    }

    #[test]
    fn test_load_missing_file_error() {
        let result = FileConfig::load(std::path::Path::new("/nonexistent/scan.toml"));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to read config file"));
    }
}
