use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    /// Plan tier used when the tenant has no override.
    pub plan: Option<String>,
    /// Per-tenant plan overrides.
    pub tenant_plans: Option<HashMap<String, String>>,
    /// Tenant toggles served by the static settings backend.
    pub toggles: Option<HashMap<String, bool>>,

    pub cache: Option<CacheConfig>,
    pub download: Option<DownloadFileConfig>,
    pub collector: Option<CollectorFileConfig>,
    pub classification: Option<ClassificationFileConfig>,
    pub frames: Option<FramesFileConfig>,
    pub services: Option<ServicesConfig>,
    pub policy: Option<PolicyConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: Option<usize>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DownloadFileConfig {
    pub probe_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    /// Byte limit for responses without a declared size, in MiB.
    pub probe_window_mb: Option<u64>,
    pub tmp_dir: Option<String>,
    pub min_chunk_kb: Option<usize>,
    pub default_chunk_kb: Option<usize>,
    pub max_chunk_kb: Option<usize>,
    pub max_attempts: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CollectorFileConfig {
    pub cdn_base: Option<String>,
    pub max_text_urls: Option<usize>,
    pub toggle_ttl_secs: Option<u64>,
    pub toggle_cache_size: Option<usize>,
    pub toggle_timeout_ms: Option<u64>,
    pub hydration_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ClassificationFileConfig {
    pub similarity_threshold: Option<f32>,
    pub high_accuracy_similarity: Option<f32>,
    pub sfw_vector_max_similarity: Option<f32>,
    pub refresh_divisor: Option<u32>,
    pub similarity_timeout_secs: Option<u64>,
    pub classifier_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FramesFileConfig {
    pub ffmpeg_path: Option<String>,
    pub ffprobe_path: Option<String>,
    pub preview_size: Option<u32>,
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ServicesConfig {
    pub similarity_url: Option<String>,
    pub classifier_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub failure_cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PolicyConfig {
    pub threshold: Option<f32>,
    pub allowed_categories: Option<Vec<String>>,
    pub high_accuracy: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
