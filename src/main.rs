use anyhow::{bail, Context, Result};
use clap::Parser;
use media_scanner::collector::ChatMessage;
use media_scanner::config::{AppConfig, CliConfig, FileConfig};
use media_scanner::limits::PlanTier;
use media_scanner::scanner::{ffmpeg_available, Scanner, ScannerDeps};
use media_scanner::services::http::{HttpClassifier, HttpSimilarityIndex};
use media_scanner::services::{
    ContentClassifier, DisabledClassifier, DisabledSimilarityIndex, LoggingFlagHandler,
    SimilarityIndex, StaticTenantSettings,
};
use media_scanner::verdict_cache::VerdictCache;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_plan(s: &str) -> Result<PlanTier> {
    PlanTier::parse(s).with_context(|| format!("Unknown plan tier: {}", s))
}

#[derive(Parser, Debug)]
#[clap(version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH")))]
struct CliArgs {
    /// Path to a JSON chat message to scan.
    pub message: Option<PathBuf>,

    /// Scan a single media URL instead of a message.
    #[clap(long, conflicts_with = "message")]
    pub url: Option<String>,

    /// Path to a TOML config file. Values in it override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Tenant the message belongs to.
    #[clap(long, default_value = "default")]
    pub tenant: String,

    /// Plan tier of the tenant: free, core, pro or ultra.
    #[clap(long, value_parser = parse_plan)]
    pub plan: Option<PlanTier>,

    /// Base URL of the similarity index service.
    #[clap(long)]
    pub similarity_url: Option<String>,

    /// Base URL of the content classifier service.
    #[clap(long)]
    pub classifier_url: Option<String>,

    /// Directory for downloaded payloads.
    #[clap(long)]
    pub tmp_dir: Option<PathBuf>,

    /// Path to the ffmpeg binary.
    #[clap(long)]
    pub ffmpeg_path: Option<PathBuf>,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            plan: self.plan,
            similarity_url: self.similarity_url.clone(),
            classifier_url: self.classifier_url.clone(),
            tmp_dir: self.tmp_dir.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
        }
    }
}

fn build_services(
    config: &AppConfig,
) -> Result<(Arc<dyn SimilarityIndex>, Arc<dyn ContentClassifier>)> {
    let similarity: Arc<dyn SimilarityIndex> = match &config.similarity {
        Some(service) => {
            info!("Similarity index configured at {}", service.base_url);
            Arc::new(HttpSimilarityIndex::new(service.clone())?)
        }
        None => {
            warn!("No similarity index configured, every item goes to the classifier");
            Arc::new(DisabledSimilarityIndex)
        }
    };
    let classifier: Arc<dyn ContentClassifier> = match &config.classifier {
        Some(service) => {
            info!("Classifier configured at {}", service.base_url);
            Arc::new(HttpClassifier::new(service.clone())?)
        }
        None => {
            warn!("No classifier configured, unmatched items resolve clean");
            Arc::new(DisabledClassifier)
        }
    };
    Ok((similarity, classifier))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    media_scanner::metrics::init_metrics();

    let (similarity, classifier) = build_services(&config)?;
    let settings = Arc::new(StaticTenantSettings {
        plan: config.plan,
        policy: config.policy.clone(),
        toggles: config.toggles.clone(),
        plan_overrides: config.tenant_plans.clone(),
    });

    let scanner = Scanner::new(
        config.scanner.clone(),
        ScannerDeps {
            cache: VerdictCache::new(config.cache.clone()),
            tenant_settings: settings.clone(),
            plans: settings,
            similarity,
            classifier,
            message_source: None,
        },
    )?;

    if !ffmpeg_available(scanner.frame_sampler()).await {
        warn!(
            "ffmpeg not found at {:?}, videos will be skipped",
            config.scanner.frames.ffmpeg_path
        );
    }

    let handler = Arc::new(LoggingFlagHandler::new());
    let report = match (&cli_args.url, &cli_args.message) {
        (Some(url), _) => scanner.scan_url(url, &cli_args.tenant, handler.clone()).await?,
        (None, Some(path)) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read message file: {:?}", path))?;
            let message: ChatMessage = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse message file: {:?}", path))?;
            scanner.scan(&message, &cli_args.tenant, handler.clone()).await?
        }
        (None, None) => bail!("Either a message file or --url must be given"),
    };

    let events = handler.take_events();
    info!(
        flagged = report.flagged,
        items = report.items.len(),
        flagged_events = events.len(),
        "Scan finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
