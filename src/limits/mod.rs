//! Plan-tiered resource budgets.
//!
//! Every scan looks up its tenant's [`PlanLimits`] once and holds it for the
//! whole scan. The table is static; the only dynamic part is the
//! [`ConcurrencyPool`], which hands out per-tenant semaphores sized from it.

mod concurrency;

pub use concurrency::{ConcurrencyPool, LimitError, Resource, ResourcePermit, DEFAULT_POOL_ENTRIES};

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Subscription level of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Core,
    Pro,
    Ultra,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Core => "core",
            PlanTier::Pro => "pro",
            PlanTier::Ultra => "ultra",
        }
    }

    /// Lenient parse, unknown names fall back to `None` so callers can
    /// decide on their own default.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Some(PlanTier::Free),
            "core" | "accelerated" => Some(PlanTier::Core),
            "pro" | "accelerated_pro" => Some(PlanTier::Pro),
            "ultra" | "accelerated_ultra" => Some(PlanTier::Ultra),
            _ => None,
        }
    }

    pub fn is_premium(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }

    pub fn limits(&self) -> &'static PlanLimits {
        match self {
            PlanTier::Free => &FREE,
            PlanTier::Core => &CORE,
            PlanTier::Pro => &PRO,
            PlanTier::Ultra => &ULTRA,
        }
    }
}

/// Immutable resource budget for one plan tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub tier: PlanTier,
    /// Maximum payload size in bytes. `None` means unlimited.
    pub download_cap_bytes: Option<u64>,
    pub max_concurrent_downloads: usize,
    pub max_concurrent_decodes: usize,
    pub max_concurrent_classifier_calls: usize,
    /// Upper bound on sampled frames per video. `None` leaves only the
    /// size/duration based cap in effect.
    pub max_frames_per_video: Option<usize>,
    pub max_video_workers: usize,
}

static FREE: PlanLimits = PlanLimits {
    tier: PlanTier::Free,
    download_cap_bytes: Some(128 * MIB),
    max_concurrent_downloads: 4,
    max_concurrent_decodes: 6,
    max_concurrent_classifier_calls: 3,
    max_frames_per_video: Some(5),
    max_video_workers: 2,
};

static CORE: PlanLimits = PlanLimits {
    tier: PlanTier::Core,
    download_cap_bytes: Some(256 * MIB),
    max_concurrent_downloads: 8,
    max_concurrent_decodes: 12,
    max_concurrent_classifier_calls: 4,
    max_frames_per_video: Some(100),
    max_video_workers: 4,
};

static PRO: PlanLimits = PlanLimits {
    tier: PlanTier::Pro,
    download_cap_bytes: Some(512 * MIB),
    max_concurrent_downloads: 10,
    max_concurrent_decodes: 18,
    max_concurrent_classifier_calls: 6,
    max_frames_per_video: Some(300),
    max_video_workers: 5,
};

static ULTRA: PlanLimits = PlanLimits {
    tier: PlanTier::Ultra,
    download_cap_bytes: None,
    max_concurrent_downloads: 14,
    max_concurrent_decodes: 24,
    max_concurrent_classifier_calls: 8,
    max_frames_per_video: None,
    max_video_workers: 6,
};

impl PlanLimits {
    /// Budget for the given resource, as used to size per-tenant semaphores.
    pub fn budget(&self, resource: Resource) -> usize {
        match resource {
            Resource::Download => self.max_concurrent_downloads,
            Resource::FrameDecode => self.max_concurrent_decodes,
            Resource::ClassifierCall => self.max_concurrent_classifier_calls,
            Resource::VideoWorker => self.max_video_workers,
        }
    }

    /// Fan-out width for a message with `item_count` work items.
    pub fn fan_out_width(&self, item_count: usize) -> usize {
        self.max_concurrent_downloads.min(item_count).max(1)
    }
}
