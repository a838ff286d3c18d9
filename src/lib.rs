//! Media Scanner Library
//!
//! Scans the media attached to chat messages: collects work items, downloads
//! them with URL fallbacks, deduplicates through a single-flight verdict
//! cache and decides through a similarity index with a classifier fallback.

pub mod collector;
pub mod config;
pub mod download_manager;
pub mod limits;
pub mod metrics;
pub mod scanner;
pub mod services;
pub mod verdict_cache;

// Re-export commonly used types for convenience
pub use collector::{ChatMessage, MediaWorkItem};
pub use limits::{PlanLimits, PlanTier};
pub use scanner::{ItemResult, ItemStatus, ScanError, ScanReport, Scanner, ScannerDeps, ScannerSettings};
pub use verdict_cache::{Verdict, VerdictCache, VerdictCacheConfig};
