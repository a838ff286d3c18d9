//! Download Manager module
//!
//! Streams untrusted media URLs into bounded temp files, walking each work
//! item's URL fallback chain and refreshing expired signed URLs on demand.

mod chain;
mod fallback_policy;
mod fetcher;
mod models;

pub use chain::{FetchRequest, UrlRefresher};
pub use fallback_policy::FallbackPolicy;
pub use fetcher::{motion_variant, DownloadConfig, MediaFetcher};
pub use models::*;
