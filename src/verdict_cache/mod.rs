//! In-memory verdict cache shared by every scan in the process.

mod cache;
mod models;

pub use cache::{ClaimToken, Reservation, VerdictCache, VerdictCacheConfig, VerdictWaiter};
pub use models::{CacheError, PipelineMetrics, Verdict, VerdictSource};
