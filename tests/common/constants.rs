//! Shared constants for integration tests

/// Tenant used by every scan unless a test needs several.
pub const TENANT_ID: &str = "tenant-1";

pub const CHANNEL_ID: &str = "channel-1";

/// Upper bound for any single scan in tests.
pub const SCAN_TIMEOUT_MS: u64 = 10_000;

/// Delay of media routes that are meant to still be in flight when a
/// sibling item gets flagged.
pub const SLOW_ROUTE_DELAY_MS: u64 = 3_000;

/// Classifier category used for flagged fixtures.
pub const FLAGGED_CATEGORY: &str = "sexual/minors";
