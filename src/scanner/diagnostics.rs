//! Rate limiting for operational diagnostics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

const PRUNE_THRESHOLD: usize = 1024;

/// Lets one diagnostic per key through per window.
pub struct DiagnosticRateLimiter {
    window: Duration,
    last_emitted: Mutex<HashMap<String, Instant>>,
}

impl DiagnosticRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// True when a diagnostic for `key` should be emitted now.
    pub fn should_emit(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = self
            .last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if last.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            last.retain(|_, at| now.duration_since(*at) < window);
        }

        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl Default for DiagnosticRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
