use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

use super::GovernanceViolation;
use crate::config::RateLimitConfig;

/// Per-client ceiling on workflow-start requests.
///
/// Counters live only in this process: they are created empty when the
/// limiter is built and are lost on restart. A restart therefore grants every
/// client a fresh allowance; this is an accepted degradation, not a
/// correctness fault. Build one instance per process (or per test) and share
/// it by reference.
pub struct RequestRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    ceiling: u32,
    window: Duration,
}

impl std::fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateLimiter")
            .field("ceiling", &self.ceiling)
            .field("window", &self.window)
            .finish()
    }
}

impl RequestRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let ceiling = NonZeroU32::new(config.requests_per_window).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(config.window_secs.max(1));

        // Full allowance up front; one slot comes back per elapsed window, so no
        // window-long interval ever admits more than `ceiling` starts
        let quota = Quota::with_period(window)
            .unwrap_or_else(|| Quota::per_hour(NonZeroU32::MIN))
            .allow_burst(ceiling);

        Self {
            limiter: RateLimiter::keyed(quota),
            ceiling: ceiling.get(),
            window,
        }
    }

    /// Count one start request for `client`, rejecting it once the ceiling is reached
    pub fn check(&self, client: &str) -> Result<(), GovernanceViolation> {
        match self.limiter.check_key(&client.to_string()) {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    client = %client,
                    limit = self.ceiling,
                    window_secs = self.window.as_secs(),
                    "Workflow start rejected by rate limit"
                );
                Err(GovernanceViolation::RateLimited {
                    client: client.to_string(),
                    limit: self.ceiling,
                    window_secs: self.window.as_secs(),
                })
            }
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Drop bookkeeping for clients whose allowance has fully refilled
    pub fn prune_idle_clients(&self) {
        self.limiter.retain_recent();
    }
}
