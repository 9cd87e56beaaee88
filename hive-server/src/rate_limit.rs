//! Per-identifier rate limiting for the admin API.
//!
//! Token-bucket limiters keyed by the caller-supplied identifier (user id or
//! session id). Session creation and reconnection share a tight budget; the
//! remaining routes use the default one.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

/// Keyed limiters for the two route classes.
pub struct ApiLimits {
    create: DefaultKeyedRateLimiter<String>,
    default: DefaultKeyedRateLimiter<String>,
}

impl ApiLimits {
    /// Production limits: 50 create/reconnect per 5 minutes, 100 per minute
    /// otherwise.
    pub fn new() -> Self {
        // 50 per 5 min → one token every 6 s, burst 50.
        let create_quota = Quota::with_period(Duration::from_secs(6))
            .expect("non-zero period")
            .allow_burst(NonZeroU32::new(50).expect("non-zero burst"));
        let default_quota = Quota::per_minute(NonZeroU32::new(100).expect("non-zero rate"));
        Self {
            create: RateLimiter::keyed(create_quota),
            default: RateLimiter::keyed(default_quota),
        }
    }

    /// Custom limits for tests.
    pub fn with_bursts(create_burst: u32, default_burst: u32) -> Self {
        let create_quota = Quota::with_period(Duration::from_secs(300))
            .expect("non-zero period")
            .allow_burst(NonZeroU32::new(create_burst).expect("non-zero burst"));
        let default_quota = Quota::with_period(Duration::from_secs(60))
            .expect("non-zero period")
            .allow_burst(NonZeroU32::new(default_burst).expect("non-zero burst"));
        Self {
            create: RateLimiter::keyed(create_quota),
            default: RateLimiter::keyed(default_quota),
        }
    }

    /// Whether a create/reconnect call from `identifier` may proceed.
    pub fn allow_create(&self, identifier: &str) -> bool {
        self.create.check_key(&identifier.to_string()).is_ok()
    }

    /// Whether any other call from `identifier` may proceed.
    pub fn allow_default(&self, identifier: &str) -> bool {
        self.default.check_key(&identifier.to_string()).is_ok()
    }
}

impl Default for ApiLimits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_budget_exhausts_per_identifier() {
        let limits = ApiLimits::with_bursts(2, 100);

        assert!(limits.allow_create("user_a"));
        assert!(limits.allow_create("user_a"));
        assert!(!limits.allow_create("user_a"), "third call is over budget");

        // Another identifier has its own bucket.
        assert!(limits.allow_create("user_b"));
    }

    #[test]
    fn test_default_budget_independent_of_create() {
        let limits = ApiLimits::with_bursts(1, 2);
        assert!(limits.allow_create("u"));
        assert!(!limits.allow_create("u"));

        assert!(limits.allow_default("u"));
        assert!(limits.allow_default("u"));
        assert!(!limits.allow_default("u"));
    }
}
