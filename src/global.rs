use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::util::instant_after;

const DEFAULT_REQUESTS_PER_SECOND: u32 = 50;
const DEFAULT_INVALID_REQUEST_THRESHOLD: u32 = 500;
const DEFAULT_INVALID_REQUEST_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_INVALID_REQUEST_LOCKOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalRateLimitPolicy {
    requests_per_second: u32,
    invalid_request_threshold: u32,
    invalid_request_window: Duration,
    invalid_request_lockout: Duration,
}

impl GlobalRateLimitPolicy {
    pub const fn standard() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            invalid_request_threshold: DEFAULT_INVALID_REQUEST_THRESHOLD,
            invalid_request_window: DEFAULT_INVALID_REQUEST_WINDOW,
            invalid_request_lockout: DEFAULT_INVALID_REQUEST_LOCKOUT,
        }
    }

    pub const fn requests_per_second(mut self, requests_per_second: u32) -> Self {
        self.requests_per_second = requests_per_second;
        self
    }

    pub const fn invalid_request_threshold(mut self, threshold: u32) -> Self {
        self.invalid_request_threshold = threshold;
        self
    }

    pub const fn invalid_request_lockout(mut self, lockout: Duration) -> Self {
        self.invalid_request_lockout = lockout;
        self
    }

    pub const fn configured_requests_per_second(self) -> u32 {
        self.requests_per_second
    }

    pub const fn configured_invalid_request_threshold(self) -> u32 {
        self.invalid_request_threshold
    }

    pub const fn configured_invalid_request_lockout(self) -> Duration {
        self.invalid_request_lockout
    }

    pub(crate) fn validate(self) -> Result<Self, String> {
        if self.requests_per_second == 0 {
            return Err("global requests_per_second must be greater than zero".to_owned());
        }
        if self.invalid_request_threshold == 0 {
            return Err("invalid_request_threshold must be greater than zero".to_owned());
        }
        Ok(self)
    }
}

impl Default for GlobalRateLimitPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Default)]
struct WindowCounter {
    window: u64,
    count: u32,
}

impl WindowCounter {
    fn roll(&mut self, window: u64) {
        if self.window != window {
            self.window = window;
            self.count = 0;
        }
    }
}

#[derive(Debug)]
pub(crate) struct GlobalLimiter {
    policy: GlobalRateLimitPolicy,
    origin: Instant,
    per_second: WindowCounter,
    invalid: WindowCounter,
    locked_until: Option<Instant>,
    throttled_until: Option<Instant>,
}

impl GlobalLimiter {
    pub(crate) fn new(policy: GlobalRateLimitPolicy, origin: Instant) -> Self {
        Self {
            policy,
            origin,
            per_second: WindowCounter::default(),
            invalid: WindowCounter::default(),
            locked_until: None,
            throttled_until: None,
        }
    }

    fn second_window(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_secs()
    }

    fn invalid_window(&self, now: Instant) -> u64 {
        let window_secs = self.policy.invalid_request_window.as_secs().max(1);
        now.saturating_duration_since(self.origin).as_secs() / window_secs
    }

    pub(crate) fn allows_global(&mut self, counts_against_global: bool, now: Instant) -> bool {
        if !counts_against_global {
            return true;
        }
        let window = self.second_window(now);
        self.per_second.roll(window);
        if self.per_second.count.saturating_add(1) > self.policy.requests_per_second {
            return false;
        }
        self.per_second.count += 1;
        true
    }

    pub(crate) fn record_global_usage(&mut self, now: Instant) {
        let window = self.second_window(now);
        self.per_second.roll(window);
        self.per_second.count = self.per_second.count.saturating_add(1);
    }

    pub(crate) fn refund_global_usage(&mut self, now: Instant) {
        let window = self.second_window(now);
        if self.per_second.window == window {
            self.per_second.count = self.per_second.count.saturating_sub(1);
        }
    }

    pub(crate) fn record_invalid_request(&mut self, now: Instant) {
        let window = self.invalid_window(now);
        self.invalid.roll(window);
        self.invalid.count = self.invalid.count.saturating_add(1);
    }

    pub(crate) fn invalid_requests_allow(&mut self, now: Instant) -> bool {
        if let Some(locked_until) = self.locked_until {
            if now < locked_until {
                return false;
            }
            self.locked_until = None;
        }

        let window = self.invalid_window(now);
        self.invalid.roll(window);
        if self.invalid.count >= self.policy.invalid_request_threshold {
            let locked_until = instant_after(now, self.policy.invalid_request_lockout);
            self.locked_until = Some(locked_until);
            // A fresh budget once the cooldown ends.
            self.invalid.count = 0;
            warn!(
                threshold = self.policy.invalid_request_threshold,
                lockout_ms = self.policy.invalid_request_lockout.as_millis() as u64,
                "invalid request budget exhausted; refusing all requests"
            );
            return false;
        }
        true
    }

    pub(crate) fn apply_server_throttle(&mut self, now: Instant, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let throttle_until = instant_after(now, delay);
        self.throttled_until = Some(match self.throttled_until {
            Some(existing) => existing.max(throttle_until),
            None => throttle_until,
        });
    }

    pub(crate) fn server_throttle_remaining(&mut self, now: Instant) -> Option<Duration> {
        let throttled_until = self.throttled_until?;
        if now >= throttled_until {
            self.throttled_until = None;
            return None;
        }
        Some(throttled_until - now)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{GlobalLimiter, GlobalRateLimitPolicy};

    #[test]
    fn ceiling_denies_the_request_after_the_limit_within_one_second() {
        let origin = Instant::now();
        let mut limiter =
            GlobalLimiter::new(GlobalRateLimitPolicy::standard().requests_per_second(3), origin);

        for _ in 0..3 {
            assert!(limiter.allows_global(true, origin));
        }
        assert!(!limiter.allows_global(true, origin));
        assert!(!limiter.allows_global(true, origin + Duration::from_millis(999)));
        assert!(limiter.allows_global(true, origin + Duration::from_secs(1)));
    }

    #[test]
    fn denied_attempts_do_not_consume_quota() {
        let origin = Instant::now();
        let mut limiter =
            GlobalLimiter::new(GlobalRateLimitPolicy::standard().requests_per_second(1), origin);

        assert!(limiter.allows_global(true, origin));
        for _ in 0..10 {
            assert!(!limiter.allows_global(true, origin));
        }
        assert_eq!(limiter.per_second.count, 1);
    }

    #[test]
    fn exempt_requests_are_never_denied() {
        let origin = Instant::now();
        let mut limiter =
            GlobalLimiter::new(GlobalRateLimitPolicy::standard().requests_per_second(1), origin);

        assert!(limiter.allows_global(true, origin));
        assert!(!limiter.allows_global(true, origin));
        for _ in 0..100 {
            assert!(limiter.allows_global(false, origin));
        }
    }

    #[test]
    fn record_global_usage_counts_against_the_ceiling() {
        let origin = Instant::now();
        let mut limiter =
            GlobalLimiter::new(GlobalRateLimitPolicy::standard().requests_per_second(2), origin);

        limiter.record_global_usage(origin);
        limiter.record_global_usage(origin);
        assert!(!limiter.allows_global(true, origin));

        limiter.refund_global_usage(origin);
        assert!(limiter.allows_global(true, origin));
    }

    #[test]
    fn invalid_request_governor_locks_at_threshold_then_recovers() {
        let origin = Instant::now();
        let mut limiter = GlobalLimiter::new(GlobalRateLimitPolicy::standard(), origin);

        for _ in 0..499 {
            limiter.record_invalid_request(origin);
        }
        assert!(limiter.invalid_requests_allow(origin));

        limiter.record_invalid_request(origin);
        assert!(!limiter.invalid_requests_allow(origin));
        assert!(!limiter.invalid_requests_allow(origin + Duration::from_millis(9_999)));
        assert!(limiter.invalid_requests_allow(origin + Duration::from_secs(10)));
    }

    #[test]
    fn lockout_starts_a_fresh_budget_within_the_same_minute() {
        let origin = Instant::now();
        let mut limiter = GlobalLimiter::new(GlobalRateLimitPolicy::standard(), origin);
        for _ in 0..500 {
            limiter.record_invalid_request(origin);
        }
        assert!(!limiter.invalid_requests_allow(origin));

        let resumed = origin + Duration::from_secs(10);
        assert!(limiter.invalid_requests_allow(resumed));
        assert_eq!(limiter.invalid.count, 0);
        for _ in 0..499 {
            limiter.record_invalid_request(resumed);
        }
        assert!(limiter.invalid_requests_allow(resumed));
        limiter.record_invalid_request(resumed);
        assert!(!limiter.invalid_requests_allow(resumed));
    }

    #[test]
    fn unbounded_lockout_stays_locked_without_overflowing() {
        let origin = Instant::now();
        let mut limiter = GlobalLimiter::new(
            GlobalRateLimitPolicy::standard()
                .invalid_request_threshold(1)
                .invalid_request_lockout(Duration::MAX),
            origin,
        );

        limiter.record_invalid_request(origin);
        assert!(!limiter.invalid_requests_allow(origin));
        assert!(!limiter.invalid_requests_allow(origin + Duration::from_secs(86_400)));
    }

    #[test]
    fn invalid_request_count_resets_with_the_minute_window() {
        let origin = Instant::now();
        let mut limiter = GlobalLimiter::new(GlobalRateLimitPolicy::standard(), origin);

        for _ in 0..499 {
            limiter.record_invalid_request(origin + Duration::from_secs(59));
        }
        limiter.record_invalid_request(origin + Duration::from_secs(60));
        assert!(limiter.invalid_requests_allow(origin + Duration::from_secs(60)));
    }

    #[test]
    fn server_throttle_keeps_the_longest_deadline() {
        let origin = Instant::now();
        let mut limiter = GlobalLimiter::new(GlobalRateLimitPolicy::standard(), origin);

        limiter.apply_server_throttle(origin, Duration::from_secs(3));
        limiter.apply_server_throttle(origin, Duration::from_secs(1));
        assert_eq!(
            limiter.server_throttle_remaining(origin),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            limiter.server_throttle_remaining(origin + Duration::from_secs(3)),
            None
        );
    }

    #[test]
    fn unbounded_server_throttle_is_clamped() {
        let origin = Instant::now();
        let mut limiter = GlobalLimiter::new(GlobalRateLimitPolicy::standard(), origin);

        limiter.apply_server_throttle(origin, Duration::MAX);
        let remaining = limiter
            .server_throttle_remaining(origin)
            .expect("throttle should be active");
        assert!(remaining > Duration::from_secs(365 * 86_400));
    }
}
