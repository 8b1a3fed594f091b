use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use http::{HeaderMap, StatusCode};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bucket::{Bucket, BucketTracker, BucketVerdict};
use crate::endpoint::EndpointIdentity;
use crate::error::RateLimitReason;
use crate::global::{GlobalLimiter, GlobalRateLimitPolicy};
use crate::util::{header_str, lock_unpoisoned, parse_retry_after};

const RATE_LIMIT_GLOBAL_HEADER: &str = "x-ratelimit-global";
const RATE_LIMIT_SCOPE_HEADERS: [&str; 3] =
    ["x-ratelimit-scope", "ratelimit-scope", "x-rate-limit-scope"];
const DEFAULT_GLOBAL_THROTTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow,
    Deny(RateLimitReason),
    After(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ServerThrottleScope {
    Bucket,
    Shared,
    Global,
}

pub(crate) fn server_throttle_scope_from_headers(
    headers: &HeaderMap,
) -> Option<ServerThrottleScope> {
    if header_str(headers, RATE_LIMIT_GLOBAL_HEADER)
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    {
        return Some(ServerThrottleScope::Global);
    }

    for header_name in RATE_LIMIT_SCOPE_HEADERS {
        let Some(value) = header_str(headers, header_name) else {
            continue;
        };

        let normalized = value.to_ascii_lowercase();
        if normalized.contains("global") {
            return Some(ServerThrottleScope::Global);
        }
        if normalized.contains("shared") {
            return Some(ServerThrottleScope::Shared);
        }
        if normalized.contains("user")
            || normalized.contains("bucket")
            || normalized.contains("resource")
        {
            return Some(ServerThrottleScope::Bucket);
        }
    }

    None
}

pub(crate) fn is_invalid_request_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
    )
}

#[derive(Debug)]
struct RateLimiterState {
    buckets: BucketTracker,
    global: GlobalLimiter,
}

#[derive(Clone, Debug)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
}

impl RateLimiter {
    pub fn new(policy: GlobalRateLimitPolicy) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                buckets: BucketTracker::default(),
                global: GlobalLimiter::new(policy, now),
            })),
        }
    }

    pub fn decide(
        &self,
        identity: Option<&EndpointIdentity>,
        counts_against_global: bool,
    ) -> RateLimitDecision {
        self.decide_at(identity, counts_against_global, Instant::now())
    }

    /// Re-checks the gate after a wait whose usage was already recorded with
    /// [`RateLimiter::record_global_usage`]. The ceiling is not checked again;
    /// anything other than `Allow` hands the recorded usage back.
    pub fn decide_after_wait(
        &self,
        identity: Option<&EndpointIdentity>,
        counts_against_global: bool,
    ) -> RateLimitDecision {
        self.decide_after_wait_at(identity, counts_against_global, Instant::now())
    }

    pub fn record_global_usage(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.global.record_global_usage(Instant::now());
    }

    pub fn observe(
        &self,
        identity: Option<&EndpointIdentity>,
        headers: &HeaderMap,
        status: StatusCode,
    ) {
        self.observe_at(
            identity,
            headers,
            status,
            Instant::now(),
            SystemTime::now(),
        );
    }

    pub fn bucket_for(&self, identity: &EndpointIdentity) -> Option<Bucket> {
        let state = lock_unpoisoned(&self.state);
        state.buckets.bucket_for(identity).cloned()
    }

    pub(crate) fn decide_at(
        &self,
        identity: Option<&EndpointIdentity>,
        counts_against_global: bool,
        now: Instant,
    ) -> RateLimitDecision {
        let mut state = lock_unpoisoned(&self.state);
        if !state.global.invalid_requests_allow(now) {
            return RateLimitDecision::Deny(RateLimitReason::InvalidRequestLockout);
        }
        if counts_against_global
            && let Some(remaining) = state.global.server_throttle_remaining(now)
        {
            return RateLimitDecision::After(remaining);
        }
        if !state.global.allows_global(counts_against_global, now) {
            return RateLimitDecision::Deny(RateLimitReason::GlobalLimit);
        }

        match bucket_verdict(&state.buckets, identity, now) {
            BucketVerdict::Allow => {
                if !counts_against_global {
                    state.global.record_global_usage(now);
                }
                RateLimitDecision::Allow
            }
            BucketVerdict::After(wait) => {
                if counts_against_global {
                    state.global.refund_global_usage(now);
                }
                RateLimitDecision::After(wait)
            }
        }
    }

    pub(crate) fn decide_after_wait_at(
        &self,
        identity: Option<&EndpointIdentity>,
        counts_against_global: bool,
        now: Instant,
    ) -> RateLimitDecision {
        let mut state = lock_unpoisoned(&self.state);
        let decision = if !state.global.invalid_requests_allow(now) {
            RateLimitDecision::Deny(RateLimitReason::InvalidRequestLockout)
        } else if let Some(remaining) = counts_against_global
            .then(|| state.global.server_throttle_remaining(now))
            .flatten()
        {
            RateLimitDecision::After(remaining)
        } else {
            match bucket_verdict(&state.buckets, identity, now) {
                BucketVerdict::Allow => RateLimitDecision::Allow,
                BucketVerdict::After(wait) => RateLimitDecision::After(wait),
            }
        };

        if decision != RateLimitDecision::Allow {
            state.global.refund_global_usage(now);
        }
        decision
    }

    pub(crate) fn record_global_usage_at(&self, now: Instant) {
        let mut state = lock_unpoisoned(&self.state);
        state.global.record_global_usage(now);
    }

    pub(crate) fn observe_at(
        &self,
        identity: Option<&EndpointIdentity>,
        headers: &HeaderMap,
        status: StatusCode,
        now: Instant,
        wall_now: SystemTime,
    ) {
        let mut state = lock_unpoisoned(&self.state);
        if is_invalid_request_status(status) {
            state.global.record_invalid_request(now);
        }
        if let Some(identity) = identity {
            state.buckets.record(identity, headers, now, wall_now);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let scope = server_throttle_scope_from_headers(headers);
            let delay = parse_retry_after(headers, wall_now).unwrap_or(DEFAULT_GLOBAL_THROTTLE_DELAY);
            if scope == Some(ServerThrottleScope::Global) {
                state.global.apply_server_throttle(now, delay);
                warn!(
                    delay_ms = delay.as_millis() as u64,
                    "server announced a global rate limit"
                );
            } else {
                debug!(
                    endpoint = identity.map(ToString::to_string).unwrap_or_default(),
                    delay_ms = delay.as_millis() as u64,
                    scope = ?scope,
                    "received 429 for bucket"
                );
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(GlobalRateLimitPolicy::standard())
    }
}

fn bucket_verdict(
    buckets: &BucketTracker,
    identity: Option<&EndpointIdentity>,
    now: Instant,
) -> BucketVerdict {
    match identity {
        Some(identity) => buckets.may_request(identity, now),
        None => BucketVerdict::Allow,
    }
}
