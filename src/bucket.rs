use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use tokio::time::Instant;
use tracing::debug;

use crate::endpoint::EndpointIdentity;
use crate::util::{RATE_LIMIT_RESET_AFTER_HEADER, header_str, parse_seconds};

pub(crate) const RATE_LIMIT_BUCKET_HEADER: &str = "x-ratelimit-bucket";
pub(crate) const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub(crate) const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub(crate) const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    token: String,
    limit: u32,
    remaining: u32,
    reset_at: Instant,
}

impl Bucket {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn reset_at(&self) -> Instant {
        self.reset_at
    }

    pub(crate) fn from_headers(
        headers: &HeaderMap,
        now: Instant,
        wall_now: SystemTime,
    ) -> Option<Self> {
        let token = header_str(headers, RATE_LIMIT_BUCKET_HEADER)?.to_owned();
        let limit = header_str(headers, RATE_LIMIT_LIMIT_HEADER)?.parse::<u32>().ok()?;
        let remaining = header_str(headers, RATE_LIMIT_REMAINING_HEADER)?
            .parse::<u32>()
            .ok()?;
        let reset_epoch = header_str(headers, RATE_LIMIT_RESET_HEADER).and_then(parse_seconds)?;

        let until_reset = match header_str(headers, RATE_LIMIT_RESET_AFTER_HEADER)
            .and_then(parse_seconds)
        {
            Some(reset_after) => reset_after,
            None => {
                let wall_epoch = wall_now
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                reset_epoch.saturating_sub(wall_epoch)
            }
        };

        Some(Self {
            token,
            limit,
            remaining,
            reset_at: now.checked_add(until_reset)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BucketVerdict {
    Allow,
    After(Duration),
}

#[derive(Debug, Default)]
pub(crate) struct BucketTracker {
    endpoint_buckets: HashMap<EndpointIdentity, String>,
    buckets: HashMap<String, Bucket>,
}

impl BucketTracker {
    pub(crate) fn record(
        &mut self,
        identity: &EndpointIdentity,
        headers: &HeaderMap,
        now: Instant,
        wall_now: SystemTime,
    ) -> bool {
        let Some(bucket) = Bucket::from_headers(headers, now, wall_now) else {
            return false;
        };

        debug!(
            endpoint = %identity,
            bucket = %bucket.token,
            limit = bucket.limit,
            remaining = bucket.remaining,
            "learned rate limit bucket"
        );
        self.endpoint_buckets
            .insert(identity.clone(), bucket.token.clone());
        self.buckets.insert(bucket.token.clone(), bucket);
        true
    }

    pub(crate) fn may_request(&self, identity: &EndpointIdentity, now: Instant) -> BucketVerdict {
        let Some(bucket) = self.bucket_for(identity) else {
            return BucketVerdict::Allow;
        };
        // `remaining` only changes when the server reports it.
        if bucket.remaining > 0 {
            return BucketVerdict::Allow;
        }

        let wait = bucket.reset_at.saturating_duration_since(now);
        if wait.is_zero() {
            // The bucket has refreshed on the server side.
            BucketVerdict::Allow
        } else {
            BucketVerdict::After(wait)
        }
    }

    pub(crate) fn bucket_for(&self, identity: &EndpointIdentity) -> Option<&Bucket> {
        let token = self.endpoint_buckets.get(identity)?;
        self.buckets.get(token)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use http::{HeaderMap, HeaderValue};
    use tokio::time::Instant;

    use super::{Bucket, BucketTracker, BucketVerdict};
    use crate::endpoint::EndpointIdentity;

    fn bucket_headers(token: &str, remaining: u32, reset_after: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-bucket",
            HeaderValue::from_str(token).expect("token should be a valid header"),
        );
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5"));
        headers.insert(
            "x-ratelimit-remaining",
            HeaderValue::from_str(&remaining.to_string()).expect("remaining should be valid"),
        );
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000005.5"));
        if let Some(reset_after) = reset_after {
            headers.insert(
                "x-ratelimit-reset-after",
                HeaderValue::from_str(reset_after).expect("reset-after should be valid"),
            );
        }
        headers
    }

    fn wall_clock() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn unknown_endpoint_is_allowed() {
        let tracker = BucketTracker::default();
        assert_eq!(
            tracker.may_request(&EndpointIdentity::api("getChannel"), Instant::now()),
            BucketVerdict::Allow
        );
    }

    #[test]
    fn exhausted_bucket_waits_until_reset() {
        let mut tracker = BucketTracker::default();
        let identity = EndpointIdentity::api("createMessage");
        let now = Instant::now();
        assert!(tracker.record(&identity, &bucket_headers("abcd", 0, Some("5")), now, wall_clock()));

        match tracker.may_request(&identity, now) {
            BucketVerdict::After(wait) => assert_eq!(wait, Duration::from_secs(5)),
            other => panic!("unexpected verdict: {other:?}"),
        }
        assert_eq!(
            tracker.may_request(&identity, now + Duration::from_secs(5)),
            BucketVerdict::Allow
        );
    }

    #[test]
    fn reset_epoch_is_used_without_reset_after() {
        let now = Instant::now();
        let bucket = Bucket::from_headers(&bucket_headers("abcd", 0, None), now, wall_clock())
            .expect("bucket headers should parse");
        assert_eq!(bucket.reset_at() - now, Duration::from_millis(5500));
    }

    #[test]
    fn reset_beyond_the_clock_range_leaves_endpoint_untracked() {
        let mut tracker = BucketTracker::default();
        let identity = EndpointIdentity::api("createMessage");
        let headers = bucket_headers("abcd", 0, Some("1e19"));

        assert!(!tracker.record(&identity, &headers, Instant::now(), wall_clock()));
        assert_eq!(
            tracker.may_request(&identity, Instant::now()),
            BucketVerdict::Allow
        );
    }

    #[test]
    fn remaining_is_not_decremented_locally() {
        let mut tracker = BucketTracker::default();
        let identity = EndpointIdentity::api("createMessage");
        let now = Instant::now();
        tracker.record(&identity, &bucket_headers("abcd", 1, Some("5")), now, wall_clock());

        assert_eq!(tracker.may_request(&identity, now), BucketVerdict::Allow);
        assert_eq!(tracker.may_request(&identity, now), BucketVerdict::Allow);
        assert_eq!(
            tracker
                .bucket_for(&identity)
                .expect("bucket should be tracked")
                .remaining(),
            1
        );
    }

    #[test]
    fn incomplete_headers_leave_endpoint_untracked() {
        let mut tracker = BucketTracker::default();
        let identity = EndpointIdentity::api("createMessage");
        let mut headers = bucket_headers("abcd", 0, Some("5"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("many"));

        assert!(!tracker.record(&identity, &headers, Instant::now(), wall_clock()));
        assert!(tracker.bucket_for(&identity).is_none());
    }

    #[test]
    fn shared_bucket_token_applies_to_every_mapped_endpoint() {
        let mut tracker = BucketTracker::default();
        let now = Instant::now();
        let edit = EndpointIdentity::api("editMessage");
        let delete = EndpointIdentity::api("deleteMessage");
        tracker.record(&edit, &bucket_headers("shared", 3, Some("5")), now, wall_clock());
        tracker.record(&delete, &bucket_headers("shared", 0, Some("2")), now, wall_clock());

        assert_eq!(
            tracker.may_request(&edit, now),
            BucketVerdict::After(Duration::from_secs(2))
        );
    }
}
