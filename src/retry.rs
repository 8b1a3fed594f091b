use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, StatusCode};
use tracing::debug;

use crate::error::TransportErrorKind;
use crate::util::parse_retry_after;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_COEFFICIENT: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF_RATE: f64 = 2.0;
const DEFAULT_BACKOFF_UP_TO_TIMES: u32 = 5;
const MIN_RETRYABLE_STATUS: u16 = 400;

#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    Constant(Duration),
    Linear {
        base: Duration,
        coefficient: Duration,
        up_to_times: u32,
    },
    Exponential {
        base: Duration,
        coefficient: Duration,
        rate: f64,
        up_to_times: u32,
    },
    FromRetryHeader {
        max_allowed: Option<Duration>,
        retry_if_greater: bool,
        fallback: Option<Box<Backoff>>,
    },
}

impl Backoff {
    pub fn exponential(base: Duration, coefficient: Duration, rate: f64, up_to_times: u32) -> Self {
        Self::Exponential {
            base,
            coefficient,
            rate,
            up_to_times,
        }
    }

    pub fn linear(base: Duration, coefficient: Duration, up_to_times: u32) -> Self {
        Self::Linear {
            base,
            coefficient,
            up_to_times,
        }
    }

    pub fn from_retry_header(
        max_allowed: Option<Duration>,
        retry_if_greater: bool,
        fallback: Option<Backoff>,
    ) -> Self {
        Self::FromRetryHeader {
            max_allowed,
            retry_if_greater,
            fallback: fallback.map(Box::new),
        }
    }

    pub fn wait_time(&self, attempts_so_far: u32, headers: &HeaderMap) -> Option<Duration> {
        self.wait_time_at(attempts_so_far, headers, SystemTime::now())
    }

    pub(crate) fn wait_time_at(
        &self,
        attempts_so_far: u32,
        headers: &HeaderMap,
        wall_now: SystemTime,
    ) -> Option<Duration> {
        match self {
            Self::Constant(wait) => Some(*wait),
            Self::Linear {
                base,
                coefficient,
                up_to_times,
            } => {
                let n = (*up_to_times).min(attempts_so_far.saturating_add(1));
                Some(base.saturating_add(coefficient.saturating_mul(n)))
            }
            Self::Exponential {
                base,
                coefficient,
                rate,
                up_to_times,
            } => {
                let n = (*up_to_times).min(attempts_so_far.saturating_add(1));
                let exponent = i32::try_from(n).unwrap_or(i32::MAX);
                let scaled = coefficient.as_secs_f64() * rate.powi(exponent);
                let scaled = Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX);
                Some(base.saturating_add(scaled))
            }
            Self::FromRetryHeader {
                max_allowed,
                retry_if_greater,
                fallback,
            } => match parse_retry_after(headers, wall_now) {
                Some(retry_after) => {
                    let max_allowed = max_allowed.unwrap_or(Duration::ZERO);
                    if retry_after <= max_allowed {
                        Some(retry_after)
                    } else if *retry_if_greater {
                        Some(max_allowed)
                    } else {
                        None
                    }
                }
                None => fallback
                    .as_ref()
                    .and_then(|fallback| fallback.wait_time_at(attempts_so_far, headers, wall_now)),
            },
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Exponential { rate, .. } if !rate.is_finite() || *rate < 0.0 => Err(format!(
                "exponential backoff rate must be finite and non-negative, got {rate}"
            )),
            Self::FromRetryHeader {
                fallback: Some(fallback),
                ..
            } => fallback.validate(),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    retryable_statuses: BTreeSet<u16>,
    max_retries: u32,
    backoff: Option<Backoff>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    bucket_wait_consumes_retry: bool,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            retryable_statuses: BTreeSet::new(),
            max_retries: 0,
            backoff: None,
            retryable_transport_error_kinds: BTreeSet::new(),
            bucket_wait_consumes_retry: false,
        }
    }

    pub fn standard() -> Self {
        Self {
            retryable_statuses: default_retryable_statuses(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Some(default_backoff()),
            retryable_transport_error_kinds: BTreeSet::new(),
            bucket_wait_consumes_retry: false,
        }
    }

    pub fn retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses
            .into_iter()
            .filter(|status| {
                let keep = *status >= MIN_RETRYABLE_STATUS;
                if !keep {
                    debug!(status, "ignoring non-error status in retry policy");
                }
                keep
            })
            .collect();
        self
    }

    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn no_backoff(mut self) -> Self {
        self.backoff = None;
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    /// When set, waiting out an exhausted bucket counts as one retry.
    pub const fn bucket_wait_consumes_retry(mut self, consumes: bool) -> Self {
        self.bucket_wait_consumes_retry = consumes;
        self
    }

    pub fn configured_retryable_statuses(&self) -> &BTreeSet<u16> {
        &self.retryable_statuses
    }

    pub const fn configured_max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn configured_backoff(&self) -> Option<&Backoff> {
        self.backoff.as_ref()
    }

    pub(crate) const fn bucket_wait_consumes_retries(&self) -> bool {
        self.bucket_wait_consumes_retry
    }

    pub fn should_retry(&self, status: StatusCode, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_retries && self.retryable_statuses.contains(&status.as_u16())
    }

    pub fn should_retry_transport(&self, kind: TransportErrorKind, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_retries && self.retryable_transport_error_kinds.contains(&kind)
    }

    pub(crate) fn allows_bucket_wait(&self, attempts_so_far: u32) -> bool {
        self.should_retry(StatusCode::TOO_MANY_REQUESTS, attempts_so_far)
    }

    pub fn wait_time(&self, attempts_so_far: u32, headers: &HeaderMap) -> Option<Duration> {
        self.wait_time_at(attempts_so_far, headers, SystemTime::now())
    }

    pub(crate) fn wait_time_at(
        &self,
        attempts_so_far: u32,
        headers: &HeaderMap,
        wall_now: SystemTime,
    ) -> Option<Duration> {
        match &self.backoff {
            Some(backoff) => backoff.wait_time_at(attempts_so_far, headers, wall_now),
            None => Some(Duration::ZERO),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match &self.backoff {
            Some(backoff) => backoff.validate(),
            None => Ok(()),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_statuses() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

fn default_backoff() -> Backoff {
    Backoff::from_retry_header(
        Some(DEFAULT_MAX_RETRY_AFTER),
        false,
        Some(Backoff::exponential(
            Duration::ZERO,
            DEFAULT_BACKOFF_COEFFICIENT,
            DEFAULT_BACKOFF_RATE,
            DEFAULT_BACKOFF_UP_TO_TIMES,
        )),
    )
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use http::{HeaderMap, HeaderValue, StatusCode};

    use super::{Backoff, RetryPolicy};
    use crate::error::TransportErrorKind;

    fn retry_after(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn exponential_backoff_grows_then_plateaus() {
        let backoff = Backoff::exponential(
            Duration::from_secs(1),
            Duration::from_secs(2),
            2.0,
            3,
        );
        let headers = HeaderMap::new();
        let waits = (0..6)
            .map(|attempt| backoff.wait_time(attempt, &headers).expect("exponential always waits"))
            .collect::<Vec<_>>();

        assert_eq!(waits[0], Duration::from_secs(5));
        assert_eq!(waits[1], Duration::from_secs(9));
        assert_eq!(waits[2], Duration::from_secs(17));
        assert_eq!(waits[3], Duration::from_secs(17));
        assert_eq!(waits[5], Duration::from_secs(17));
        assert!(waits.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn linear_backoff_is_capped_by_up_to_times() {
        let backoff = Backoff::linear(Duration::from_millis(100), Duration::from_millis(250), 2);
        let headers = HeaderMap::new();

        assert_eq!(backoff.wait_time(0, &headers), Some(Duration::from_millis(350)));
        assert_eq!(backoff.wait_time(1, &headers), Some(Duration::from_millis(600)));
        assert_eq!(backoff.wait_time(7, &headers), Some(Duration::from_millis(600)));
    }

    #[test]
    fn retry_header_within_max_is_used() {
        let backoff = Backoff::from_retry_header(Some(Duration::from_secs(10)), false, None);
        assert_eq!(
            backoff.wait_time(0, &retry_after("4")),
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn retry_header_above_max_refuses_or_clamps() {
        let refuse = Backoff::from_retry_header(Some(Duration::from_secs(10)), false, None);
        let clamp = Backoff::from_retry_header(Some(Duration::from_secs(10)), true, None);

        assert_eq!(refuse.wait_time(0, &retry_after("30")), None);
        assert_eq!(
            clamp.wait_time(0, &retry_after("30")),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn retry_header_without_max_allows_only_zero() {
        let backoff = Backoff::from_retry_header(None, false, None);
        assert_eq!(backoff.wait_time(0, &retry_after("0")), Some(Duration::ZERO));
        assert_eq!(backoff.wait_time(0, &retry_after("1")), None);
    }

    #[test]
    fn missing_retry_header_delegates_to_fallback() {
        let backoff = Backoff::from_retry_header(
            Some(Duration::from_secs(10)),
            false,
            Some(Backoff::Constant(Duration::from_millis(750))),
        );
        assert_eq!(
            backoff.wait_time(2, &HeaderMap::new()),
            Some(Duration::from_millis(750))
        );
        assert_eq!(
            Backoff::from_retry_header(Some(Duration::from_secs(10)), false, None)
                .wait_time(0, &HeaderMap::new()),
            None
        );
    }

    #[test]
    fn reset_after_header_wins_over_retry_after() {
        let backoff = Backoff::from_retry_header(Some(Duration::from_secs(10)), false, None);
        let mut headers = retry_after("9");
        headers.insert("x-ratelimit-reset-after", HeaderValue::from_static("1.25"));

        assert_eq!(
            backoff.wait_time(0, &headers),
            Some(Duration::from_millis(1250))
        );
    }

    #[test]
    fn retry_after_http_date_is_relative_to_now() {
        let backoff = Backoff::from_retry_header(Some(Duration::from_secs(10)), false, None);
        let now = UNIX_EPOCH + Duration::from_secs(1_445_412_475);
        let headers = retry_after("Wed, 21 Oct 2015 07:28:00 GMT");

        assert_eq!(
            backoff.wait_time_at(0, &headers, now),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            backoff.wait_time_at(0, &headers, SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000_000)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn statuses_below_400_are_filtered() {
        let policy = RetryPolicy::standard().retryable_statuses([200, 304, 500]);
        assert_eq!(
            policy.configured_retryable_statuses().iter().copied().collect::<Vec<_>>(),
            vec![500]
        );
    }

    #[test]
    fn should_retry_respects_max_retries_and_status_set() {
        let policy = RetryPolicy::disabled()
            .retryable_statuses([500])
            .max_retries(3);

        assert!(policy.should_retry(StatusCode::INTERNAL_SERVER_ERROR, 0));
        assert!(policy.should_retry(StatusCode::INTERNAL_SERVER_ERROR, 2));
        assert!(!policy.should_retry(StatusCode::INTERNAL_SERVER_ERROR, 3));
        assert!(!policy.should_retry(StatusCode::BAD_GATEWAY, 0));
        assert!(!policy.allows_bucket_wait(0));
    }

    #[test]
    fn transport_errors_retry_only_when_listed() {
        let policy = RetryPolicy::standard();
        assert!(!policy.should_retry_transport(TransportErrorKind::Connect, 0));

        let policy = policy.retryable_transport_error_kinds([TransportErrorKind::Connect]);
        assert!(policy.should_retry_transport(TransportErrorKind::Connect, 0));
        assert!(!policy.should_retry_transport(TransportErrorKind::Tls, 0));
    }

    #[test]
    fn missing_backoff_means_immediate_retry() {
        let policy = RetryPolicy::standard().no_backoff();
        assert_eq!(policy.wait_time(0, &HeaderMap::new()), Some(Duration::ZERO));
    }

    #[test]
    fn negative_exponential_rate_is_rejected() {
        let policy = RetryPolicy::standard().backoff(Backoff::from_retry_header(
            None,
            false,
            Some(Backoff::exponential(Duration::ZERO, Duration::from_secs(1), -2.0, 3)),
        ));
        assert!(policy.validate().is_err());
        assert!(RetryPolicy::standard().validate().is_ok());
    }
}
