use std::time::Duration;

use crate::cache::CachePolicy;
use crate::retry::{Backoff, RetryPolicy};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    StandardSdk,
    LowLatency,
    Background,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub request_timeout: Duration,
    pub total_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub cache_policy: CachePolicy,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::StandardSdk => ProfileDefaults {
                request_timeout: Duration::from_secs(10),
                total_timeout: None,
                retry_policy: RetryPolicy::standard(),
                cache_policy: CachePolicy::disabled(),
            },
            Self::LowLatency => ProfileDefaults {
                request_timeout: Duration::from_secs(2),
                total_timeout: Some(Duration::from_secs(5)),
                retry_policy: RetryPolicy::standard().max_retries(1).backoff(
                    Backoff::from_retry_header(
                        Some(Duration::from_secs(1)),
                        false,
                        Some(Backoff::Constant(Duration::from_millis(100))),
                    ),
                ),
                cache_policy: CachePolicy::standard(),
            },
            Self::Background => ProfileDefaults {
                request_timeout: Duration::from_secs(30),
                total_timeout: Some(Duration::from_secs(300)),
                retry_policy: RetryPolicy::standard().max_retries(6).backoff(
                    Backoff::from_retry_header(
                        Some(Duration::from_secs(120)),
                        true,
                        Some(Backoff::exponential(
                            Duration::from_millis(250),
                            Duration::from_millis(500),
                            2.0,
                            6,
                        )),
                    ),
                ),
                cache_policy: CachePolicy::standard(),
            },
        }
    }
}
