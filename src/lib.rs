//! `reqbucket` is a request orchestration crate for rate-limited REST APIs.
//!
//! Every call goes through one path: response cache, rate-limit gate,
//! transport, limiter feedback, retry decision, cache write-back. Buckets are
//! learned from `x-ratelimit-*` headers, a per-second global ceiling and an
//! invalid-request governor keep the client clear of IP bans, and retries use
//! a composable [`Backoff`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqbucket::prelude::{CachePolicy, Endpoint, EndpointIdentity, HttpClient, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Channel {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder()
//!         .client_name("my-bot")
//!         .try_authorization("Bot my-token")?
//!         .request_timeout(Duration::from_secs(5))
//!         .retry_policy(RetryPolicy::standard().max_retries(3))
//!         .cache_policy(CachePolicy::standard())
//!         .try_build()?;
//!
//!     let endpoint = Endpoint::get("https://discord.com/api/v10/channels/42")
//!         .identity(EndpointIdentity::api("getChannel"))
//!         .path_params(["42"]);
//!     let channel: Channel = client.request(endpoint).send_json().await?;
//!
//!     println!("channel id={}", channel.id);
//!     Ok(())
//! }
//! ```

mod bucket;
mod cache;
mod client;
mod config;
mod endpoint;
mod error;
mod global;
mod metrics;
mod rate_limit;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::bucket::Bucket;
pub use crate::cache::{CacheKey, CachePolicy, CacheRegistry, ResponseCache};
pub use crate::client::{HttpClient, HttpClientBuilder};
pub use crate::config::{ClientProfile, ProfileDefaults};
pub use crate::endpoint::{Endpoint, EndpointClass, EndpointIdentity};
pub use crate::error::{CancelReason, Error, ErrorCode, RateLimitReason, TransportErrorKind};
pub use crate::global::GlobalRateLimitPolicy;
pub use crate::metrics::HttpClientMetricsSnapshot;
pub use crate::rate_limit::{RateLimitDecision, RateLimiter};
pub use crate::request::RequestBuilder;
pub use crate::response::{ErrorBody, HttpResponse, TypedResponse};
pub use crate::retry::{Backoff, RetryPolicy};
#[cfg(feature = "hyper-transport")]
pub use crate::transport::HyperTransport;
pub use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse};

pub type ReqbucketResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    #[cfg(feature = "hyper-transport")]
    pub use crate::HyperTransport;
    pub use crate::{
        Backoff, CachePolicy, CacheRegistry, ClientProfile, Endpoint, EndpointClass,
        EndpointIdentity, Error, ErrorBody, ErrorCode, GlobalRateLimitPolicy, HttpClient,
        HttpClientMetricsSnapshot, HttpResponse, RateLimitDecision, RateLimiter, ReqbucketResult,
        RetryPolicy, Transport, TransportError, TransportErrorKind, TransportRequest,
        TransportResponse, TypedResponse,
    };
}

#[cfg(test)]
mod tests;
