use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, Uri};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::ReqbucketResult;
use crate::cache::{CacheKey, CachePolicy, CacheRegistry, ResponseCache};
use crate::config::ClientProfile;
use crate::endpoint::Endpoint;
use crate::error::{CancelReason, Error, RateLimitReason, TransportErrorKind};
use crate::global::GlobalRateLimitPolicy;
use crate::metrics::{HttpClientMetrics, HttpClientMetricsSnapshot};
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::request::RequestBuilder;
use crate::response::HttpResponse;
use crate::retry::RetryPolicy;
use crate::transport::{Transport, TransportRequest};
use crate::util::{
    append_query_pairs, parse_header_name, parse_header_value, redact_uri_for_logs,
    remaining_until,
};

const DEFAULT_CACHE_GC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_CLIENT_NAME: &str = "reqbucket";
const DEFAULT_USER_AGENT: &str = concat!("reqbucket/", env!("CARGO_PKG_VERSION"));

pub(crate) struct RequestExecution {
    pub(crate) endpoint: Endpoint,
    pub(crate) query_pairs: Vec<(String, Option<String>)>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) total_timeout: Option<Duration>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) cancellation: Option<CancellationToken>,
}

struct CacheTarget {
    cache: Arc<ResponseCache>,
    key: CacheKey,
    ttl: Duration,
}

pub struct HttpClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    authorization: Option<HeaderValue>,
    user_agent: HeaderValue,
    default_headers: HeaderMap,
    request_timeout: Duration,
    total_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    cache_policy: CachePolicy,
    cache_registry: Option<CacheRegistry>,
    cache_gc_interval: Duration,
    global_rate_limit_policy: GlobalRateLimitPolicy,
    rate_limiter: Option<RateLimiter>,
    client_name: String,
    metrics_enabled: bool,
}

impl HttpClientBuilder {
    pub(crate) fn new() -> Self {
        let defaults = ClientProfile::default().defaults();
        Self {
            transport: None,
            authorization: None,
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
            default_headers: HeaderMap::new(),
            request_timeout: defaults.request_timeout,
            total_timeout: defaults.total_timeout,
            retry_policy: defaults.retry_policy,
            cache_policy: defaults.cache_policy,
            cache_registry: None,
            cache_gc_interval: DEFAULT_CACHE_GC_INTERVAL,
            global_rate_limit_policy: GlobalRateLimitPolicy::standard(),
            rate_limiter: None,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            metrics_enabled: true,
        }
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.request_timeout = defaults.request_timeout;
        self.total_timeout = defaults.total_timeout;
        self.retry_policy = defaults.retry_policy;
        self.cache_policy = defaults.cache_policy;
        self
    }

    pub fn transport(self, transport: impl Transport + 'static) -> Self {
        self.shared_transport(Arc::new(transport))
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn authorization(mut self, mut authorization: HeaderValue) -> Self {
        authorization.set_sensitive(true);
        self.authorization = Some(authorization);
        self
    }

    pub fn try_authorization(self, authorization: &str) -> ReqbucketResult<Self> {
        let authorization = parse_header_value(AUTHORIZATION.as_str(), authorization)?;
        Ok(self.authorization(authorization))
    }

    pub fn user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> ReqbucketResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    pub fn cache_registry(mut self, cache_registry: CacheRegistry) -> Self {
        self.cache_registry = Some(cache_registry);
        self
    }

    pub fn cache_gc_interval(mut self, gc_interval: Duration) -> Self {
        self.cache_gc_interval = gc_interval.max(Duration::from_millis(1));
        self
    }

    /// Ignored when a shared limiter is supplied through
    /// [`HttpClientBuilder::rate_limiter`].
    pub fn global_rate_limit_policy(mut self, policy: GlobalRateLimitPolicy) -> Self {
        self.global_rate_limit_policy = policy;
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> ReqbucketResult<HttpClient> {
        self.retry_policy.validate().map_err(Error::configuration)?;
        let rate_limiter = match self.rate_limiter {
            Some(rate_limiter) => rate_limiter,
            None => {
                let policy = self
                    .global_rate_limit_policy
                    .validate()
                    .map_err(Error::configuration)?;
                RateLimiter::new(policy)
            }
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let cache_registry = self
            .cache_registry
            .unwrap_or_else(|| CacheRegistry::with_gc_interval(self.cache_gc_interval));
        let metrics = if self.metrics_enabled {
            HttpClientMetrics::enabled()
        } else {
            HttpClientMetrics::disabled()
        };

        Ok(HttpClient {
            transport,
            authorization: self.authorization,
            user_agent: self.user_agent,
            default_headers: self.default_headers,
            request_timeout: self.request_timeout,
            total_timeout: self.total_timeout,
            retry_policy: self.retry_policy,
            cache_policy: Arc::new(self.cache_policy),
            cache_registry,
            rate_limiter,
            client_name: self.client_name,
            metrics,
        })
    }

    #[track_caller]
    pub fn build(self) -> HttpClient {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build reqbucket http client: {error}"))
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "hyper-transport")]
fn default_transport() -> ReqbucketResult<Arc<dyn Transport>> {
    Ok(Arc::new(crate::transport::HyperTransport::new()))
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport() -> ReqbucketResult<Arc<dyn Transport>> {
    Err(Error::configuration(
        "no transport configured and the hyper-transport feature is disabled",
    ))
}

#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    authorization: Option<HeaderValue>,
    user_agent: HeaderValue,
    default_headers: HeaderMap,
    request_timeout: Duration,
    total_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    cache_policy: Arc<CachePolicy>,
    cache_registry: CacheRegistry,
    rate_limiter: RateLimiter,
    client_name: String,
    metrics: HttpClientMetrics,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    pub fn request(&self, endpoint: Endpoint) -> RequestBuilder<'_> {
        RequestBuilder::new(self, endpoint)
    }

    pub async fn send(&self, endpoint: Endpoint) -> ReqbucketResult<HttpResponse> {
        self.request(endpoint).send().await
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn cache_registry(&self) -> &CacheRegistry {
        &self.cache_registry
    }

    pub fn metrics_snapshot(&self) -> HttpClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) async fn send_request(
        &self,
        execution: RequestExecution,
    ) -> ReqbucketResult<HttpResponse> {
        let uri_text = append_query_pairs(execution.endpoint.url(), &execution.query_pairs);
        let redacted_uri_text = redact_uri_for_logs(&uri_text);
        let uri = uri_text.parse::<Uri>().map_err(|_| Error::InvalidUri {
            uri: redacted_uri_text.clone(),
        })?;

        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();
        let request_started_at = Instant::now();
        let result = self
            .send_request_with_retry(execution, uri, redacted_uri_text)
            .await;
        self.metrics
            .record_request_completed(&result, request_started_at.elapsed());
        result
    }

    fn credential_for(&self, endpoint: &Endpoint) -> Option<&HeaderValue> {
        if endpoint.needs_auth_header() {
            self.authorization.as_ref()
        } else {
            None
        }
    }

    fn cache_target(
        &self,
        endpoint: &Endpoint,
        query_pairs: &[(String, Option<String>)],
    ) -> Option<CacheTarget> {
        if !endpoint.is_cacheable() {
            return None;
        }
        let identity = endpoint.identity_ref()?;
        let ttl = self.cache_policy.ttl_for(identity)?;
        Some(CacheTarget {
            cache: self.cache_registry.cache_for(self.credential_for(endpoint)),
            key: CacheKey::new(
                identity.clone(),
                endpoint.path_params_ref().to_vec(),
                query_pairs.to_vec(),
            ),
            ttl,
        })
    }

    fn merged_headers(&self, endpoint: &Endpoint, request_headers: HeaderMap) -> HeaderMap {
        let mut merged = self.default_headers.clone();
        for (name, value) in &request_headers {
            merged.insert(name.clone(), value.clone());
        }
        if !merged.contains_key(USER_AGENT) {
            merged.insert(USER_AGENT, self.user_agent.clone());
        }
        if let Some(authorization) = self.credential_for(endpoint) {
            merged.insert(AUTHORIZATION, authorization.clone());
        }
        merged
    }

    async fn send_request_with_retry(
        &self,
        execution: RequestExecution,
        uri: Uri,
        redacted_uri_text: String,
    ) -> ReqbucketResult<HttpResponse> {
        let RequestExecution {
            endpoint,
            query_pairs,
            headers,
            body,
            request_timeout,
            total_timeout,
            retry_policy,
            cancellation,
        } = execution;
        let method = endpoint.method().clone();
        let identity = endpoint.identity_ref();
        let counts_against_global = !endpoint.is_global_exempt();
        let retry_policy = match retry_policy {
            Some(retry_policy) => {
                retry_policy.validate().map_err(Error::configuration)?;
                retry_policy
            }
            None => self.retry_policy.clone(),
        };
        let request_timeout = request_timeout.unwrap_or(self.request_timeout);
        // A deadline past the clock's range is no deadline at all.
        let deadline = total_timeout
            .or(self.total_timeout)
            .and_then(|total_timeout| Instant::now().checked_add(total_timeout));
        let cancellation = cancellation.unwrap_or_default();
        let waiter = Waiter {
            cancellation: &cancellation,
            deadline,
            method: &method,
            uri: &redacted_uri_text,
        };

        let cache_target = self.cache_target(&endpoint, &query_pairs);
        if let Some(target) = &cache_target {
            if let Some(cached) = target.cache.get(&target.key) {
                debug!(
                    client = %self.client_name,
                    uri = %redacted_uri_text,
                    "serving response from cache"
                );
                self.metrics.record_cache_hit();
                return Ok(cached);
            }
            self.metrics.record_cache_miss();
        }

        let headers = self.merged_headers(&endpoint, headers);
        let mut attempts: u32 = 0;
        let mut resuming_after_wait = false;

        loop {
            let decision = if resuming_after_wait {
                self.rate_limiter
                    .decide_after_wait(identity, counts_against_global)
            } else {
                self.rate_limiter.decide(identity, counts_against_global)
            };
            resuming_after_wait = false;

            match decision {
                RateLimitDecision::Allow => {}
                RateLimitDecision::Deny(reason) => {
                    warn!(
                        client = %self.client_name,
                        method = %method,
                        uri = %redacted_uri_text,
                        %reason,
                        "request refused by rate limiter"
                    );
                    return Err(waiter.rate_limited(reason));
                }
                RateLimitDecision::After(wait) => {
                    if !retry_policy.allows_bucket_wait(attempts) {
                        return Err(waiter.rate_limited(RateLimitReason::BucketExhausted));
                    }
                    debug!(
                        client = %self.client_name,
                        uri = %redacted_uri_text,
                        wait_ms = wait.as_millis() as u64,
                        "waiting for rate limit reset"
                    );
                    self.metrics.record_gate_wait();
                    waiter.wait(wait).await?;
                    self.rate_limiter.record_global_usage();
                    if retry_policy.bucket_wait_consumes_retries() {
                        attempts += 1;
                    }
                    resuming_after_wait = true;
                    continue;
                }
            }

            let span = info_span!(
                "reqbucket.request",
                client = %self.client_name,
                method = %method,
                uri = %redacted_uri_text,
                attempt = attempts + 1
            );
            let Some(attempt_timeout) = waiter.attempt_timeout(request_timeout) else {
                return Err(waiter.cancelled(CancelReason::Deadline));
            };

            self.metrics.record_transport_attempt();
            let request = TransportRequest {
                method: method.clone(),
                uri: uri.clone(),
                headers: headers.clone(),
                body: body.clone(),
            };
            let outcome = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    return Err(waiter.cancelled(CancelReason::Token));
                }
                outcome = timeout(attempt_timeout, self.transport.execute(request))
                    .instrument(span.clone()) => outcome,
            };

            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(transport_error)) => {
                    let kind = transport_error.kind();
                    if retry_policy.should_retry_transport(kind, attempts)
                        && let Some(wait) = retry_policy.wait_time(attempts, &HeaderMap::new())
                    {
                        warn!(parent: &span, %kind, wait_ms = wait.as_millis() as u64, "retrying after transport error");
                        self.metrics.record_retry();
                        waiter.wait(wait).await?;
                        attempts += 1;
                        continue;
                    }
                    return Err(Error::Transport {
                        kind,
                        method,
                        uri: redacted_uri_text,
                        source: transport_error.into_source(),
                    });
                }
                Err(_elapsed) => {
                    if waiter.deadline_passed() {
                        return Err(waiter.cancelled(CancelReason::Deadline));
                    }
                    if retry_policy.should_retry_transport(TransportErrorKind::Timeout, attempts)
                        && let Some(wait) = retry_policy.wait_time(attempts, &HeaderMap::new())
                    {
                        warn!(parent: &span, wait_ms = wait.as_millis() as u64, "retrying after attempt timeout");
                        self.metrics.record_retry();
                        waiter.wait(wait).await?;
                        attempts += 1;
                        continue;
                    }
                    return Err(Error::Timeout {
                        timeout_ms: attempt_timeout.as_millis(),
                        method,
                        uri: redacted_uri_text,
                    });
                }
            };

            self.rate_limiter
                .observe(identity, &response.headers, response.status);

            if retry_policy.should_retry(response.status, attempts) {
                match retry_policy.wait_time(attempts, &response.headers) {
                    Some(wait) => {
                        warn!(
                            parent: &span,
                            status = response.status.as_u16(),
                            wait_ms = wait.as_millis() as u64,
                            "retrying request"
                        );
                        self.metrics.record_retry();
                        waiter.wait(wait).await?;
                        attempts += 1;
                        continue;
                    }
                    None => {
                        debug!(
                            parent: &span,
                            status = response.status.as_u16(),
                            "backoff declined to retry"
                        );
                    }
                }
            }

            debug!(parent: &span, status = response.status.as_u16(), "request finished");
            let response = HttpResponse::new(response.status, response.headers, response.body)
                .with_request(method, redacted_uri_text);
            if response.is_success()
                && let Some(target) = cache_target
            {
                target.cache.put(target.key, response.clone(), target.ttl);
            }
            return Ok(response);
        }
    }
}

struct Waiter<'a> {
    cancellation: &'a CancellationToken,
    deadline: Option<Instant>,
    method: &'a Method,
    uri: &'a str,
}

impl Waiter<'_> {
    async fn wait(&self, wait: Duration) -> ReqbucketResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(self.cancelled(CancelReason::Token));
        }
        match remaining_until(self.deadline, Instant::now()) {
            None => return Err(self.cancelled(CancelReason::Deadline)),
            // Sleeping past the deadline can only end in failure.
            Some(Some(remaining)) if remaining < wait => {
                return Err(self.cancelled(CancelReason::Deadline));
            }
            Some(_) => {}
        }
        if wait.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = self.cancellation.cancelled() => Err(self.cancelled(CancelReason::Token)),
            _ = sleep(wait) => Ok(()),
        }
    }

    fn attempt_timeout(&self, request_timeout: Duration) -> Option<Duration> {
        match remaining_until(self.deadline, Instant::now())? {
            Some(remaining) => Some(request_timeout.min(remaining)),
            None => Some(request_timeout),
        }
    }

    fn deadline_passed(&self) -> bool {
        remaining_until(self.deadline, Instant::now()).is_none()
    }

    fn cancelled(&self, reason: CancelReason) -> Error {
        Error::Cancelled {
            reason,
            method: self.method.clone(),
            uri: self.uri.to_owned(),
        }
    }

    fn rate_limited(&self, reason: RateLimitReason) -> Error {
        Error::RateLimited {
            reason,
            method: self.method.clone(),
            uri: self.uri.to_owned(),
        }
    }
}
