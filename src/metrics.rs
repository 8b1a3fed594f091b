use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::response::HttpResponse;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub transport_attempts: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub gate_waits: u64,
    pub rate_limited: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct HttpClientMetrics {
    inner: Option<Arc<HttpClientMetricsInner>>,
}

#[derive(Debug, Default)]
struct HttpClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    transport_attempts: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    gate_waits: AtomicU64,
    rate_limited: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<HttpClientMetricsInner>>,
}

impl HttpClientMetrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(HttpClientMetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    fn bump(&self, counter: impl FnOnce(&HttpClientMetricsInner) -> &AtomicU64) {
        if let Some(inner) = &self.inner {
            counter(inner).fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_request_started(&self) {
        self.bump(|inner| &inner.requests_started);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    pub(crate) fn record_transport_attempt(&self) {
        self.bump(|inner| &inner.transport_attempts);
    }

    pub(crate) fn record_retry(&self) {
        self.bump(|inner| &inner.retries);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.bump(|inner| &inner.cache_hits);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.bump(|inner| &inner.cache_misses);
    }

    pub(crate) fn record_gate_wait(&self) {
        self.bump(|inner| &inner.gate_waits);
    }

    pub(crate) fn record_request_completed(
        &self,
        result: &Result<HttpResponse, Error>,
        latency: Duration,
    ) {
        let Some(inner) = &self.inner else {
            return;
        };

        match result {
            Ok(response) => {
                inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
            }
            Err(error) => {
                inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                match error {
                    Error::RateLimited { reason, .. } => {
                        inner.rate_limited.fetch_add(1, Ordering::Relaxed);
                        self.add_error_count(format!("rate_limited:{reason}"));
                    }
                    Error::Transport { kind, .. } => {
                        self.add_error_count(format!("transport:{kind}"));
                    }
                    Error::Cancelled { reason, .. } => {
                        self.add_error_count(format!("cancelled:{reason}"));
                    }
                    other => self.add_error_count(other.code().as_str().to_owned()),
                }
            }
        }
        self.record_latency(latency);
    }

    pub(crate) fn snapshot(&self) -> HttpClientMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return HttpClientMetricsSnapshot::default();
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        HttpClientMetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            transport_attempts: inner.transport_attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            cache_hits: inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: inner.cache_misses.load(Ordering::Relaxed),
            gate_waits: inner.gate_waits.load(Ordering::Relaxed),
            rate_limited: inner.rate_limited.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    fn add_status_count(&self, status: u16) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut status_counts = lock_unpoisoned(&inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
