use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use http::HeaderValue;
use sha2::{Digest, Sha256};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::endpoint::{EndpointClass, EndpointIdentity};
use crate::response::HttpResponse;
use crate::util::{instant_after, lock_unpoisoned};

const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_API_TTL: Duration = Duration::from_secs(5);
const DEFAULT_CDN_TTL: Duration = Duration::from_secs(60);
const SWEEP_BATCH_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    identity: EndpointIdentity,
    path_params: Vec<String>,
    query: Vec<(String, Option<String>)>,
}

impl CacheKey {
    pub fn new(
        identity: EndpointIdentity,
        path_params: Vec<String>,
        query: Vec<(String, Option<String>)>,
    ) -> Self {
        Self {
            identity,
            path_params,
            query,
        }
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachePolicy {
    class_ttls: BTreeMap<EndpointClass, Duration>,
    endpoint_ttls: HashMap<EndpointIdentity, Duration>,
}

impl CachePolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        Self::disabled()
            .class_ttl(EndpointClass::Api, DEFAULT_API_TTL)
            .class_ttl(EndpointClass::Cdn, DEFAULT_CDN_TTL)
    }

    pub fn class_ttl(mut self, class: EndpointClass, ttl: Duration) -> Self {
        self.class_ttls.insert(class, ttl);
        self
    }

    /// A zero TTL switches caching off for `identity` even when its class has
    /// a default.
    pub fn endpoint_ttl(mut self, identity: EndpointIdentity, ttl: Duration) -> Self {
        self.endpoint_ttls.insert(identity, ttl);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.class_ttls.values().any(|ttl| !ttl.is_zero())
            || self.endpoint_ttls.values().any(|ttl| !ttl.is_zero())
    }

    pub fn ttl_for(&self, identity: &EndpointIdentity) -> Option<Duration> {
        let ttl = match self.endpoint_ttls.get(identity) {
            Some(ttl) => *ttl,
            None => *self.class_ttls.get(&identity.class())?,
        };
        (!ttl.is_zero()).then_some(ttl)
    }
}

#[derive(Debug)]
struct CacheEntry {
    expires_at: Instant,
    response: HttpResponse,
}

type CacheEntries = Mutex<HashMap<CacheKey, CacheEntry>>;

#[derive(Debug)]
pub struct ResponseCache {
    entries: Arc<CacheEntries>,
    gc_cancel: CancellationToken,
}

impl ResponseCache {
    pub fn new(gc_interval: Duration) -> Self {
        let entries = Arc::new(Mutex::new(HashMap::new()));
        let gc_cancel = CancellationToken::new();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(run_gc(
                Arc::downgrade(&entries),
                gc_cancel.clone(),
                gc_interval.max(Duration::from_millis(1)),
            ));
        }

        Self { entries, gc_cancel }
    }

    pub fn get(&self, key: &CacheKey) -> Option<HttpResponse> {
        self.get_at(key, Instant::now())
    }

    pub fn put(&self, key: CacheKey, response: HttpResponse, ttl: Duration) {
        self.put_at(key, response, ttl, Instant::now());
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    pub(crate) fn get_at(&self, key: &CacheKey, now: Instant) -> Option<HttpResponse> {
        let mut entries = lock_unpoisoned(&self.entries);
        let entry = entries.get(key)?;
        if entry.expires_at <= now {
            entries.remove(key);
            return None;
        }
        Some(entry.response.clone())
    }

    pub(crate) fn put_at(&self, key: CacheKey, response: HttpResponse, ttl: Duration, now: Instant) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry {
            expires_at: instant_after(now, ttl),
            response,
        };
        lock_unpoisoned(&self.entries).insert(key, entry);
    }

    #[cfg(test)]
    fn sweep_at(&self, now: Instant) -> usize {
        sweep_expired(&self.entries, now)
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        self.gc_cancel.cancel();
    }
}

fn sweep_expired(entries: &CacheEntries, now: Instant) -> usize {
    let expired = {
        let entries = lock_unpoisoned(entries);
        entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>()
    };

    let mut removed = 0;
    for batch in expired.chunks(SWEEP_BATCH_SIZE) {
        let mut entries = lock_unpoisoned(entries);
        for key in batch {
            // The entry may have been refreshed since the scan.
            if entries
                .get(key)
                .is_some_and(|entry| entry.expires_at <= now)
            {
                entries.remove(key);
                removed += 1;
            }
        }
    }
    removed
}

async fn run_gc(entries: Weak<CacheEntries>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let removed = sweep_expired(&entries, Instant::now());
                if removed > 0 {
                    debug!(removed, "evicted expired cache entries");
                }
            }
        }
    }
}

type CredentialFingerprint = Option<[u8; 32]>;

#[derive(Clone, Debug)]
pub struct CacheRegistry {
    caches: Arc<Mutex<HashMap<CredentialFingerprint, Arc<ResponseCache>>>>,
    gc_interval: Duration,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::with_gc_interval(DEFAULT_GC_INTERVAL)
    }

    pub fn with_gc_interval(gc_interval: Duration) -> Self {
        Self {
            caches: Arc::new(Mutex::new(HashMap::new())),
            gc_interval,
        }
    }

    pub fn cache_for(&self, credential: Option<&HeaderValue>) -> Arc<ResponseCache> {
        let fingerprint = credential.map(credential_fingerprint);
        let mut caches = lock_unpoisoned(&self.caches);
        let cache = caches
            .entry(fingerprint)
            .or_insert_with(|| Arc::new(ResponseCache::new(self.gc_interval)));
        Arc::clone(cache)
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.caches).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn credential_fingerprint(credential: &HeaderValue) -> [u8; 32] {
    Sha256::digest(credential.as_bytes()).into()
}
