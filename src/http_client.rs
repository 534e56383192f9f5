//! Rate-Limited HTTP Client.
//!
//! Thin wrapper around `reqwest` providing a TTL cache keyed by
//! `(url, canonical-query-string)`, a per-host concurrency bound via a
//! `tokio::sync::Semaphore` (FIFO queueing for excess callers comes for
//! free from `Semaphore::acquire`), and bounded exponential-backoff
//! retries with full jitter.

use parking_lot::Mutex;
use rand::Rng;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::HttpClientConfig;
use crate::errors::{CancelledError, UpstreamError};
use crate::event_bus::ComponentMetrics;

struct CacheEntry {
    body: String,
    fetched_at: Instant,
}

/// Outcome of a single `fetch` call.
#[derive(Debug)]
pub enum FetchError {
    Upstream(UpstreamError),
    Cancelled(CancelledError),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Upstream(e) => write!(f, "{e}"),
            FetchError::Cancelled(e) => write!(f, "{e}"),
        }
    }
}
impl std::error::Error for FetchError {}

/// Per-host semaphore pool, created lazily on first request to that host.
struct HostLimiter {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    permits_per_host: usize,
}

impl HostLimiter {
    fn new(permits_per_host: usize) -> Self {
        Self {
            semaphores: Mutex::new(HashMap::new()),
            permits_per_host,
        }
    }

    fn for_host(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock();
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits_per_host)))
            .clone()
    }
}

pub struct RateLimitedHttpClient {
    client: reqwest::Client,
    config: HttpClientConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
    limiter: HostLimiter,
    pub metrics: ComponentMetrics,
    inflight_by_host: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl RateLimitedHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            limiter: HostLimiter::new(config.max_concurrent_per_host),
            config,
            cache: Mutex::new(HashMap::new()),
            metrics: ComponentMetrics::default(),
            inflight_by_host: Mutex::new(HashMap::new()),
        })
    }

    fn cache_key(url: &str, query: &str) -> String {
        format!("{url}?{query}")
    }

    fn host_of(url: &str) -> String {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Number of requests currently in flight for a host. Exposed so tests
    /// and the metrics snapshot can assert the rate-limit invariant:
    /// per-host concurrent in-flight requests never exceed the configured
    /// bound.
    pub fn inflight_for_host(&self, host: &str) -> usize {
        self.inflight_by_host
            .lock()
            .get(host)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Fetch `url` (with an already-canonicalized `query` string used only
    /// for the cache key) and deserialize the JSON body as `T`.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &str,
    ) -> Result<T, FetchError> {
        let body = self.fetch_text(url, query).await?;
        serde_json::from_str(&body).map_err(|e| {
            FetchError::Upstream(UpstreamError {
                source_name: url.to_string(),
                reason: format!("invalid JSON body: {e}"),
            })
        })
    }

    /// Fetch `url` as raw text, honoring the TTL cache and retry policy.
    pub async fn fetch_text(&self, url: &str, query: &str) -> Result<String, FetchError> {
        let key = Self::cache_key(url, query);
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);

        if let Some(entry) = self.cache.lock().get(&key) {
            if entry.fetched_at.elapsed() < ttl {
                return Ok(entry.body.clone());
            }
        }

        match self.fetch_with_retries(url).await {
            Ok(body) => {
                self.cache.lock().insert(
                    key,
                    CacheEntry {
                        body: body.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(body)
            }
            Err(err) => {
                // On refresh error, fall back to the expired cached value
                // if one exists, logging the error instead of propagating
                // it.
                if let Some(entry) = self.cache.lock().get(&key) {
                    warn!(url, error = %err, "refresh failed, serving stale cached value");
                    return Ok(entry.body.clone());
                }
                Err(err)
            }
        }
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<String, FetchError> {
        let host = Self::host_of(url);
        let semaphore = self.limiter.for_host(&host);
        let inflight_counter = {
            let mut map = self.inflight_by_host.lock();
            map.entry(host.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone()
        };

        let _permit = semaphore.acquire().await.map_err(|_| {
            FetchError::Cancelled(CancelledError)
        })?;
        inflight_counter.fetch_add(1, Ordering::SeqCst);
        let _guard = scopeguard(&inflight_counter);

        self.metrics.record_request();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.metrics.record_success();
                    return resp.text().await.map_err(|e| {
                        self.metrics.record_error();
                        FetchError::Upstream(UpstreamError {
                            source_name: host.clone(),
                            reason: format!("failed reading response body: {e}"),
                        })
                    });
                }
                Ok(resp) if Self::is_transient_status(resp.status()) && attempt <= self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    debug!(url, attempt, status = %resp.status(), delay_ms = delay.as_millis() as u64, "retrying after transient HTTP status");
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => {
                    self.metrics.record_error();
                    return Err(FetchError::Upstream(UpstreamError {
                        source_name: host,
                        reason: format!("HTTP {}", resp.status()),
                    }));
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt <= self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    debug!(url, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying after network error");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.record_error();
                    return Err(FetchError::Upstream(UpstreamError {
                        source_name: host,
                        reason: e.to_string(),
                    }));
                }
            }
        }
    }

    fn is_transient_status(status: StatusCode) -> bool {
        status.is_server_error()
    }

    /// Exponential backoff with full jitter: `random(0, min(cap, base * 2^attempt))`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms;
        let cap = self.config.backoff_cap_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let bound = exp.min(cap).max(1);
        let jittered = rand::thread_rng().gen_range(0..=bound);
        Duration::from_millis(jittered)
    }
}

/// Decrements the per-host in-flight counter when the fetch finishes,
/// success or failure alike.
fn scopeguard(counter: &Arc<AtomicUsize>) -> impl Drop + '_ {
    struct Guard<'a>(&'a Arc<AtomicUsize>);
    impl<'a> Drop for Guard<'a> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }
    Guard(counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        let client = RateLimitedHttpClient::new(HttpClientConfig {
            backoff_base_ms: 250,
            backoff_cap_ms: 4_000,
            ..Default::default()
        })
        .unwrap();

        for attempt in 1..10 {
            let delay = client.backoff_delay(attempt);
            assert!(delay.as_millis() as u64 <= 4_000);
        }
    }

    #[test]
    fn cache_key_distinguishes_queries() {
        let a = RateLimitedHttpClient::cache_key("https://x/y", "a=1");
        let b = RateLimitedHttpClient::cache_key("https://x/y", "a=2");
        assert_ne!(a, b);
    }
}
