//! Caching strategies.
//!
//! A strategy decides, for one request, whether the answer comes from the
//! cache, the network, or both. Only 2xx network responses are written.

use std::sync::Arc;
use std::time::Duration;

use harbor_common::{with_timeout, HarborError, Result};
use harbor_net::{Fetcher, NetError, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::storage::{CacheHandle, RequestKey};

/// How a routed request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Serve from cache; fetch and store only on a miss.
    CacheFirst,
    /// Fetch first; fall back to the cache on failure or after `timeout`.
    NetworkFirst { timeout: Option<Duration> },
    /// Serve from cache and refresh in the background.
    StaleWhileRevalidate,
    /// Always the network, never the cache.
    NetworkOnly,
    /// Always the cache, never the network.
    CacheOnly,
}

impl StrategyKind {
    pub fn name(&self) -> StrategyName {
        match self {
            StrategyKind::CacheFirst => StrategyName::CacheFirst,
            StrategyKind::NetworkFirst { .. } => StrategyName::NetworkFirst,
            StrategyKind::StaleWhileRevalidate => StrategyName::StaleWhileRevalidate,
            StrategyKind::NetworkOnly => StrategyName::NetworkOnly,
            StrategyKind::CacheOnly => StrategyName::CacheOnly,
        }
    }
}

/// Strategy name as written in route manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyName {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NetworkOnly,
    CacheOnly,
}

impl StrategyName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyName::CacheFirst => "cache-first",
            StrategyName::NetworkFirst => "network-first",
            StrategyName::StaleWhileRevalidate => "stale-while-revalidate",
            StrategyName::NetworkOnly => "network-only",
            StrategyName::CacheOnly => "cache-only",
        }
    }

    /// Build the runtime kind. `timeout` only applies to network-first.
    pub fn into_kind(self, timeout: Option<Duration>) -> StrategyKind {
        match self {
            StrategyName::CacheFirst => StrategyKind::CacheFirst,
            StrategyName::NetworkFirst => StrategyKind::NetworkFirst { timeout },
            StrategyName::StaleWhileRevalidate => StrategyKind::StaleWhileRevalidate,
            StrategyName::NetworkOnly => StrategyKind::NetworkOnly,
            StrategyName::CacheOnly => StrategyKind::CacheOnly,
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// Result of running a strategy.
#[derive(Debug)]
pub struct StrategyOutcome {
    pub response: Response,
    pub source: ResponseSource,
    /// Background refresh started by stale-while-revalidate. Never needs to be
    /// awaited; exposed so callers (and tests) can observe completion.
    pub revalidation: Option<JoinHandle<()>>,
}

impl StrategyOutcome {
    pub fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
            revalidation: None,
        }
    }

    pub fn cache(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Cache,
            revalidation: None,
        }
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

/// A strategy bound to one cache and one network.
#[derive(Clone)]
pub struct Strategy {
    kind: StrategyKind,
    cache: CacheHandle,
    fetcher: Arc<dyn Fetcher>,
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("kind", &self.kind)
            .field("cache", &self.cache.name())
            .finish()
    }
}

impl Strategy {
    pub fn new(kind: StrategyKind, cache: CacheHandle, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            kind,
            cache,
            fetcher,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    /// Answer `request`.
    pub async fn handle(&self, request: Request) -> Result<StrategyOutcome> {
        trace!(url = %request.url, strategy = ?self.kind, cache = %self.cache.name(), "Running strategy");
        match self.kind {
            StrategyKind::CacheFirst => self.cache_first(request).await,
            StrategyKind::NetworkFirst { timeout } => self.network_first(request, timeout).await,
            StrategyKind::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
            StrategyKind::NetworkOnly => {
                let url = request.url.clone();
                let response = self
                    .fetcher
                    .fetch(request)
                    .await
                    .map_err(|e| e.into_unavailable(&url))?;
                Ok(StrategyOutcome::network(response))
            }
            StrategyKind::CacheOnly => {
                let key = RequestKey::for_request(&request);
                match self.cache.lookup(&key).await {
                    Some(entry) => Ok(StrategyOutcome::cache(entry.response.to_response()?)),
                    None => Err(HarborError::network_unavailable(
                        request.url.as_str(),
                        format!("not in cache {}", self.cache.name()),
                    )),
                }
            }
        }
    }

    async fn cache_first(&self, request: Request) -> Result<StrategyOutcome> {
        let key = RequestKey::for_request(&request);
        if let Some(entry) = self.cache.lookup(&key).await {
            debug!(url = %request.url, "Cache hit");
            return Ok(StrategyOutcome::cache(entry.response.to_response()?));
        }
        let url = request.url.clone();
        let response = fetch_and_store(Arc::clone(&self.fetcher), self.cache.clone(), request)
            .await
            .map_err(|e| e.into_unavailable(&url))?;
        Ok(StrategyOutcome::network(response))
    }

    async fn network_first(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<StrategyOutcome> {
        let key = RequestKey::for_request(&request);
        let url = request.url.clone();

        // Spawned so a response that lands after the deadline is still cached.
        let mut task = tokio::spawn(fetch_and_store(
            Arc::clone(&self.fetcher),
            self.cache.clone(),
            request,
        ));
        let joined = match timeout {
            Some(budget) => with_timeout(budget, &mut task).await,
            None => Ok((&mut task).await),
        };

        let failure = match joined {
            Ok(Ok(Ok(response))) => return Ok(StrategyOutcome::network(response)),
            Ok(Ok(Err(net))) => net.into_unavailable(&url),
            Ok(Err(join)) => HarborError::internal(format!("fetch task failed: {join}")),
            Err(elapsed) => {
                debug!(url = %url, "Network-first deadline elapsed, fetch continues in background");
                elapsed
            }
        };

        match self.cache.lookup(&key).await {
            Some(entry) => {
                debug!(url = %url, error = %failure, "Network failed, serving cached response");
                Ok(StrategyOutcome::cache(entry.response.to_response()?))
            }
            None => Err(failure),
        }
    }

    async fn stale_while_revalidate(&self, request: Request) -> Result<StrategyOutcome> {
        let key = RequestKey::for_request(&request);
        let Some(entry) = self.cache.lookup(&key).await else {
            let url = request.url.clone();
            let response = fetch_and_store(Arc::clone(&self.fetcher), self.cache.clone(), request)
                .await
                .map_err(|e| e.into_unavailable(&url))?;
            return Ok(StrategyOutcome::network(response));
        };

        let response = entry.response.to_response()?;
        let fetcher = Arc::clone(&self.fetcher);
        let cache = self.cache.clone();
        let revalidation = tokio::spawn(async move {
            let url = request.url.clone();
            if let Err(e) = fetch_and_store(fetcher, cache, request).await {
                warn!(url = %url, error = %e, "Background revalidation failed");
            }
        });

        Ok(StrategyOutcome {
            response,
            source: ResponseSource::Cache,
            revalidation: Some(revalidation),
        })
    }
}

/// Fetch `request` and, if the response is 2xx, store it.
pub(crate) async fn fetch_and_store(
    fetcher: Arc<dyn Fetcher>,
    cache: CacheHandle,
    request: Request,
) -> std::result::Result<Response, NetError> {
    let key = RequestKey::for_request(&request);
    let response = fetcher.fetch(request).await?;
    if response.ok() {
        cache.store(key, &response, None).await;
    } else {
        debug!(url = %response.url, status = %response.status, "Not caching unsuccessful response");
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::ExpirationPolicy;
    use crate::storage::{CacheEntry, CacheStorage, CachedResponse};
    use harbor_common::SystemClock;
    use harbor_net::testing::ScriptedFetcher;

    const URL: &str = "https://a.test/api/courses";

    async fn setup(kind: StrategyKind) -> (Strategy, Arc<ScriptedFetcher>, CacheHandle) {
        let storage = CacheStorage::new(SystemClock::shared());
        let cache = storage.open("api", ExpirationPolicy::default()).await;
        let fetcher = ScriptedFetcher::new();
        let strategy = Strategy::new(kind, cache.clone(), fetcher.clone());
        (strategy, fetcher, cache)
    }

    async fn seed(cache: &CacheHandle, body: &'static str) {
        cache
            .put(CacheEntry {
                key: RequestKey::get(URL),
                response: CachedResponse::synthetic(URL, 200, body),
                stored_at: cache.now(),
                revision: None,
            })
            .await;
    }

    fn request() -> Request {
        Request::parse(URL).unwrap()
    }

    #[tokio::test]
    async fn test_cache_first_hit_makes_no_network_call() {
        let (strategy, fetcher, cache) = setup(StrategyKind::CacheFirst).await;
        seed(&cache, "cached").await;

        let outcome = strategy.handle(request()).await.unwrap();

        assert!(outcome.is_from_cache());
        assert_eq!(outcome.response.text().unwrap(), "cached");
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_miss_fetches_and_stores() {
        let (strategy, fetcher, cache) = setup(StrategyKind::CacheFirst).await;
        fetcher.respond(URL, 200, "fresh");

        let outcome = strategy.handle(request()).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::Network);
        assert!(cache.contains(&RequestKey::get(URL)).await);

        strategy.handle(request()).await.unwrap();
        assert_eq!(fetcher.calls(URL), 1);
    }

    #[tokio::test]
    async fn test_cache_first_miss_offline_is_unavailable() {
        let (strategy, fetcher, _cache) = setup(StrategyKind::CacheFirst).await;
        fetcher.set_offline(true);

        let err = strategy.handle(request()).await.unwrap_err();
        assert!(matches!(err, HarborError::NetworkUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_non_success_not_cached() {
        let (strategy, fetcher, cache) = setup(StrategyKind::CacheFirst).await;
        fetcher.respond(URL, 500, "oops");

        let outcome = strategy.handle(request()).await.unwrap();
        assert_eq!(outcome.response.status.as_u16(), 500);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_timeout_serves_cache() {
        let (strategy, fetcher, cache) = setup(StrategyKind::NetworkFirst {
            timeout: Some(Duration::from_secs(3)),
        })
        .await;
        seed(&cache, "cached").await;
        fetcher.respond_after(URL, Duration::from_secs(10), 200, "late");

        let outcome = strategy.handle(request()).await.unwrap();
        assert!(outcome.is_from_cache());
        assert_eq!(outcome.response.text().unwrap(), "cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_late_response_still_cached() {
        let (strategy, fetcher, cache) = setup(StrategyKind::NetworkFirst {
            timeout: Some(Duration::from_secs(1)),
        })
        .await;
        seed(&cache, "cached").await;
        fetcher.respond_after(URL, Duration::from_secs(5), 200, "late");

        strategy.handle(request()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let entry = cache.lookup(&RequestKey::get(URL)).await.unwrap();
        assert_eq!(entry.response.body.as_ref(), b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_timeout_without_cache_errors() {
        let (strategy, fetcher, _cache) = setup(StrategyKind::NetworkFirst {
            timeout: Some(Duration::from_secs(3)),
        })
        .await;
        fetcher.respond_after(URL, Duration::from_secs(10), 200, "late");

        let err = strategy.handle(request()).await.unwrap_err();
        assert!(matches!(err, HarborError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_network_first_failure_without_cache_is_unavailable() {
        let (strategy, fetcher, _cache) =
            setup(StrategyKind::NetworkFirst { timeout: None }).await;
        fetcher.fail(URL, "connection reset");

        let err = strategy.handle(request()).await.unwrap_err();
        assert!(matches!(err, HarborError::NetworkUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_network_first_success_replaces_cache() {
        let (strategy, fetcher, cache) =
            setup(StrategyKind::NetworkFirst { timeout: None }).await;
        seed(&cache, "old").await;
        fetcher.respond(URL, 200, "new");

        let outcome = strategy.handle(request()).await.unwrap();
        assert_eq!(outcome.response.text().unwrap(), "new");
        let entry = cache.lookup(&RequestKey::get(URL)).await.unwrap();
        assert_eq!(entry.response.body.as_ref(), b"new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_swr_returns_cached_before_refresh() {
        let (strategy, fetcher, cache) = setup(StrategyKind::StaleWhileRevalidate).await;
        seed(&cache, "stale").await;
        fetcher.respond_after(URL, Duration::from_secs(2), 200, "fresh");

        let outcome = strategy.handle(request()).await.unwrap();
        assert_eq!(outcome.response.text().unwrap(), "stale");
        let stored = cache.lookup(&RequestKey::get(URL)).await.unwrap();
        assert_eq!(stored.response.body.as_ref(), b"stale");

        outcome.revalidation.unwrap().await.unwrap();
        let stored = cache.lookup(&RequestKey::get(URL)).await.unwrap();
        assert_eq!(stored.response.body.as_ref(), b"fresh");
    }

    #[tokio::test]
    async fn test_swr_refresh_failure_is_swallowed() {
        let (strategy, fetcher, cache) = setup(StrategyKind::StaleWhileRevalidate).await;
        seed(&cache, "stale").await;
        fetcher.set_offline(true);

        let outcome = strategy.handle(request()).await.unwrap();
        outcome.revalidation.unwrap().await.unwrap();
        assert!(cache.contains(&RequestKey::get(URL)).await);
    }

    #[tokio::test]
    async fn test_swr_miss_blocks_on_network() {
        let (strategy, fetcher, _cache) = setup(StrategyKind::StaleWhileRevalidate).await;
        fetcher.respond(URL, 200, "fresh");

        let outcome = strategy.handle(request()).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::Network);
        assert!(outcome.revalidation.is_none());
    }

    #[tokio::test]
    async fn test_network_only_never_caches() {
        let (strategy, fetcher, cache) = setup(StrategyKind::NetworkOnly).await;
        fetcher.respond(URL, 200, "fresh");

        strategy.handle(request()).await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_only_miss_is_unavailable() {
        let (strategy, fetcher, _cache) = setup(StrategyKind::CacheOnly).await;
        fetcher.respond(URL, 200, "fresh");

        assert!(strategy.handle(request()).await.is_err());
        assert_eq!(fetcher.total_calls(), 0);
    }
}
