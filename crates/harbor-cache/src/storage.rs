//! Named caches and the storage that owns them.
//!
//! ```text
//! CacheStorage
//!     └── CacheHandle (one async mutex per cache name)
//!             └── NamedCache
//!                     └── CacheEntry (insertion ordered)
//! ```
//!
//! All writes to a cache go through its handle, so eviction never interleaves
//! with another write to the same cache. Different caches are independent.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use harbor_common::{HarborError, Result, SharedClock, Timestamp};
use harbor_net::Response;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::expiration::{EvictionReport, ExpirationPolicy};

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    /// Key for `method url`.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.as_str(), url))
    }

    /// Key for a GET of `url`.
    pub fn get(url: &str) -> Self {
        match Url::parse(url) {
            Ok(parsed) => Self::new(&Method::GET, &parsed),
            Err(_) => Self(format!("GET {url}")),
        }
    }

    /// Key for an outgoing request.
    pub fn for_request(request: &harbor_net::Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Capture a network response.
    pub fn from_response(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().clone(),
        }
    }

    /// A response built in place, for fixtures and restored state.
    pub fn synthetic(url: &str, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.to_string(),
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Rebuild a [`Response`].
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| HarborError::internal(format!("stored url {}: {}", self.url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| HarborError::internal(format!("stored status {}: {}", self.status, e)))?;
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }
        Ok(Response::new(url, status, headers, self.body.clone()))
    }
}

/// One request/response pair. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub response: CachedResponse,
    /// When the entry was written (ms since epoch).
    pub stored_at: Timestamp,
    /// Precache revision, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// A named, insertion-ordered collection of entries with its own policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCache {
    name: String,
    policy: ExpirationPolicy,
    entries: Vec<CacheEntry>,
}

impl NamedCache {
    /// Create an empty cache.
    pub fn new(name: &str, policy: ExpirationPolicy) -> Self {
        Self {
            name: name.to_string(),
            policy,
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ExpirationPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ExpirationPolicy) {
        self.policy = policy;
    }

    /// Look up an entry.
    pub fn get(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }

    /// Store an entry. An existing entry for the same key is replaced and the
    /// new one becomes the newest insertion.
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let previous = self.remove(&entry.key);
        self.entries.push(entry);
        previous
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &RequestKey) -> Option<CacheEntry> {
        let index = self.entries.iter().position(|e| &e.key == key)?;
        Some(self.entries.remove(index))
    }

    /// Remove every entry matching `predicate`, returning their keys.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&CacheEntry) -> bool) -> Vec<RequestKey> {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            if predicate(entry) {
                removed.push(entry.key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove the `count` oldest insertions.
    pub fn remove_oldest(&mut self, count: usize) -> Vec<RequestKey> {
        let count = count.min(self.entries.len());
        self.entries.drain(..count).map(|e| e.key).collect()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<RequestKey> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct CacheCell {
    cache: Mutex<NamedCache>,
    clock: SharedClock,
}

/// Shared handle to one named cache. Cloning is cheap.
#[derive(Clone)]
pub struct CacheHandle {
    name: Arc<str>,
    cell: Arc<CacheCell>,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle").field("name", &self.name).finish()
    }
}

impl CacheHandle {
    fn new(cache: NamedCache, clock: SharedClock) -> Self {
        Self {
            name: Arc::from(cache.name()),
            cell: Arc::new(CacheCell {
                cache: Mutex::new(cache),
                clock,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current time on this cache's clock.
    pub fn now(&self) -> Timestamp {
        self.cell.clock.now()
    }

    /// Sweep expired entries, then look up `key`.
    pub async fn lookup(&self, key: &RequestKey) -> Option<CacheEntry> {
        let mut cache = self.cell.cache.lock().await;
        let policy = cache.policy();
        let report = policy.evict(&mut cache, self.cell.clock.now());
        log_eviction(&self.name, &report);
        let hit = cache.get(key).cloned();
        trace!(cache = %self.name, key = %key, hit = hit.is_some(), "Cache lookup");
        hit
    }

    /// Write an entry, then enforce the policy.
    pub async fn put(&self, entry: CacheEntry) -> EvictionReport {
        let mut cache = self.cell.cache.lock().await;
        debug!(cache = %self.name, key = %entry.key, "Cache write");
        cache.insert(entry);
        let policy = cache.policy();
        let report = policy.evict(&mut cache, self.cell.clock.now());
        log_eviction(&self.name, &report);
        report
    }

    /// Store a network response under `key`, stamped with the current time.
    pub async fn store(
        &self,
        key: RequestKey,
        response: &Response,
        revision: Option<String>,
    ) -> EvictionReport {
        let entry = CacheEntry {
            key,
            response: CachedResponse::from_response(response),
            stored_at: self.now(),
            revision,
        };
        self.put(entry).await
    }

    /// Store several entries under one lock.
    pub async fn put_all(&self, entries: Vec<CacheEntry>) -> EvictionReport {
        let mut cache = self.cell.cache.lock().await;
        for entry in entries {
            cache.insert(entry);
        }
        let policy = cache.policy();
        let report = policy.evict(&mut cache, self.cell.clock.now());
        log_eviction(&self.name, &report);
        report
    }

    /// Whether an entry exists, without sweeping.
    pub async fn contains(&self, key: &RequestKey) -> bool {
        self.cell.cache.lock().await.get(key).is_some()
    }

    /// Delete one entry.
    pub async fn delete(&self, key: &RequestKey) -> bool {
        self.cell.cache.lock().await.remove(key).is_some()
    }

    /// Delete every entry whose key is not in `keep`.
    pub async fn retain_keys(&self, keep: &[RequestKey]) -> Vec<RequestKey> {
        let mut cache = self.cell.cache.lock().await;
        cache.remove_where(|entry| !keep.contains(&entry.key))
    }

    /// Run the policy without a read or write.
    pub async fn sweep(&self) -> EvictionReport {
        let mut cache = self.cell.cache.lock().await;
        let policy = cache.policy();
        let report = policy.evict(&mut cache, self.cell.clock.now());
        log_eviction(&self.name, &report);
        report
    }

    /// Replace the policy and enforce it immediately.
    pub async fn set_policy(&self, policy: ExpirationPolicy) -> EvictionReport {
        let mut cache = self.cell.cache.lock().await;
        cache.set_policy(policy);
        policy.evict(&mut cache, self.cell.clock.now())
    }

    pub async fn policy(&self) -> ExpirationPolicy {
        self.cell.cache.lock().await.policy()
    }

    pub async fn keys(&self) -> Vec<RequestKey> {
        self.cell.cache.lock().await.keys()
    }

    pub async fn len(&self) -> usize {
        self.cell.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cell.cache.lock().await.is_empty()
    }

    /// Copy of the cache contents.
    pub async fn snapshot(&self) -> NamedCache {
        self.cell.cache.lock().await.clone()
    }
}

fn log_eviction(cache: &str, report: &EvictionReport) {
    if !report.is_noop() {
        debug!(
            cache = %cache,
            expired = report.expired.len(),
            overflow = report.overflow.len(),
            "Evicted entries"
        );
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageSnapshot {
    caches: Vec<NamedCache>,
}

/// All named caches of the application.
pub struct CacheStorage {
    caches: RwLock<HashMap<String, CacheHandle>>,
    clock: SharedClock,
}

impl CacheStorage {
    /// Create empty storage.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// The clock used to stamp entries.
    pub fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }

    /// Open a cache, creating it if needed. An existing cache adopts `policy`.
    pub async fn open(&self, name: &str, policy: ExpirationPolicy) -> CacheHandle {
        let mut caches = self.caches.write().await;
        if let Some(handle) = caches.get(name) {
            let handle = handle.clone();
            drop(caches);
            if handle.policy().await != policy {
                handle.set_policy(policy).await;
            }
            return handle;
        }
        debug!(cache = %name, "Creating cache");
        let handle = CacheHandle::new(NamedCache::new(name, policy), Arc::clone(&self.clock));
        caches.insert(name.to_string(), handle.clone());
        handle
    }

    /// Get an existing cache.
    pub async fn get(&self, name: &str) -> Option<CacheHandle> {
        self.caches.read().await.get(name).cloned()
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        let removed = self.caches.write().await.remove(name).is_some();
        if removed {
            info!(cache = %name, "Deleted cache");
        }
        removed
    }

    /// All cache names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete every cache not named in `keep`.
    pub async fn retain(&self, keep: &[String]) -> Vec<String> {
        let mut caches = self.caches.write().await;
        let stale: Vec<String> = caches
            .keys()
            .filter(|name| !keep.contains(name))
            .cloned()
            .collect();
        for name in &stale {
            caches.remove(name);
            info!(cache = %name, "Deleted outdated cache");
        }
        stale
    }

    /// Periodic sweep over every cache. Returns the number of removed entries.
    pub async fn sweep_all(&self) -> usize {
        let handles: Vec<CacheHandle> = self.caches.read().await.values().cloned().collect();
        let mut removed = 0;
        for handle in handles {
            removed += handle.sweep().await.removed();
        }
        removed
    }

    /// Write every cache to `path` as JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let handles: Vec<CacheHandle> = self.caches.read().await.values().cloned().collect();
        let mut snapshot = StorageSnapshot::default();
        for handle in handles {
            snapshot.caches.push(handle.snapshot().await);
        }
        snapshot.caches.sort_by(|a, b| a.name().cmp(b.name()));

        let json = serde_json::to_vec(&snapshot)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), caches = snapshot.caches.len(), "Saved cache storage");
        Ok(())
    }

    /// Load storage from `path`. A missing file yields empty storage.
    pub async fn load(path: &Path, clock: SharedClock) -> Result<Self> {
        let storage = Self::new(clock);
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No saved cache storage");
                return Ok(storage);
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: StorageSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable cache storage");
                return Ok(storage);
            }
        };
        {
            let mut caches = storage.caches.write().await;
            for cache in snapshot.caches {
                let name = cache.name().to_string();
                caches.insert(name, CacheHandle::new(cache, Arc::clone(&storage.clock)));
            }
        }
        info!(path = %path.display(), "Loaded cache storage");
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_common::{ManualClock, SystemClock};
    use std::time::Duration;

    fn entry(url: &str) -> CacheEntry {
        CacheEntry {
            key: RequestKey::get(url),
            response: CachedResponse::synthetic(url, 200, "body"),
            stored_at: 0,
            revision: None,
        }
    }

    #[test]
    fn test_request_key_strips_fragment() {
        assert_eq!(
            RequestKey::get("https://a.test/page#section"),
            RequestKey::get("https://a.test/page")
        );
        assert_eq!(RequestKey::get("https://a.test/page").as_str(), "GET https://a.test/page");
    }

    #[test]
    fn test_replacement_moves_to_newest() {
        let mut cache = NamedCache::new("v1", ExpirationPolicy::default());
        cache.insert(entry("https://a.test/a"));
        cache.insert(entry("https://a.test/b"));
        cache.insert(entry("https://a.test/a"));

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.keys(),
            vec![RequestKey::get("https://a.test/b"), RequestKey::get("https://a.test/a")]
        );
    }

    #[test]
    fn test_cached_response_roundtrip_headers() {
        let cached = CachedResponse {
            url: "https://a.test/app.css".to_string(),
            status: 200,
            headers: vec![("content-type".to_string(), "text/css".to_string())],
            body: Bytes::from_static(b"body{}"),
        };
        let response = cached.to_response().unwrap();
        assert_eq!(response.content_type().unwrap().essence_str(), "text/css");
        assert_eq!(CachedResponse::from_response(&response), cached);
    }

    #[tokio::test]
    async fn test_put_enforces_max_entries() {
        let storage = CacheStorage::new(SystemClock::shared());
        let cache = storage
            .open("images", ExpirationPolicy::default().with_max_entries(3))
            .await;
        for i in 0..4 {
            cache.put(entry(&format!("https://a.test/{i}.png"))).await;
        }

        assert_eq!(cache.len().await, 3);
        assert!(!cache.contains(&RequestKey::get("https://a.test/0.png")).await);
        assert!(cache.contains(&RequestKey::get("https://a.test/3.png")).await);
    }

    #[tokio::test]
    async fn test_lookup_sweeps_expired() {
        let clock = ManualClock::new(0);
        let storage = CacheStorage::new(clock.clone());
        let cache = storage
            .open("api", ExpirationPolicy::default().with_max_age(Duration::from_secs(5)))
            .await;
        let key = RequestKey::get("https://a.test/api");
        cache.put(entry("https://a.test/api")).await;
        cache.put(entry("https://a.test/other")).await;

        clock.advance(Duration::from_secs(6));

        assert!(cache.lookup(&key).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_returns_same_cache() {
        let storage = CacheStorage::new(SystemClock::shared());
        let first = storage.open("v1", ExpirationPolicy::default()).await;
        first.put(entry("https://a.test/x")).await;

        let second = storage.open("v1", ExpirationPolicy::default()).await;
        assert_eq!(second.len().await, 1);
        assert_eq!(storage.keys().await, vec!["v1".to_string()]);
    }

    #[tokio::test]
    async fn test_reopen_with_tighter_policy_evicts() {
        let storage = CacheStorage::new(SystemClock::shared());
        let cache = storage.open("v1", ExpirationPolicy::default()).await;
        cache.put(entry("https://a.test/a")).await;
        cache.put(entry("https://a.test/b")).await;

        storage
            .open("v1", ExpirationPolicy::default().with_max_entries(1))
            .await;
        assert_eq!(cache.keys().await, vec![RequestKey::get("https://a.test/b")]);
    }

    #[tokio::test]
    async fn test_retain_deletes_outdated_caches() {
        let storage = CacheStorage::new(SystemClock::shared());
        storage.open("api-v1", ExpirationPolicy::default()).await;
        storage.open("api-v2", ExpirationPolicy::default()).await;

        let removed = storage.retain(&["api-v2".to_string()]).await;

        assert_eq!(removed, vec!["api-v1".to_string()]);
        assert!(!storage.has("api-v1").await);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");

        let storage = CacheStorage::new(SystemClock::shared());
        let cache = storage
            .open("static", ExpirationPolicy::default().with_max_entries(5))
            .await;
        cache.put(entry("https://a.test/app.js")).await;
        storage.save(&path).await.unwrap();

        let restored = CacheStorage::load(&path, SystemClock::shared()).await.unwrap();
        let cache = restored.get("static").await.unwrap();
        assert_eq!(cache.policy().await.max_entries, Some(5));
        assert!(cache.contains(&RequestKey::get("https://a.test/app.js")).await);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::load(&dir.path().join("none.json"), SystemClock::shared())
            .await
            .unwrap();
        assert!(storage.keys().await.is_empty());
    }
}
