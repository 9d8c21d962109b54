//! Versioned precache.
//!
//! Precache entries bypass routing and live in one reserved cache. The stored
//! key carries the revision as a query parameter, so a new revision of the same
//! URL is a different key and forces a fetch while unchanged pairs are reused.

use std::sync::Arc;

use futures::future::try_join_all;
use harbor_common::{retry_with_backoff, HarborError, Result, RetryConfig};
use harbor_net::{Fetcher, Request, Response};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::expiration::ExpirationPolicy;
use crate::storage::{CacheEntry, CacheHandle, CacheStorage, CachedResponse, RequestKey};

/// Name of the reserved precache.
pub const PRECACHE_CACHE: &str = "harbor-precache";

const REVISION_PARAM: &str = "__harbor_revision";

/// One `{url, revision}` pair. URLs may be relative to the application origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecacheEntry {
    pub url: String,
    /// `None` for URLs that already carry a content hash.
    #[serde(default)]
    pub revision: Option<String>,
}

impl PrecacheEntry {
    pub fn new(url: &str, revision: &str) -> Self {
        Self {
            url: url.to_string(),
            revision: Some(revision.to_string()),
        }
    }

    pub fn hashed(url: &str) -> Self {
        Self {
            url: url.to_string(),
            revision: None,
        }
    }
}

/// The assets a worker version installs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrecacheManifest {
    pub entries: Vec<PrecacheEntry>,
}

impl PrecacheManifest {
    pub fn new(entries: Vec<PrecacheEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| HarborError::config_with_source("invalid precache manifest", e))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every URL and compute its cache key.
    pub fn resolve(&self, origin: Option<&Url>) -> Result<Vec<ResolvedEntry>> {
        let mut resolved: Vec<ResolvedEntry> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let url = resolve_url(&entry.url, origin)?;
            if let Some(dup) = resolved.iter().find(|r| r.url == url) {
                if dup.revision != entry.revision {
                    return Err(HarborError::config(format!(
                        "precache lists {url} with two revisions"
                    )));
                }
                continue;
            }
            let key = RequestKey::get(revisioned(&url, entry.revision.as_deref()).as_str());
            resolved.push(ResolvedEntry {
                url,
                revision: entry.revision.clone(),
                key,
            });
        }
        Ok(resolved)
    }
}

fn resolve_url(raw: &str, origin: Option<&Url>) -> Result<Url> {
    let parsed = match origin {
        Some(base) => base.join(raw),
        None => Url::parse(raw),
    };
    let mut url = parsed
        .map_err(|e| HarborError::config_with_source(format!("invalid precache url {raw:?}"), e))?;
    url.set_fragment(None);
    Ok(url)
}

fn revisioned(url: &Url, revision: Option<&str>) -> Url {
    let mut keyed = url.clone();
    if let Some(revision) = revision {
        keyed.query_pairs_mut().append_pair(REVISION_PARAM, revision);
    }
    keyed
}

/// A manifest entry with its absolute URL and cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    pub url: Url,
    pub revision: Option<String>,
    pub key: RequestKey,
}

/// URL to cache key lookup for one manifest.
#[derive(Debug, Clone, Default)]
pub struct PrecacheIndex {
    keys: HashMap<String, RequestKey>,
}

impl PrecacheIndex {
    pub fn new(manifest: &PrecacheManifest, origin: Option<&Url>) -> Result<Self> {
        let keys = manifest
            .resolve(origin)?
            .into_iter()
            .map(|entry| (entry.url.to_string(), entry.key))
            .collect();
        Ok(Self { keys })
    }

    /// Cache key for `url`, trying the normalised spellings in order.
    pub fn key_for(&self, url: &Url) -> Option<&RequestKey> {
        candidates(url)
            .iter()
            .find_map(|candidate| self.keys.get(candidate.as_str()))
    }

    /// Every key the manifest owns.
    pub fn keys(&self) -> Vec<RequestKey> {
        self.keys.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || name == "fbclid"
}

/// Spellings of `url` a precached asset may be stored under.
fn candidates(url: &Url) -> Vec<String> {
    let mut base = url.clone();
    base.set_fragment(None);
    let mut out = vec![base.to_string()];

    let mut cleaned = base.clone();
    if base.query_pairs().any(|(name, _)| is_tracking_param(&name)) {
        let kept: Vec<(String, String)> = base
            .query_pairs()
            .filter(|(name, _)| !is_tracking_param(name))
            .map(|(n, v)| (n.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            cleaned.set_query(None);
        } else {
            cleaned.query_pairs_mut().clear().extend_pairs(kept);
        }
        out.push(cleaned.to_string());
    }

    let path = cleaned.path().to_string();
    if path.ends_with('/') {
        let mut index = cleaned.clone();
        index.set_path(&format!("{path}index.html"));
        out.push(index.to_string());
    } else if !path.rsplit('/').next().unwrap_or_default().contains('.') {
        let mut html = cleaned.clone();
        html.set_path(&format!("{path}.html"));
        out.push(html.to_string());
    }
    out
}

/// What an install did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// URLs fetched from the network.
    pub fetched: Vec<Url>,
    /// URLs whose `(url, revision)` pair was already cached.
    pub reused: Vec<Url>,
}

/// The reserved precache bound to a network.
#[derive(Clone)]
pub struct Precache {
    cache: CacheHandle,
    fetcher: Arc<dyn Fetcher>,
    origin: Option<Url>,
    retry: RetryConfig,
}

impl std::fmt::Debug for Precache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Precache")
            .field("origin", &self.origin)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Precache {
    /// Open the reserved cache in `storage`. Precache entries never expire.
    pub async fn open(storage: &CacheStorage, fetcher: Arc<dyn Fetcher>, origin: Option<Url>) -> Self {
        let cache = storage
            .open(PRECACHE_CACHE, ExpirationPolicy::unbounded())
            .await;
        Self {
            cache,
            fetcher,
            origin,
            retry: RetryConfig::none(),
        }
    }

    /// Retry each asset fetch with this policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }

    pub fn index(&self, manifest: &PrecacheManifest) -> Result<PrecacheIndex> {
        PrecacheIndex::new(manifest, self.origin.as_ref())
    }

    /// Fetch every asset of `manifest` that is not cached yet.
    ///
    /// All or nothing: entries are committed only once every fetch returned a
    /// 2xx response. Any failure yields [`HarborError::PrecacheFailure`].
    pub async fn install(&self, manifest: &PrecacheManifest) -> Result<InstallReport> {
        let resolved = manifest.resolve(self.origin.as_ref())?;
        let mut report = InstallReport::default();
        let mut missing = Vec::new();
        for entry in resolved {
            if self.cache.contains(&entry.key).await {
                report.reused.push(entry.url);
            } else {
                missing.push(entry);
            }
        }

        debug!(
            fetch = missing.len(),
            reuse = report.reused.len(),
            "Installing precache"
        );

        let fetched = try_join_all(missing.into_iter().map(|entry| self.fetch_entry(entry))).await?;

        let now = self.cache.now();
        let entries = fetched
            .iter()
            .map(|(entry, response)| CacheEntry {
                key: entry.key.clone(),
                response: CachedResponse::from_response(response),
                stored_at: now,
                revision: entry.revision.clone(),
            })
            .collect();
        self.cache.put_all(entries).await;

        report.fetched = fetched.into_iter().map(|(entry, _)| entry.url).collect();
        info!(
            fetched = report.fetched.len(),
            reused = report.reused.len(),
            "Precache installed"
        );
        Ok(report)
    }

    async fn fetch_entry(&self, entry: ResolvedEntry) -> Result<(ResolvedEntry, Response)> {
        let fetcher = Arc::clone(&self.fetcher);
        let url = entry.url.clone();
        let response = retry_with_backoff(&self.retry, |_attempt| {
            let fetcher = Arc::clone(&fetcher);
            let request = Request::get(url.clone());
            async move {
                let response = fetcher.fetch(request).await.map_err(|e| e.to_string())?;
                if response.ok() {
                    Ok(response)
                } else {
                    Err(format!("status {}", response.status))
                }
            }
        })
        .await
        .map_err(|reason| {
            warn!(url = %entry.url, reason = %reason, "Precache fetch failed");
            HarborError::precache(entry.url.as_str(), reason)
        })?;
        Ok((entry, response))
    }

    /// Delete every precached entry none of `manifests` owns.
    pub async fn cleanup(&self, manifests: &[&PrecacheManifest]) -> Result<Vec<RequestKey>> {
        let mut keep = Vec::new();
        for manifest in manifests {
            keep.extend(self.index(manifest)?.keys());
        }
        let removed = self.cache.retain_keys(&keep).await;
        if !removed.is_empty() {
            info!(removed = removed.len(), "Removed stale precache entries");
        }
        Ok(removed)
    }

    /// Serve `request` from the precache, if `index` owns its URL.
    pub async fn lookup(&self, index: &PrecacheIndex, request: &Request) -> Result<Option<Response>> {
        if request.method != http::Method::GET {
            return Ok(None);
        }
        let Some(key) = index.key_for(&request.url) else {
            return Ok(None);
        };
        match self.cache.lookup(key).await {
            Some(entry) => Ok(Some(entry.response.to_response()?)),
            None => Ok(None),
        }
    }

    /// Serve an absolute or origin-relative `url` from the precache.
    pub async fn lookup_url(&self, index: &PrecacheIndex, url: &str) -> Result<Option<Response>> {
        let url = resolve_url(url, self.origin.as_ref())?;
        self.lookup(index, &Request::get(url)).await
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }
}
