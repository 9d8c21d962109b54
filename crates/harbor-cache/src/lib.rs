//! # Harbor Cache
//!
//! Policy-driven response caching for Harbor.
//!
//! ## Features
//!
//! - Named caches with insertion-ordered entries and per-cache expiration
//! - Cache-first, network-first, stale-while-revalidate, network-only and
//!   cache-only strategies
//! - Ordered first-match route rules, declarable as a JSON manifest
//! - Revision-keyed precache with all-or-nothing install
//! - JSON persistence of cache storage
//!
//! ## Example
//!
//! ```ignore
//! let storage = CacheStorage::new(SystemClock::shared());
//! let router = CacheRouter::from_manifest(&manifest, &storage, fetcher, origin).await?;
//! let outcome = router.handle(Request::parse("https://app.test/api/courses")?).await?;
//! ```

pub mod expiration;
pub mod manifest;
pub mod precache;
pub mod router;
pub mod storage;
pub mod strategy;

pub use expiration::{EvictionReport, ExpirationPolicy};
pub use manifest::{PredicateSpec, RouteManifest, RouteSpec};
pub use precache::{
    InstallReport, Precache, PrecacheEntry, PrecacheIndex, PrecacheManifest, PRECACHE_CACHE,
};
pub use router::{CacheRouter, Predicate, RouteDecision, RouteRule};
pub use storage::{CacheEntry, CacheHandle, CacheStorage, CachedResponse, NamedCache, RequestKey};
pub use strategy::{ResponseSource, Strategy, StrategyKind, StrategyName, StrategyOutcome};
