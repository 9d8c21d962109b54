//! Size and age limits for a named cache.
//!
//! Eviction is deterministic: entries older than `max_age` go first, then the
//! oldest insertions are dropped until the cache fits `max_entries`. An empty
//! report is the "nothing to do" outcome, not an error.

use std::time::Duration;

use harbor_common::Timestamp;
use serde::{Deserialize, Serialize};

use crate::storage::{CacheEntry, NamedCache, RequestKey};

/// Limits applied to a [`NamedCache`]. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
}

/// What an eviction pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries removed because they outlived `max_age`.
    pub expired: Vec<RequestKey>,
    /// Entries removed to get back under `max_entries`.
    pub overflow: Vec<RequestKey>,
}

impl EvictionReport {
    /// No entry was removed.
    pub fn is_noop(&self) -> bool {
        self.expired.is_empty() && self.overflow.is_empty()
    }

    /// Total number of removed entries.
    pub fn removed(&self) -> usize {
        self.expired.len() + self.overflow.len()
    }
}

impl ExpirationPolicy {
    /// No limits.
    pub const fn unbounded() -> Self {
        Self {
            max_entries: None,
            max_age_seconds: None,
        }
    }

    /// Limit the number of entries.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Limit the age of entries.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_seconds = Some(max_age.as_secs());
        self
    }

    /// Age limit as a duration.
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_seconds.map(Duration::from_secs)
    }

    /// Whether `entry` has outlived `max_age` at `now`.
    pub fn is_expired(&self, entry: &CacheEntry, now: Timestamp) -> bool {
        match self.max_age_seconds {
            Some(secs) => now.saturating_sub(entry.stored_at) > secs.saturating_mul(1000),
            None => false,
        }
    }

    /// Remove every entry of `cache` that violates this policy.
    pub fn evict(&self, cache: &mut NamedCache, now: Timestamp) -> EvictionReport {
        let mut report = EvictionReport::default();
        if cache.is_empty() {
            return report;
        }

        if self.max_age_seconds.is_some() {
            report.expired = cache.remove_where(|entry| self.is_expired(entry, now));
        }

        if let Some(max) = self.max_entries {
            let excess = cache.len().saturating_sub(max);
            if excess > 0 {
                report.overflow = cache.remove_oldest(excess);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CachedResponse;

    fn entry(url: &str, stored_at: Timestamp) -> CacheEntry {
        CacheEntry {
            key: RequestKey::get(url),
            response: CachedResponse::synthetic(url, 200, url.as_bytes().to_vec()),
            stored_at,
            revision: None,
        }
    }

    #[test]
    fn test_empty_cache_is_noop() {
        let policy = ExpirationPolicy::default().with_max_entries(1);
        let mut cache = NamedCache::new("empty", policy);
        assert!(policy.evict(&mut cache, 0).is_noop());
    }

    #[test]
    fn test_overflow_removes_oldest_insertion() {
        let policy = ExpirationPolicy::default().with_max_entries(2);
        let mut cache = NamedCache::new("images", policy);
        cache.insert(entry("https://a.test/1.png", 10));
        cache.insert(entry("https://a.test/2.png", 10));
        cache.insert(entry("https://a.test/3.png", 10));

        let report = policy.evict(&mut cache, 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(report.overflow, vec![RequestKey::get("https://a.test/1.png")]);
        assert!(cache.get(&RequestKey::get("https://a.test/1.png")).is_none());
    }

    #[test]
    fn test_expired_removed_even_under_count() {
        let policy = ExpirationPolicy::default()
            .with_max_entries(10)
            .with_max_age(Duration::from_secs(60));
        let mut cache = NamedCache::new("api", policy);
        cache.insert(entry("https://a.test/old", 0));
        cache.insert(entry("https://a.test/new", 50_000));

        let report = policy.evict(&mut cache, 61_000);

        assert_eq!(report.expired, vec![RequestKey::get("https://a.test/old")]);
        assert!(report.overflow.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_age_boundary_is_inclusive() {
        let policy = ExpirationPolicy::default().with_max_age(Duration::from_secs(1));
        let e = entry("https://a.test/x", 1_000);
        assert!(!policy.is_expired(&e, 2_000));
        assert!(policy.is_expired(&e, 2_001));
    }

    #[test]
    fn test_expiry_runs_before_overflow() {
        let policy = ExpirationPolicy::default()
            .with_max_entries(2)
            .with_max_age(Duration::from_secs(10));
        let mut cache = NamedCache::new("mixed", policy);
        cache.insert(entry("https://a.test/a", 100_000));
        cache.insert(entry("https://a.test/stale", 0));
        cache.insert(entry("https://a.test/b", 100_000));

        let report = policy.evict(&mut cache, 100_000);

        assert_eq!(report.expired.len(), 1);
        assert!(report.overflow.is_empty());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_unbounded_never_evicts() {
        let policy = ExpirationPolicy::unbounded();
        let mut cache = NamedCache::new("precache", policy);
        for i in 0..100 {
            cache.insert(entry(&format!("https://a.test/{i}"), 0));
        }
        assert!(policy.evict(&mut cache, u64::MAX).is_noop());
        assert_eq!(cache.len(), 100);
    }
}
