//! Declarative route manifest.
//!
//! ```json
//! [
//!   { "match": { "type": "path", "glob": "/api/**" },
//!     "cache": "api-v1", "strategy": "network-first", "timeout_seconds": 3,
//!     "max_entries": 50 },
//!   { "match": { "type": "destination", "destination": "image" },
//!     "cache": "images", "strategy": "cache-first", "max_age_seconds": 2592000 }
//! ]
//! ```

use std::time::Duration;

use harbor_common::{HarborError, Result};
use harbor_net::{RequestDestination, UrlPattern};
use hashbrown::HashMap;
use http::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::expiration::ExpirationPolicy;
use crate::precache::PRECACHE_CACHE;
use crate::strategy::{StrategyKind, StrategyName};

/// Request predicate as written in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PredicateSpec {
    /// Scheme, host and port equal `origin`.
    Origin { origin: String },
    /// Same origin as the application.
    SameOrigin,
    /// Glob over the path (`/…`) or the full URL.
    Path { glob: String },
    Prefix { prefix: String },
    Suffix { suffix: String },
    Contains { contains: String },
    Exact { url: String },
    Destination { destination: RequestDestination },
    /// Top-level navigations.
    Navigation,
    All { rules: Vec<PredicateSpec> },
    Any { rules: Vec<PredicateSpec> },
    Not { rule: Box<PredicateSpec> },
}

impl PredicateSpec {
    fn validate(&self) -> Result<()> {
        match self {
            PredicateSpec::Origin { origin } => {
                Url::parse(origin)
                    .map_err(|e| HarborError::config(format!("invalid origin {origin:?}: {e}")))?;
                Ok(())
            }
            PredicateSpec::Path { glob } => {
                if glob.is_empty() {
                    return Err(HarborError::config("empty url pattern in route predicate"));
                }
                UrlPattern::glob(glob).map_err(|e| {
                    HarborError::config_with_source(format!("invalid glob {glob:?}"), e)
                })?;
                Ok(())
            }
            PredicateSpec::Prefix { prefix: value }
            | PredicateSpec::Suffix { suffix: value }
            | PredicateSpec::Contains { contains: value }
            | PredicateSpec::Exact { url: value } => {
                if value.is_empty() {
                    return Err(HarborError::config("empty url pattern in route predicate"));
                }
                Ok(())
            }
            PredicateSpec::All { rules } | PredicateSpec::Any { rules } => {
                if rules.is_empty() {
                    return Err(HarborError::config("empty rule list in all/any predicate"));
                }
                rules.iter().try_for_each(PredicateSpec::validate)
            }
            PredicateSpec::Not { rule } => rule.validate(),
            PredicateSpec::SameOrigin
            | PredicateSpec::Destination { .. }
            | PredicateSpec::Navigation => Ok(()),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    #[serde(rename = "match")]
    pub predicate: PredicateSpec,
    /// Target cache name.
    pub cache: String,
    pub strategy: StrategyName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
    /// Network-first deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_method")]
    pub method: String,
}

impl RouteSpec {
    pub fn new(predicate: PredicateSpec, cache: &str, strategy: StrategyName) -> Self {
        Self {
            predicate,
            cache: cache.to_string(),
            strategy,
            max_entries: None,
            max_age_seconds: None,
            timeout_seconds: None,
            method: default_method(),
        }
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn max_age_seconds(mut self, seconds: u64) -> Self {
        self.max_age_seconds = Some(seconds);
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn policy(&self) -> ExpirationPolicy {
        ExpirationPolicy {
            max_entries: self.max_entries,
            max_age_seconds: self.max_age_seconds,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy
            .into_kind(self.timeout_seconds.map(Duration::from_secs))
    }

    pub fn http_method(&self) -> Result<Method> {
        Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| HarborError::config_with_source(format!("invalid method {:?}", self.method), e))
    }

    fn validate(&self, index: usize) -> Result<()> {
        let at = |msg: String| HarborError::config(format!("route {index}: {msg}"));
        if self.cache.is_empty() {
            return Err(at("cache name is empty".to_string()));
        }
        if self.cache == PRECACHE_CACHE {
            return Err(at(format!("cache name {PRECACHE_CACHE:?} is reserved")));
        }
        if self.max_entries == Some(0) {
            return Err(at("max_entries must be at least 1".to_string()));
        }
        if self.timeout_seconds.is_some() && self.strategy != StrategyName::NetworkFirst {
            return Err(at("timeout_seconds only applies to network-first".to_string()));
        }
        if self.timeout_seconds == Some(0) {
            return Err(at("timeout_seconds must be positive".to_string()));
        }
        self.http_method()?;
        self.predicate
            .validate()
            .map_err(|e| at(e.to_string()))
    }
}

/// Ordered route list. First match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteManifest {
    pub routes: Vec<RouteSpec>,
}

impl RouteManifest {
    pub fn new(routes: Vec<RouteSpec>) -> Self {
        Self { routes }
    }

    /// Parse and validate.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|e| HarborError::config_with_source("invalid route manifest", e))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check every route, and that routes sharing a cache agree on its policy.
    pub fn validate(&self) -> Result<()> {
        let mut policies: HashMap<&str, ExpirationPolicy> = HashMap::new();
        for (index, route) in self.routes.iter().enumerate() {
            route.validate(index)?;
            let policy = route.policy();
            if let Some(existing) = policies.insert(route.cache.as_str(), policy) {
                if existing != policy {
                    return Err(HarborError::config(format!(
                        "route {index}: cache {:?} declared with conflicting limits",
                        route.cache
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let manifest = RouteManifest::from_json_str(
            r#"[
                { "match": { "type": "path", "glob": "/api/**" },
                  "cache": "api-v1", "strategy": "network-first", "timeout_seconds": 3,
                  "max_entries": 50 },
                { "match": { "type": "any", "rules": [
                    { "type": "destination", "destination": "style" },
                    { "type": "destination", "destination": "script" } ] },
                  "cache": "static", "strategy": "stale-while-revalidate" },
                { "match": { "type": "not", "rule": { "type": "same-origin" } },
                  "cache": "cdn", "strategy": "cache-first", "max_age_seconds": 60 }
            ]"#,
        )
        .unwrap();

        assert_eq!(manifest.len(), 3);
        assert_eq!(
            manifest.routes[0].kind(),
            StrategyKind::NetworkFirst {
                timeout: Some(Duration::from_secs(3))
            }
        );
        assert_eq!(manifest.routes[0].policy().max_entries, Some(50));
        assert_eq!(manifest.routes[1].method, "GET");
        assert_eq!(manifest.routes[2].policy().max_age(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = RouteManifest::from_json_str(
            r#"[{ "match": { "type": "navigation" }, "cache": "pages", "strategy": "fastest" }]"#,
        )
        .unwrap_err();
        assert!(matches!(err, HarborError::Config { .. }));
    }

    #[test]
    fn test_timeout_requires_network_first() {
        let manifest = RouteManifest::new(vec![RouteSpec::new(
            PredicateSpec::Navigation,
            "pages",
            StrategyName::CacheFirst,
        )
        .timeout_seconds(3)]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_reserved_cache_name() {
        let manifest = RouteManifest::new(vec![RouteSpec::new(
            PredicateSpec::Navigation,
            PRECACHE_CACHE,
            StrategyName::CacheFirst,
        )]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_conflicting_limits_for_shared_cache() {
        let manifest = RouteManifest::new(vec![
            RouteSpec::new(PredicateSpec::Navigation, "shared", StrategyName::CacheFirst)
                .max_entries(5),
            RouteSpec::new(PredicateSpec::SameOrigin, "shared", StrategyName::CacheFirst)
                .max_entries(10),
        ]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_invalid_origin() {
        let manifest = RouteManifest::new(vec![RouteSpec::new(
            PredicateSpec::Origin {
                origin: "not a url".to_string(),
            },
            "cdn",
            StrategyName::CacheFirst,
        )]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_invalid_glob() {
        let err = RouteManifest::from_json_str(
            r#"[{ "match": { "type": "path", "glob": "/api/**x" },
                  "cache": "api", "strategy": "network-first" }]"#,
        )
        .unwrap_err();
        assert!(matches!(err, HarborError::Config { .. }));
    }
}
