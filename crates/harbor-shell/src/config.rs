//! Harbor configuration

use std::path::{Path, PathBuf};

use harbor_cache::{PrecacheManifest, RouteManifest};
use harbor_common::{HarborError, Result, ResultExt};
use harbor_sw::{LifecycleConfig, SyncConfig};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::notifications::NotificationConfig;

/// Everything the coordinator needs, loadable from one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarborConfig {
    /// Application origin. Relative precache URLs resolve against it and
    /// `same-origin` predicates compare with it.
    pub origin: Option<Url>,

    /// Version deployed at startup.
    pub version: Option<String>,

    /// Runtime route rules, first match wins.
    pub routes: RouteManifest,

    /// App shell assets installed with each version.
    pub precache: PrecacheManifest,

    pub lifecycle: LifecycleConfig,

    pub notifications: NotificationConfig,

    pub sync: SyncConfig,

    /// Where caches and the registration are saved. Nothing is persisted
    /// when unset.
    pub persist_dir: Option<PathBuf>,
}

impl HarborConfig {
    /// Parse and validate.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).config_context("invalid harbor config")?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .config_context(format!("cannot read {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.routes.validate()?;
        let resolved = self.precache.resolve(self.origin.as_ref())?;

        if let Some(fallback) = &self.lifecycle.navigation_fallback {
            let url = match &self.origin {
                Some(origin) => origin.join(fallback),
                None => Url::parse(fallback),
            }
            .config_context(format!("invalid navigation fallback {fallback:?}"))?;
            if !resolved.iter().any(|entry| entry.url == url) {
                return Err(HarborError::config(format!(
                    "navigation fallback {url} is not precached"
                )));
            }
        }
        if self.lifecycle.event_capacity == 0 {
            return Err(HarborError::config("lifecycle.event_capacity must be positive"));
        }
        Ok(())
    }

    /// Default location for persisted state.
    pub fn default_persist_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("harbor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_cache::StrategyName;

    const SAMPLE: &str = r#"{
        "origin": "https://app.test/",
        "version": "1.0.0",
        "routes": [
            { "match": { "type": "path", "glob": "/api/**" },
              "cache": "api-v1", "strategy": "network-first", "timeout_seconds": 3 },
            { "match": { "type": "destination", "destination": "image" },
              "cache": "images", "strategy": "cache-first", "max_entries": 60 }
        ],
        "precache": [
            { "url": "/", "revision": "1.0.0" },
            { "url": "/offline.html", "revision": "1" }
        ],
        "lifecycle": { "navigation_fallback": "/offline.html" },
        "sync": { "max_attempts": 5 }
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = HarborConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.version.as_deref(), Some("1.0.0"));
        assert_eq!(config.routes.routes[0].strategy, StrategyName::NetworkFirst);
        assert_eq!(config.precache.entries.len(), 2);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.initial_delay_secs, 30);
        assert!(!config.lifecycle.skip_waiting);
        assert_eq!(config.notifications.default_url, "/");
        assert!(config.persist_dir.is_none());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = HarborConfig::from_json_str("{}").unwrap();
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_fallback_must_be_precached() {
        let err = HarborConfig::from_json_str(
            r#"{ "origin": "https://app.test/",
                 "lifecycle": { "navigation_fallback": "/offline.html" } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, HarborError::Config { .. }));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = HarborConfig::from_json_str("{ routes: ").unwrap_err();
        assert!(matches!(err, HarborError::Config { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbor.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = HarborConfig::load(&path).unwrap();
        assert_eq!(config.routes.len(), 2);

        assert!(HarborConfig::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_default_persist_dir_is_named() {
        let dir = HarborConfig::default_persist_dir();
        assert!(dir.ends_with("harbor"));
        if let Some(cache) = dirs::cache_dir() {
            assert_eq!(dir, cache.join("harbor"));
        }
    }
}
