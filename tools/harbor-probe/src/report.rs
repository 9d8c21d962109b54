//! Probe reports, printed as text or JSON.

use std::path::Path;

use harbor_cache::precache::ResolvedEntry;
use harbor_cache::{CacheStorage, ResponseSource, StrategyOutcome};
use harbor_common::{HarborError, SystemClock};
use harbor_shell::HarborConfig;
use serde::Serialize;

const CACHES_FILE: &str = "caches.json";

/// Summary of a validated configuration.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub origin: Option<String>,
    pub version: Option<String>,
    pub routes: Vec<RouteLine>,
    pub precache: Vec<PrecacheLine>,
    pub navigation_fallback: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RouteLine {
    pub cache: String,
    pub strategy: &'static str,
    pub max_entries: Option<usize>,
    pub max_age_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PrecacheLine {
    pub url: String,
    pub key: String,
}

impl CheckReport {
    pub fn new(config: &HarborConfig, precache: &[ResolvedEntry]) -> Self {
        Self {
            origin: config.origin.as_ref().map(|u| u.to_string()),
            version: config.version.clone(),
            routes: config
                .routes
                .routes
                .iter()
                .map(|route| RouteLine {
                    cache: route.cache.clone(),
                    strategy: route.strategy.as_str(),
                    max_entries: route.max_entries,
                    max_age_seconds: route.max_age_seconds,
                })
                .collect(),
            precache: precache
                .iter()
                .map(|entry| PrecacheLine {
                    url: entry.url.to_string(),
                    key: entry.key.to_string(),
                })
                .collect(),
            navigation_fallback: config.lifecycle.navigation_fallback.clone(),
        }
    }

    pub fn print(&self, json: bool) -> anyhow::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }
        println!("Configuration OK");
        println!("  Origin:   {}", self.origin.as_deref().unwrap_or("(none)"));
        println!("  Version:  {}", self.version.as_deref().unwrap_or("(none)"));
        println!("  Routes:   {}", self.routes.len());
        for (i, route) in self.routes.iter().enumerate() {
            println!("    {i}. {} -> {}", route.strategy, route.cache);
        }
        println!("  Precache: {}", self.precache.len());
        for entry in &self.precache {
            println!("    {}", entry.key);
        }
        if let Some(fallback) = &self.navigation_fallback {
            println!("  Fallback: {fallback}");
        }
        Ok(())
    }
}

/// What one fetch produced.
#[derive(Debug, Serialize)]
pub struct FetchRecord {
    pub url: String,
    pub status: Option<u16>,
    pub source: Option<&'static str>,
    pub bytes: usize,
    pub error: Option<String>,
}

impl FetchRecord {
    pub fn from_outcome(url: &str, outcome: &StrategyOutcome) -> Self {
        Self {
            url: url.to_string(),
            status: Some(outcome.response.status.as_u16()),
            source: Some(match outcome.source {
                ResponseSource::Cache => "cache",
                ResponseSource::Network => "network",
            }),
            bytes: outcome.response.body().len(),
            error: None,
        }
    }

    pub fn failed(url: &str, error: &HarborError) -> Self {
        Self {
            url: url.to_string(),
            status: None,
            source: None,
            bytes: 0,
            error: Some(error.to_string()),
        }
    }
}

pub fn print_records(records: &[FetchRecord], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    for record in records {
        match (&record.error, record.status) {
            (Some(error), _) => println!("FAIL {}  {error}", record.url),
            (None, Some(status)) => println!(
                "{status}  {:<7}  {:>8} B  {}",
                record.source.unwrap_or("-"),
                record.bytes,
                record.url
            ),
            (None, None) => println!("???  {}", record.url),
        }
    }
    Ok(())
}

/// Persisted caches and their keys.
#[derive(Debug, Serialize)]
pub struct CacheListing {
    pub caches: Vec<CacheLine>,
}

#[derive(Debug, Serialize)]
pub struct CacheLine {
    pub name: String,
    pub keys: Vec<String>,
}

impl CacheListing {
    pub async fn load(dir: &Path) -> anyhow::Result<Self> {
        let storage = CacheStorage::load(&dir.join(CACHES_FILE), SystemClock::shared()).await?;
        let mut caches = Vec::new();
        for name in storage.keys().await {
            let Some(handle) = storage.get(&name).await else {
                continue;
            };
            let keys = handle.keys().await.iter().map(|k| k.to_string()).collect();
            caches.push(CacheLine { name, keys });
        }
        Ok(Self { caches })
    }

    pub fn print(&self, json: bool) -> anyhow::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }
        if self.caches.is_empty() {
            println!("No caches");
        }
        for cache in &self.caches {
            println!("{} ({} entries)", cache.name, cache.keys.len());
            for key in &cache.keys {
                println!("  {key}");
            }
        }
        Ok(())
    }
}
