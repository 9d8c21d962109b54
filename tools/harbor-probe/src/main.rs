//! Probe a Harbor configuration against a live origin.
//!
//! ## Usage
//!
//! ```bash
//! # Validate a configuration and show what it resolves to
//! harbor-probe check harbor.json
//!
//! # Install the configured version, then fetch URLs through it
//! harbor-probe fetch harbor.json https://app.example/ https://app.example/api/me
//!
//! # Same, but cut the network after install to see what works offline
//! harbor-probe fetch harbor.json https://app.example/ --offline
//!
//! # List persisted caches
//! harbor-probe caches ~/.cache/harbor
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use harbor_common::logging::{init_logging, LogConfig, LogFormat};
use harbor_net::{HttpFetcher, LoaderConfig, Request};
use harbor_shell::{ChannelSink, Coordinator, HarborConfig, Platform};
use tracing::Level;

mod gate;
mod report;

use gate::GatedFetcher;
use report::{CacheListing, CheckReport, FetchRecord};

#[derive(Parser)]
#[command(name = "harbor-probe")]
#[command(about = "Probe Harbor offline configurations")]
struct Cli {
    /// Log level
    #[arg(long, default_value = "warn", global = true)]
    log_level: Level,

    /// Emit JSON instead of text (reports and logs)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration
    Check {
        /// Configuration file
        config: PathBuf,
    },

    /// Deploy the configured version and fetch URLs through it
    Fetch {
        /// Configuration file
        config: PathBuf,
        /// URLs to fetch, in order
        #[arg(required = true)]
        urls: Vec<String>,
        /// Treat the URLs as navigations
        #[arg(long)]
        navigate: bool,
        /// Disconnect the network after install
        #[arg(long)]
        offline: bool,
        /// Persist caches here (overrides the config)
        #[arg(long)]
        persist_dir: Option<PathBuf>,
    },

    /// List caches persisted in a directory
    Caches {
        /// Persist directory
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json { LogFormat::Json } else { LogFormat::Compact };
    init_logging(LogConfig::new(cli.log_level).with_format(format));

    match cli.command {
        Commands::Check { config } => {
            let report = check(&config)?;
            report.print(cli.json)?;
        }

        Commands::Fetch {
            config,
            urls,
            navigate,
            offline,
            persist_dir,
        } => {
            let records = fetch(&config, &urls, navigate, offline, persist_dir).await?;
            report::print_records(&records, cli.json)?;
            if records.iter().any(|r| r.error.is_some()) {
                std::process::exit(1);
            }
        }

        Commands::Caches { dir } => {
            let listing = CacheListing::load(&dir).await?;
            listing.print(cli.json)?;
        }
    }

    Ok(())
}

fn check(path: &Path) -> anyhow::Result<CheckReport> {
    let config = HarborConfig::load(path).with_context(|| format!("checking {}", path.display()))?;
    let precache = config
        .precache
        .resolve(config.origin.as_ref())
        .context("resolving precache")?;
    Ok(CheckReport::new(&config, &precache))
}

async fn fetch(
    path: &Path,
    urls: &[String],
    navigate: bool,
    offline: bool,
    persist_dir: Option<PathBuf>,
) -> anyhow::Result<Vec<FetchRecord>> {
    let mut config = HarborConfig::load(path)?;
    if persist_dir.is_some() {
        config.persist_dir = persist_dir;
    }
    if config.version.is_none() {
        bail!("{} has no version to deploy", path.display());
    }

    let http = HttpFetcher::new(LoaderConfig::default())?;
    let fetcher = Arc::new(GatedFetcher::new(Arc::new(http)));
    let (sink, _notifications) = ChannelSink::new();
    let platform = Platform::new(fetcher.clone(), Arc::new(sink));
    let (coordinator, _events) = Coordinator::start(config, platform).await?;

    let Some(outcome) = coordinator.deploy_configured().await else {
        bail!("deployment failed, see log output");
    };
    tracing::info!(?outcome, "Deployed");

    if offline {
        fetcher.disconnect();
        coordinator.set_online(false);
    }

    let mut records = Vec::with_capacity(urls.len());
    for url in urls {
        let request = if navigate {
            Request::parse(url).map(|r| Request::navigate(r.url))
        } else {
            Request::parse(url)
        }
        .with_context(|| format!("invalid url {url}"))?;

        let record = match coordinator.handle_fetch(request).await {
            Ok(outcome) => FetchRecord::from_outcome(url, &outcome),
            Err(e) => FetchRecord::failed(url, &e),
        };
        records.push(record);
    }

    coordinator.persist().await?;
    Ok(records)
}
