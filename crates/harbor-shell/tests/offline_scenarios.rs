//! End-to-end scenarios through the coordinator.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use harbor_cache::{
    PrecacheEntry, PrecacheManifest, PredicateSpec, RequestKey, RouteManifest, RouteSpec,
    StrategyName, PRECACHE_CACHE,
};
use harbor_common::{HarborError, ManualClock};
use harbor_net::testing::ScriptedFetcher;
use harbor_net::{Request, RequestDestination};
use harbor_shell::{
    ChannelSink, ConnectivityState, Coordinator, DeferredPrompt, HarborConfig, InstallOutcome,
    Platform, ShellEvent,
};
use harbor_sw::{SyncEvent, VersionState};
use tokio::sync::mpsc;
use url::Url;

const ORIGIN: &str = "https://app.test/";

struct Harness {
    coordinator: Coordinator,
    events: mpsc::UnboundedReceiver<ShellEvent>,
    fetcher: Arc<ScriptedFetcher>,
    clock: Arc<ManualClock>,
}

fn routes() -> RouteManifest {
    RouteManifest::new(vec![
        RouteSpec::new(
            PredicateSpec::Path {
                glob: "/api/**".to_string(),
            },
            "api",
            StrategyName::NetworkFirst,
        )
        .timeout_seconds(3),
        RouteSpec::new(
            PredicateSpec::Destination {
                destination: RequestDestination::Image,
            },
            "images",
            StrategyName::CacheFirst,
        )
        .max_entries(2),
        RouteSpec::new(
            PredicateSpec::Destination {
                destination: RequestDestination::Style,
            },
            "static",
            StrategyName::StaleWhileRevalidate,
        ),
        RouteSpec::new(
            PredicateSpec::Prefix {
                prefix: "/feed/".to_string(),
            },
            "feed",
            StrategyName::CacheFirst,
        )
        .max_age_seconds(60),
        // Broader than the image rule; never reached for images.
        RouteSpec::new(PredicateSpec::SameOrigin, "pages", StrategyName::NetworkFirst),
    ])
}

fn shell_manifest(rev: &str) -> PrecacheManifest {
    PrecacheManifest::new(vec![PrecacheEntry::new("/", rev)])
}

async fn harness_with(config: HarborConfig) -> Harness {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond(ORIGIN, 200, "<html>shell</html>");
    let clock = ManualClock::new(1_000_000);
    let (sink, _sink_rx) = ChannelSink::new();
    let platform = Platform::new(fetcher.clone(), Arc::new(sink)).with_clock(clock.clone());
    let (coordinator, events) = Coordinator::start(config, platform).await.unwrap();
    Harness {
        coordinator,
        events,
        fetcher,
        clock,
    }
}

async fn harness() -> Harness {
    let config = HarborConfig {
        origin: Url::parse(ORIGIN).ok(),
        routes: routes(),
        ..HarborConfig::default()
    };
    let h = harness_with(config).await;
    h.coordinator
        .deploy("1.0.0", shell_manifest("1.0.0"))
        .await
        .unwrap();
    h
}

fn get(url: &str) -> Request {
    Request::parse(url).unwrap()
}

#[tokio::test]
async fn first_matching_rule_is_applied() {
    let h = harness().await;
    h.fetcher.respond("https://app.test/img/a.png", 200, "png");

    h.coordinator.handle_fetch(get("https://app.test/img/a.png")).await.unwrap();

    let images = h.coordinator.storage().get("images").await.unwrap();
    let pages = h.coordinator.storage().get("pages").await.unwrap();
    assert!(images.contains(&RequestKey::get("https://app.test/img/a.png")).await);
    assert!(pages.is_empty().await);
}

#[tokio::test]
async fn cache_first_hit_makes_no_network_call() {
    let h = harness().await;
    h.fetcher.respond("https://app.test/img/a.png", 200, "png");
    h.coordinator.handle_fetch(get("https://app.test/img/a.png")).await.unwrap();
    let before = h.fetcher.total_calls();

    let outcome = h.coordinator.handle_fetch(get("https://app.test/img/a.png")).await.unwrap();

    assert!(outcome.is_from_cache());
    assert_eq!(h.fetcher.total_calls(), before);
}

#[tokio::test(start_paused = true)]
async fn network_first_timeout_serves_cached_copy() {
    let h = harness().await;
    let url = "https://app.test/api/courses";
    h.fetcher.respond(url, 200, "v1");
    h.coordinator.handle_fetch(get(url)).await.unwrap();

    h.fetcher.respond_after(url, Duration::from_secs(10), 200, "v2");
    let outcome = h.coordinator.handle_fetch(get(url)).await.unwrap();

    assert!(outcome.is_from_cache());
    assert_eq!(outcome.response.text().unwrap(), "v1");
}

#[tokio::test]
async fn network_first_without_fallback_fails() {
    let h = harness().await;
    h.fetcher.set_offline(true);

    let err = h
        .coordinator
        .handle_fetch(get("https://app.test/api/progress"))
        .await
        .unwrap_err();

    assert!(matches!(err, HarborError::NetworkUnavailable { .. }));
}

#[tokio::test(start_paused = true)]
async fn stale_while_revalidate_returns_before_refresh() {
    let h = harness().await;
    let url = "https://app.test/site.css";
    h.fetcher.respond(url, 200, "old");
    h.coordinator.handle_fetch(get(url)).await.unwrap();

    h.fetcher.respond_after(url, Duration::from_secs(5), 200, "new");
    let outcome = h.coordinator.handle_fetch(get(url)).await.unwrap();
    assert_eq!(outcome.response.text().unwrap(), "old");

    outcome.revalidation.unwrap().await.unwrap();
    let refreshed = h.coordinator.handle_fetch(get(url)).await.unwrap();
    assert_eq!(refreshed.response.text().unwrap(), "new");
}

#[tokio::test]
async fn overflow_evicts_oldest_insertion() {
    let h = harness().await;
    for name in ["a", "b", "c"] {
        let url = format!("https://app.test/img/{name}.png");
        h.fetcher.respond(&url, 200, name.to_string());
        h.coordinator.handle_fetch(get(&url)).await.unwrap();
    }

    let images = h.coordinator.storage().get("images").await.unwrap();
    assert_eq!(
        images.keys().await,
        vec![
            RequestKey::get("https://app.test/img/b.png"),
            RequestKey::get("https://app.test/img/c.png"),
        ]
    );
}

#[tokio::test]
async fn expired_entries_absent_after_sweep() {
    let h = harness().await;
    let url = "https://app.test/feed/today";
    h.fetcher.respond(url, 200, "today");
    h.coordinator.handle_fetch(get(url)).await.unwrap();

    h.clock.advance(Duration::from_secs(61));
    let removed = h.coordinator.storage().sweep_all().await;

    assert_eq!(removed, 1);
    let feed = h.coordinator.storage().get("feed").await.unwrap();
    assert!(feed.is_empty().await);
}

#[tokio::test]
async fn single_active_and_update_flag() {
    let mut h = harness().await;
    h.coordinator.client_opened().await;
    assert!(!h.coordinator.state().update_available);

    h.coordinator
        .deploy("1.0.1", shell_manifest("1.0.1"))
        .await
        .unwrap();

    let lifecycle = h.coordinator.lifecycle();
    assert_eq!(lifecycle.active_version().await.unwrap().id.as_str(), "1.0.0");
    assert_eq!(
        lifecycle.waiting_version().await.unwrap().state,
        VersionState::Waiting
    );
    assert!(h.coordinator.state().update_available);

    assert!(h.coordinator.update_app().await);
    assert_eq!(lifecycle.active_version().await.unwrap().id.as_str(), "1.0.1");
    assert!(lifecycle.waiting_version().await.is_none());
    assert!(!h.coordinator.state().update_available);
    assert_eq!(h.events.recv().await, Some(ShellEvent::Reload));
}

struct Accepting;

impl DeferredPrompt for Accepting {
    fn prompt(self: Box<Self>) -> BoxFuture<'static, InstallOutcome> {
        Box::pin(async { InstallOutcome::Accepted })
    }
}

#[tokio::test]
async fn install_prompt_resolves_once() {
    let h = harness().await;
    h.coordinator.capture_install_prompt(Box::new(Accepting));
    assert!(h.coordinator.state().can_install);

    assert_eq!(h.coordinator.install_app().await.unwrap(), InstallOutcome::Accepted);
    assert!(matches!(
        h.coordinator.install_app().await,
        Err(HarborError::PromptUnavailable)
    ));

    let state = h.coordinator.state();
    assert!(state.installed);
    assert!(!state.can_install);
}

#[tokio::test]
async fn connectivity_round_trip_emits_two_events() {
    let h = harness().await;
    let mut rx = h.coordinator.subscribe_connectivity();

    h.coordinator.set_online(false);
    h.coordinator.set_online(false);
    h.coordinator.set_online(true);
    h.coordinator.set_online(true);

    assert_eq!(rx.try_recv().unwrap(), ConnectivityState::Offline);
    assert_eq!(rx.try_recv().unwrap(), ConnectivityState::Online);
    assert!(rx.try_recv().is_err());
    assert!(h.coordinator.state().online);
}

#[tokio::test]
async fn precache_revision_bump_refetches_root() {
    let config = HarborConfig {
        origin: Url::parse(ORIGIN).ok(),
        ..HarborConfig::default()
    };
    let h = harness_with(config).await;

    h.coordinator
        .deploy("1.0.0", shell_manifest("1.0.0"))
        .await
        .unwrap();
    let precache = h.coordinator.storage().get(PRECACHE_CACHE).await.unwrap();
    assert_eq!(precache.len().await, 1);
    assert_eq!(h.fetcher.calls(ORIGIN), 1);

    h.coordinator
        .deploy("1.0.1", shell_manifest("1.0.1"))
        .await
        .unwrap();

    assert_eq!(h.fetcher.calls(ORIGIN), 2);
    // Activation dropped the 1.0.0 copy.
    assert_eq!(
        precache.keys().await,
        vec![RequestKey::get("https://app.test/?__harbor_revision=1.0.1")]
    );
}

#[tokio::test]
async fn app_shell_served_offline() {
    let h = harness().await;
    h.fetcher.set_offline(true);

    let outcome = h
        .coordinator
        .handle_fetch(Request::navigate(Url::parse(ORIGIN).unwrap()))
        .await
        .unwrap();

    assert!(outcome.is_from_cache());
    assert_eq!(outcome.response.text().unwrap(), "<html>shell</html>");
}

#[tokio::test]
async fn sync_delivered_when_back_online() {
    let mut h = harness().await;
    h.coordinator.set_online(false);

    assert!(h.coordinator.register_sync("outbox"));
    assert!(!h.coordinator.register_sync("outbox"));
    h.coordinator.set_online(true);

    assert_eq!(
        h.events.recv().await,
        Some(ShellEvent::Sync(SyncEvent {
            tag: "outbox".to_string(),
            attempt: 1
        }))
    );
    assert!(h.coordinator.complete_sync("outbox"));
    assert!(h.coordinator.pending_syncs().is_empty());
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = HarborConfig {
        origin: Url::parse(ORIGIN).ok(),
        routes: routes(),
        persist_dir: Some(dir.path().to_path_buf()),
        ..HarborConfig::default()
    };

    let h = harness_with(config.clone()).await;
    h.coordinator
        .deploy("1.0.0", shell_manifest("1.0.0"))
        .await
        .unwrap();
    h.fetcher.respond("https://app.test/img/a.png", 200, "png");
    h.coordinator.handle_fetch(get("https://app.test/img/a.png")).await.unwrap();
    h.coordinator.persist().await.unwrap();
    drop(h);

    let restarted = harness_with(config).await;
    restarted.fetcher.set_offline(true);

    let active = restarted.coordinator.lifecycle().active_version().await.unwrap();
    assert_eq!(active.id.as_str(), "1.0.0");
    let image = restarted
        .coordinator
        .handle_fetch(get("https://app.test/img/a.png"))
        .await
        .unwrap();
    assert_eq!(image.response.text().unwrap(), "png");
    let shell = restarted.coordinator.handle_fetch(get(ORIGIN)).await.unwrap();
    assert!(shell.is_from_cache());
}
