//! Application-facing facade.
//!
//! ```text
//! platform signals ──► Coordinator ──► AppState (watch)
//!                          │      └──► ShellEvent (mpsc): reload, commands, sync
//!                          ├── ConnectivityMonitor
//!                          ├── InstallPromptCoordinator
//!                          ├── NotificationDispatcher
//!                          ├── SyncRegistrar
//!                          └── LifecycleManager ──► CacheRouter / Precache
//! ```
//!
//! Lifecycle and connectivity problems only ever show up as state flags and
//! log lines. Fetch errors go back to the caller of `handle_fetch`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use harbor_cache::{CacheRouter, CacheStorage, Precache, PrecacheManifest, StrategyOutcome};
use harbor_common::{HarborError, Result, SharedClock, SystemClock};
use harbor_net::{Fetcher, Request};
use harbor_sw::{DeployOutcome, LifecycleManager, RegistrationSnapshot, SyncEvent, SyncRegistrar, VersionId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HarborConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::install::{DeferredPrompt, InstallOutcome, InstallPromptCoordinator};
use crate::notifications::{
    AppCommand, NotificationClick, NotificationDescriptor, NotificationDispatcher, NotificationId,
    NotificationSink,
};

const CACHES_FILE: &str = "caches.json";
const REGISTRATION_FILE: &str = "registration.json";

/// Observable application state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    pub online: bool,
    pub installed: bool,
    pub is_standalone: bool,
    pub can_install: bool,
    pub update_available: bool,
}

/// Events for the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Reload to run under the newly active version.
    Reload,
    Command(AppCommand),
    Sync(SyncEvent),
}

/// Platform services the coordinator is wired to.
#[derive(Clone)]
pub struct Platform {
    pub fetcher: Arc<dyn Fetcher>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: SharedClock,
    pub online: bool,
}

impl Platform {
    pub fn new(fetcher: Arc<dyn Fetcher>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            fetcher,
            sink,
            clock: SystemClock::shared(),
            online: true,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }
}

/// The facade. Share it behind an `Arc`.
pub struct Coordinator {
    config: HarborConfig,
    storage: Arc<CacheStorage>,
    lifecycle: LifecycleManager,
    connectivity: ConnectivityMonitor,
    install: InstallPromptCoordinator,
    notifications: NotificationDispatcher,
    sync: SyncRegistrar,
    state: watch::Sender<AppState>,
    events: mpsc::UnboundedSender<ShellEvent>,
    sync_forwarder: JoinHandle<()>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.sync_forwarder.abort();
    }
}

impl Coordinator {
    /// Build every component, restoring persisted state when `persist_dir` is
    /// set. Must be called within a tokio runtime.
    pub async fn start(
        config: HarborConfig,
        platform: Platform,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ShellEvent>)> {
        config.validate()?;

        let storage = match &config.persist_dir {
            Some(dir) => CacheStorage::load(&dir.join(CACHES_FILE), Arc::clone(&platform.clock)).await?,
            None => CacheStorage::new(Arc::clone(&platform.clock)),
        };
        let storage = Arc::new(storage);

        let router = CacheRouter::from_manifest(
            &config.routes,
            &storage,
            Arc::clone(&platform.fetcher),
            config.origin.clone(),
        )
        .await?;
        let precache = Precache::open(&storage, Arc::clone(&platform.fetcher), config.origin.clone()).await;
        let lifecycle = LifecycleManager::new(
            Arc::clone(&storage),
            Arc::new(router),
            precache,
            config.lifecycle.clone(),
        );

        if let Some(dir) = &config.persist_dir {
            if let Some(snapshot) = read_registration(&dir.join(REGISTRATION_FILE)).await? {
                lifecycle.restore(snapshot).await?;
            }
        }

        let (events, rx) = mpsc::unbounded_channel();
        let (sync, mut sync_rx) = SyncRegistrar::new(&config.sync, platform.online);
        let sync_forwarder = tokio::spawn({
            let events = events.clone();
            async move {
                while let Some(event) = sync_rx.recv().await {
                    if events.send(ShellEvent::Sync(event)).is_err() {
                        break;
                    }
                }
            }
        });

        let (state, _) = watch::channel(AppState {
            online: platform.online,
            update_available: lifecycle.update_available().await,
            ..AppState::default()
        });

        let coordinator = Self {
            storage,
            lifecycle,
            connectivity: ConnectivityMonitor::new(ConnectivityState::from_online(platform.online)),
            install: InstallPromptCoordinator::new(),
            notifications: NotificationDispatcher::new(config.notifications.clone(), platform.sink),
            sync,
            state,
            events,
            sync_forwarder,
            config,
        };
        info!(online = platform.online, "Coordinator started");
        Ok((coordinator, rx))
    }

    // ---- observable state ----

    pub fn state(&self) -> AppState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AppState> {
        self.state.subscribe()
    }

    /// Connectivity transitions, one event per edge.
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }

    fn update_state(&self, change: impl FnOnce(&mut AppState)) {
        self.state.send_if_modified(|state| {
            let before = *state;
            change(state);
            before != *state
        });
    }

    fn emit(&self, event: ShellEvent) {
        if self.events.send(event).is_err() {
            debug!("Shell event receiver dropped");
        }
    }

    // ---- commands ----

    /// Show the captured install prompt.
    pub async fn install_app(&self) -> Result<InstallOutcome> {
        self.update_state(|s| s.can_install = false);
        let outcome = self.install.prompt_install().await?;
        self.update_state(|s| {
            s.installed |= outcome == InstallOutcome::Accepted;
            s.can_install = false;
        });
        Ok(outcome)
    }

    /// Drop the install prompt without showing it.
    pub fn dismiss_install_prompt(&self) -> bool {
        let dismissed = self.install.dismiss();
        self.update_state(|s| s.can_install = false);
        dismissed
    }

    /// Activate the waiting version. The host receives [`ShellEvent::Reload`].
    pub async fn update_app(&self) -> bool {
        let activated = self.lifecycle.activate_now().await;
        self.refresh_update_flag().await;
        if activated {
            self.emit(ShellEvent::Reload);
        }
        activated
    }

    // ---- platform inputs ----

    pub fn set_online(&self, online: bool) {
        if self.connectivity.set_online(online) {
            self.update_state(|s| s.online = online);
            self.sync.on_connectivity(online);
        }
    }

    pub fn capture_install_prompt(&self, prompt: Box<dyn DeferredPrompt>) {
        if self.install.capture(prompt) {
            let can_install = self.install.can_install();
            self.update_state(|s| s.can_install = can_install);
        }
    }

    pub fn app_installed(&self) {
        self.install.app_installed();
        self.update_state(|s| {
            s.installed = true;
            s.can_install = false;
        });
    }

    /// Standalone display means the app runs installed.
    pub fn set_display_mode(&self, standalone: bool) {
        self.update_state(|s| {
            s.is_standalone = standalone;
            s.installed |= standalone;
        });
    }

    /// Deploy a version. Failures are logged and leave the state untouched.
    pub async fn deploy(&self, id: &str, manifest: PrecacheManifest) -> Option<DeployOutcome> {
        match self.lifecycle.deploy(VersionId::new(id), manifest).await {
            Ok(outcome) => {
                self.refresh_update_flag().await;
                Some(outcome)
            }
            Err(e) => {
                warn!(version = id, error = %e, category = e.category(), "Deployment failed");
                None
            }
        }
    }

    /// Deploy the configured version and precache manifest, if any.
    pub async fn deploy_configured(&self) -> Option<DeployOutcome> {
        let version = self.config.version.clone()?;
        self.deploy(&version, self.config.precache.clone()).await
    }

    pub async fn handle_fetch(&self, request: Request) -> Result<StrategyOutcome> {
        self.lifecycle.handle_fetch(request).await
    }

    pub fn handle_push(&self, payload: &[u8]) -> NotificationDescriptor {
        self.notifications.on_push(payload)
    }

    /// Resolve a click and forward the command to the host.
    pub fn handle_notification_click(&self, click: NotificationClick) -> AppCommand {
        let command = self.notifications.on_click(click);
        self.emit(ShellEvent::Command(command.clone()));
        command
    }

    /// The user closed a notification without clicking it.
    pub fn handle_notification_close(&self, id: NotificationId) {
        self.notifications.on_close(id);
    }

    pub fn register_sync(&self, tag: &str) -> bool {
        self.sync.register(tag)
    }

    pub fn complete_sync(&self, tag: &str) -> bool {
        self.sync.complete(tag)
    }

    pub fn fail_sync(&self, tag: &str) {
        self.sync.fail(tag);
    }

    pub fn pending_syncs(&self) -> Vec<String> {
        self.sync.pending_tags()
    }

    pub async fn client_opened(&self) {
        self.lifecycle.client_opened().await;
    }

    pub async fn client_closed(&self) {
        if self.lifecycle.client_closed().await {
            self.refresh_update_flag().await;
        }
    }

    async fn refresh_update_flag(&self) {
        let update = self.lifecycle.update_available().await;
        self.update_state(|s| s.update_available = update);
    }

    // ---- persistence ----

    /// Save caches and the registration to `persist_dir`.
    pub async fn persist(&self) -> Result<()> {
        let Some(dir) = &self.config.persist_dir else {
            debug!("No persist_dir, skipping persist");
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        self.storage.save(&dir.join(CACHES_FILE)).await?;
        write_registration(&dir.join(REGISTRATION_FILE), &self.lifecycle.snapshot().await).await?;
        Ok(())
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn config(&self) -> &HarborConfig {
        &self.config
    }

    pub fn persist_dir(&self) -> Option<&PathBuf> {
        self.config.persist_dir.as_ref()
    }
}

async fn read_registration(path: &Path) -> Result<Option<RegistrationSnapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable registration");
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HarborError::Io(e)),
    }
}

async fn write_registration(path: &Path, snapshot: &RegistrationSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "Saved registration");
    Ok(())
}
