//! Worker version lifecycle.
//!
//! ```text
//! deploy ──► Installing ──precache ok──► Waiting ──► Active ──► Redundant
//!                │                          │
//!                └──precache failed──► Redundant ◄── superseded
//! ```
//!
//! At most one version is Active and at most one is Waiting. Installs are
//! serialised; a failed install leaves the registration as it was.

use std::sync::Arc;

use harbor_cache::{
    CacheRouter, CacheStorage, Precache, PrecacheIndex, PrecacheManifest, StrategyOutcome,
    PRECACHE_CACHE,
};
use harbor_common::{HarborError, Result, RetryConfig, Timestamp};
use harbor_net::Request;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Opaque deployment token, e.g. a build hash or semver string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VersionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Worker version state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    /// Precache population in progress.
    Installing,
    /// Installed, waiting for the previous version's clients to go away.
    Waiting,
    /// Serving intercepted requests.
    Active,
    /// Superseded or failed. Terminal.
    Redundant,
}

/// One deployed version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerVersion {
    pub id: VersionId,
    pub state: VersionState,
    pub manifest: PrecacheManifest,
    pub installed_at: Timestamp,
}

/// Lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Activate a freshly installed version at once when nothing is active.
    pub skip_waiting: bool,
    /// Precached URL served to navigations that cannot reach the network.
    pub navigation_fallback: Option<String>,
    /// Attempts per precache asset during install.
    pub precache_attempts: u32,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            skip_waiting: false,
            navigation_fallback: None,
            precache_attempts: 1,
            event_capacity: 64,
        }
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    StateChanged { id: VersionId, state: VersionState },
    /// A version is waiting behind an active one (`true`), or no longer is.
    UpdateAvailable(bool),
    /// A new version took control.
    ControllerChanged { id: VersionId },
    /// The host must reload to run under the newly active version.
    ReloadRequested,
    InstallFailed { id: VersionId, reason: String },
}

/// What `deploy` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The id is already active or waiting.
    Unchanged,
    /// Installed and waiting.
    Waiting,
    /// Installed and activated.
    Activated,
}

/// Persisted registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSnapshot {
    pub active: Option<WorkerVersion>,
    pub waiting: Option<WorkerVersion>,
}

#[derive(Debug, Default)]
struct Registration {
    installing: Option<WorkerVersion>,
    waiting: Option<WorkerVersion>,
    active: Option<WorkerVersion>,
    active_index: Option<PrecacheIndex>,
    clients: usize,
}

impl Registration {
    fn holds(&self, id: &VersionId) -> bool {
        self.active.as_ref().is_some_and(|v| &v.id == id)
            || self.waiting.as_ref().is_some_and(|v| &v.id == id)
    }
}

/// Owns the version state machine and answers fetches for the active version.
pub struct LifecycleManager {
    storage: Arc<CacheStorage>,
    router: Arc<CacheRouter>,
    precache: Precache,
    config: LifecycleConfig,
    registration: RwLock<Registration>,
    install_lock: Mutex<()>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(
        storage: Arc<CacheStorage>,
        router: Arc<CacheRouter>,
        precache: Precache,
        config: LifecycleConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let precache = if config.precache_attempts > 1 {
            precache.with_retry(RetryConfig::quick(config.precache_attempts))
        } else {
            precache
        };
        Self {
            storage,
            router,
            precache,
            config,
            registration: RwLock::new(Registration::default()),
            install_lock: Mutex::new(()),
            events,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        debug!(?event, "Lifecycle event");
        let _ = self.events.send(event);
    }

    fn emit_state(&self, version: &WorkerVersion) {
        self.emit(LifecycleEvent::StateChanged {
            id: version.id.clone(),
            state: version.state,
        });
    }

    /// Install a new version from `manifest`.
    ///
    /// On [`HarborError::PrecacheFailure`] the new version is discarded and the
    /// current registration keeps serving.
    pub async fn deploy(&self, id: VersionId, manifest: PrecacheManifest) -> Result<DeployOutcome> {
        let install = self.install_lock.lock().await;

        let mut version = WorkerVersion {
            id: id.clone(),
            state: VersionState::Installing,
            manifest,
            installed_at: self.storage.clock().now(),
        };
        {
            let mut reg = self.registration.write().await;
            if reg.holds(&id) {
                debug!(version = %id, "Version already deployed");
                return Ok(DeployOutcome::Unchanged);
            }
            reg.installing = Some(version.clone());
        }
        info!(version = %id, assets = version.manifest.entries.len(), "Installing version");
        self.emit_state(&version);

        if let Err(e) = self.precache.install(&version.manifest).await {
            self.registration.write().await.installing = None;
            version.state = VersionState::Redundant;
            warn!(version = %id, error = %e, "Install failed, keeping current version");
            self.emit_state(&version);
            self.emit(LifecycleEvent::InstallFailed {
                id,
                reason: e.to_string(),
            });
            return Err(e);
        }

        let (superseded, has_active, activate) = {
            let mut reg = self.registration.write().await;
            reg.installing = None;
            version.state = VersionState::Waiting;
            let superseded = reg.waiting.replace(version.clone());
            let has_active = reg.active.is_some();
            let activate = (self.config.skip_waiting && !has_active) || reg.clients == 0;
            (superseded, has_active, activate)
        };
        if let Some(mut old) = superseded {
            info!(version = %old.id, by = %id, "Waiting version superseded");
            old.state = VersionState::Redundant;
            self.emit_state(&old);
        }
        self.emit_state(&version);

        if activate {
            self.activate_waiting(&install).await;
            return Ok(DeployOutcome::Activated);
        }
        if has_active {
            info!(version = %id, "Update available");
            self.emit(LifecycleEvent::UpdateAvailable(true));
        }
        Ok(DeployOutcome::Waiting)
    }

    /// Promote the waiting version and ask the host to reload.
    ///
    /// Returns `false` when nothing is waiting. Waits for an install in
    /// progress to finish first.
    pub async fn activate_now(&self) -> bool {
        let install = self.install_lock.lock().await;
        if !self.activate_waiting(&install).await {
            return false;
        }
        self.emit(LifecycleEvent::ReloadRequested);
        true
    }

    /// Callers hold the install lock, so no install runs during cleanup.
    async fn activate_waiting(&self, _install: &MutexGuard<'_, ()>) -> bool {
        let (new_active, old_active) = {
            let mut reg = self.registration.write().await;
            let Some(mut version) = reg.waiting.take() else {
                return false;
            };
            let index = match self.precache.index(&version.manifest) {
                Ok(index) => index,
                Err(e) => {
                    warn!(version = %version.id, error = %e, "Unusable precache manifest");
                    PrecacheIndex::default()
                }
            };
            version.state = VersionState::Active;
            let old = reg.active.replace(version.clone());
            reg.active_index = Some(index);
            (version, old)
        };

        if let Some(mut old) = old_active {
            old.state = VersionState::Redundant;
            self.emit_state(&old);
            self.emit(LifecycleEvent::UpdateAvailable(false));
        }
        info!(version = %new_active.id, "Version activated");
        self.emit_state(&new_active);
        self.emit(LifecycleEvent::ControllerChanged {
            id: new_active.id.clone(),
        });

        self.cleanup(&new_active).await;
        true
    }

    /// Drop stale precache entries and cache generations, then sweep.
    ///
    /// Precache entries owned by any registered version survive.
    async fn cleanup(&self, active: &WorkerVersion) {
        let registered: Vec<PrecacheManifest> = {
            let reg = self.registration.read().await;
            [&reg.active, &reg.waiting, &reg.installing]
                .into_iter()
                .flatten()
                .map(|v| v.manifest.clone())
                .collect()
        };
        let manifests: Vec<&PrecacheManifest> = registered.iter().collect();
        if let Err(e) = self.precache.cleanup(&manifests).await {
            warn!(version = %active.id, error = %e, "Precache cleanup failed");
        }

        let mut keep = self.router.cache_names();
        keep.push(PRECACHE_CACHE.to_string());
        let outdated = self.storage.retain(&keep).await;
        if !outdated.is_empty() {
            info!(caches = ?outdated, "Removed outdated cache generations");
        }

        let swept = self.storage.sweep_all().await;
        debug!(swept, "Activation sweep done");
    }

    /// An application instance opened.
    pub async fn client_opened(&self) {
        self.registration.write().await.clients += 1;
    }

    /// An application instance closed. When the last one goes, a waiting
    /// version activates. Returns whether that happened.
    pub async fn client_closed(&self) -> bool {
        let should_activate = {
            let mut reg = self.registration.write().await;
            reg.clients = reg.clients.saturating_sub(1);
            reg.clients == 0 && reg.waiting.is_some()
        };
        if !should_activate {
            return false;
        }
        let install = self.install_lock.lock().await;
        // A client may have opened while the lock was held.
        if self.registration.read().await.clients > 0 {
            return false;
        }
        self.activate_waiting(&install).await
    }

    pub async fn clients(&self) -> usize {
        self.registration.read().await.clients
    }

    /// Answer an intercepted request under the active version.
    pub async fn handle_fetch(&self, request: Request) -> Result<StrategyOutcome> {
        let index = self.registration.read().await.active_index.clone();
        let Some(index) = index else {
            return self.router.pass_through(request).await;
        };

        if let Some(response) = self.precache.lookup(&index, &request).await? {
            debug!(url = %request.url, "Served from precache");
            return Ok(StrategyOutcome::cache(response));
        }

        let navigation = request.is_navigation();
        match self.router.handle(request).await {
            Err(e @ (HarborError::NetworkUnavailable { .. } | HarborError::Timeout(_))) if navigation => {
                match self.navigation_fallback(&index).await {
                    Some(response) => {
                        debug!(error = %e, "Serving navigation fallback");
                        Ok(StrategyOutcome::cache(response))
                    }
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    async fn navigation_fallback(&self, index: &PrecacheIndex) -> Option<harbor_net::Response> {
        let url = self.config.navigation_fallback.as_deref()?;
        match self.precache.lookup_url(index, url).await {
            Ok(found) => found,
            Err(e) => {
                warn!(url, error = %e, "Navigation fallback lookup failed");
                None
            }
        }
    }

    pub async fn active_version(&self) -> Option<WorkerVersion> {
        self.registration.read().await.active.clone()
    }

    pub async fn waiting_version(&self) -> Option<WorkerVersion> {
        self.registration.read().await.waiting.clone()
    }

    pub async fn installing_version(&self) -> Option<WorkerVersion> {
        self.registration.read().await.installing.clone()
    }

    /// A version waits behind an active one.
    pub async fn update_available(&self) -> bool {
        let reg = self.registration.read().await;
        reg.active.is_some() && reg.waiting.is_some()
    }

    pub async fn snapshot(&self) -> RegistrationSnapshot {
        let reg = self.registration.read().await;
        RegistrationSnapshot {
            active: reg.active.clone(),
            waiting: reg.waiting.clone(),
        }
    }

    /// Reinstate a persisted registration. Does not touch the caches.
    pub async fn restore(&self, snapshot: RegistrationSnapshot) -> Result<()> {
        let index = match &snapshot.active {
            Some(active) => Some(self.precache.index(&active.manifest)?),
            None => None,
        };
        let update = {
            let mut reg = self.registration.write().await;
            reg.active = snapshot.active.map(|mut v| {
                v.state = VersionState::Active;
                v
            });
            reg.waiting = snapshot.waiting.map(|mut v| {
                v.state = VersionState::Waiting;
                v
            });
            reg.active_index = index;
            reg.active.is_some() && reg.waiting.is_some()
        };
        info!(update_available = update, "Registration restored");
        if update {
            self.emit(LifecycleEvent::UpdateAvailable(true));
        }
        Ok(())
    }
}
