//! Background sync registrations.
//!
//! A registered tag is delivered as a [`SyncEvent`] while online, or on the
//! next offline to online edge. The receiver reports the outcome with
//! [`SyncRegistrar::complete`] or [`SyncRegistrar::fail`]; failures are
//! re-delivered after a backoff until the attempt budget is spent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use harbor_common::RetryConfig;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delivery of a pending tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub tag: String,
    /// 1-indexed delivery attempt.
    pub attempt: u32,
}

/// Retry schedule for failed syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_attempts: u32,
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 30,
            max_delay_secs: 300,
        }
    }
}

impl SyncConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Default)]
struct Registration {
    attempts: u32,
    in_flight: bool,
    retry: Option<JoinHandle<()>>,
}

struct Inner {
    tags: Mutex<HashMap<String, Registration>>,
    online: AtomicBool,
    retry: RetryConfig,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl Inner {
    fn tags(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.tags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, tag: &str, registration: &mut Registration) {
        registration.attempts += 1;
        registration.in_flight = true;
        debug!(tag, attempt = registration.attempts, "Delivering sync");
        let _ = self.events.send(SyncEvent {
            tag: tag.to_string(),
            attempt: registration.attempts,
        });
    }
}

/// Registrar of deferred actions keyed by tag. Cloning shares the registrar.
#[derive(Clone)]
pub struct SyncRegistrar {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRegistrar")
            .field("online", &self.is_online())
            .field("pending", &self.pending_tags())
            .finish()
    }
}

impl SyncRegistrar {
    /// Create a registrar and the receiver for its deliveries.
    pub fn new(config: &SyncConfig, online: bool) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registrar = Self {
            inner: Arc::new(Inner {
                tags: Mutex::new(HashMap::new()),
                online: AtomicBool::new(online),
                retry: config.retry(),
                events,
            }),
        };
        (registrar, rx)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Register `tag`. Registering a pending tag again is a no-op and returns
    /// `false`.
    pub fn register(&self, tag: &str) -> bool {
        let mut tags = self.inner.tags();
        if tags.contains_key(tag) {
            debug!(tag, "Sync already registered");
            return false;
        }
        let mut registration = Registration::default();
        if self.is_online() {
            self.inner.deliver(tag, &mut registration);
        }
        tags.insert(tag.to_string(), registration);
        info!(tag, "Sync registered");
        true
    }

    /// Connectivity changed. Going online delivers every pending tag that is
    /// not already being handled.
    pub fn on_connectivity(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if !online || was_online {
            return;
        }
        let mut tags = self.inner.tags();
        for (tag, registration) in tags.iter_mut() {
            if !registration.in_flight {
                if let Some(task) = registration.retry.take() {
                    task.abort();
                }
                self.inner.deliver(tag, registration);
            }
        }
    }

    /// The action for `tag` succeeded.
    pub fn complete(&self, tag: &str) -> bool {
        match self.inner.tags().remove(tag) {
            Some(registration) => {
                if let Some(task) = registration.retry {
                    task.abort();
                }
                debug!(tag, attempts = registration.attempts, "Sync complete");
                true
            }
            None => false,
        }
    }

    /// The action for `tag` failed. Schedules a re-delivery, or drops the tag
    /// once its attempts are spent. Must be called within a tokio runtime.
    pub fn fail(&self, tag: &str) {
        let mut tags = self.inner.tags();
        let Some(registration) = tags.get_mut(tag) else {
            return;
        };
        registration.in_flight = false;

        if !self.inner.retry.allows_retry_after(registration.attempts) {
            warn!(tag, attempts = registration.attempts, "Sync gave up");
            tags.remove(tag);
            return;
        }

        let delay = self.inner.retry.delay_for_attempt(registration.attempts + 1);
        warn!(tag, attempt = registration.attempts, ?delay, "Sync failed, retrying");
        let inner = Arc::clone(&self.inner);
        let owned = tag.to_string();
        registration.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inner.online.load(Ordering::SeqCst) {
                return;
            }
            let mut tags = inner.tags();
            if let Some(registration) = tags.get_mut(&owned) {
                registration.retry = None;
                if !registration.in_flight {
                    inner.deliver(&owned, registration);
                }
            }
        }));
    }

    /// Tags registered and not yet completed, sorted.
    pub fn pending_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inner.tags().keys().cloned().collect();
        tags.sort();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig {
            max_attempts: 3,
            initial_delay_secs: 30,
            max_delay_secs: 300,
        }
    }

    #[tokio::test]
    async fn test_register_online_delivers_immediately() {
        let (registrar, mut rx) = SyncRegistrar::new(&config(), true);

        assert!(registrar.register("outbox"));

        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent {
                tag: "outbox".to_string(),
                attempt: 1
            }
        );
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (registrar, mut rx) = SyncRegistrar::new(&config(), false);

        assert!(registrar.register("outbox"));
        assert!(!registrar.register("outbox"));
        assert_eq!(registrar.pending_tags(), vec!["outbox".to_string()]);

        registrar.on_connectivity(true);
        assert_eq!(rx.try_recv().unwrap().tag, "outbox");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_registration_waits_for_online_edge() {
        let (registrar, mut rx) = SyncRegistrar::new(&config(), false);
        registrar.register("progress");
        assert!(rx.try_recv().is_err());

        registrar.on_connectivity(false);
        assert!(rx.try_recv().is_err());

        registrar.on_connectivity(true);
        assert_eq!(rx.try_recv().unwrap().attempt, 1);

        // Repeated online signal is not an edge.
        registrar.on_connectivity(true);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_complete_removes_tag() {
        let (registrar, _rx) = SyncRegistrar::new(&config(), true);
        registrar.register("outbox");
        assert!(registrar.complete("outbox"));
        assert!(!registrar.complete("outbox"));
        assert!(registrar.pending_tags().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_redelivers_with_backoff_then_gives_up() {
        let (registrar, mut rx) = SyncRegistrar::new(&config(), true);
        registrar.register("outbox");
        assert_eq!(rx.recv().await.unwrap().attempt, 1);

        registrar.fail("outbox");
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(rx.recv().await.unwrap().attempt, 2);

        registrar.fail("outbox");
        assert_eq!(rx.recv().await.unwrap().attempt, 3);

        registrar.fail("outbox");
        assert!(registrar.pending_tags().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_offline_waits_for_reconnect() {
        let (registrar, mut rx) = SyncRegistrar::new(&config(), true);
        registrar.register("outbox");
        rx.recv().await.unwrap();

        registrar.fail("outbox");
        registrar.on_connectivity(false);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());

        registrar.on_connectivity(true);
        assert_eq!(rx.try_recv().unwrap().attempt, 2);
    }

    #[test]
    fn test_config_retry_schedule() {
        let retry = config().retry();
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(30));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(60));
        assert!(!retry.allows_retry_after(3));
    }
}
