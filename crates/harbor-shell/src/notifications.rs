//! Push payloads in, notifications out, clicks back to app commands.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifier of a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub id: String,
    pub label: String,
}

/// What the platform is asked to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationDescriptor {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub actions: Vec<NotificationAction>,
    /// Page opened when the notification body is clicked.
    pub url: Option<String>,
}

/// Command handed back to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum AppCommand {
    OpenWindow { url: String },
    Focus,
    Close,
}

/// A click on a notification. `action_id` is `None` for the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationClick {
    pub notification_id: NotificationId,
    pub action_id: Option<String>,
}

/// Maps an action id to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionBinding {
    pub action: String,
    #[serde(flatten)]
    pub command: AppCommand,
}

/// Notification configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub default_title: String,
    /// Body used for empty payloads.
    pub default_body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    /// Opened for body clicks and unknown actions.
    pub default_url: String,
    pub actions: Vec<ActionBinding>,
    /// Click targets remembered for this many recent notifications.
    pub max_tracked: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "Harbor".to_string(),
            default_body: "You have a new update".to_string(),
            icon: None,
            badge: None,
            default_url: "/".to_string(),
            actions: vec![
                ActionBinding {
                    action: "open".to_string(),
                    command: AppCommand::OpenWindow {
                        url: "/".to_string(),
                    },
                },
                ActionBinding {
                    action: "close".to_string(),
                    command: AppCommand::Close,
                },
            ],
            max_tracked: 64,
        }
    }
}

/// Where notifications are rendered.
pub trait NotificationSink: Send + Sync {
    fn show(&self, descriptor: &NotificationDescriptor);
    fn dismiss(&self, id: NotificationId);
}

/// Message produced by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    Show(NotificationDescriptor),
    Dismiss(NotificationId),
}

/// A sink that forwards to a channel, for hosts that render elsewhere.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn show(&self, descriptor: &NotificationDescriptor) {
        let _ = self.tx.send(SinkMessage::Show(descriptor.clone()));
    }

    fn dismiss(&self, id: NotificationId) {
        let _ = self.tx.send(SinkMessage::Dismiss(id));
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PushPayload {
    title: Option<String>,
    body: Option<String>,
    icon: Option<String>,
    badge: Option<String>,
    tag: Option<String>,
    url: Option<String>,
    actions: Vec<NotificationAction>,
}

/// Builds notifications from push payloads and resolves clicks.
pub struct NotificationDispatcher {
    config: NotificationConfig,
    sink: Arc<dyn NotificationSink>,
    /// Payload URL per notification that carried one. Descriptors are not kept.
    click_urls: Mutex<LruCache<NotificationId, String>>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("config", &self.config)
            .field("tracked", &self.tracked())
            .finish()
    }
}

impl NotificationDispatcher {
    pub fn new(config: NotificationConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let capacity = NonZeroUsize::new(config.max_tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            sink,
            click_urls: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn click_urls(&self) -> MutexGuard<'_, LruCache<NotificationId, String>> {
        self.click_urls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Render a notification for `payload`.
    ///
    /// A JSON object supplies the fields; any other payload is the body text.
    pub fn on_push(&self, payload: &[u8]) -> NotificationDescriptor {
        let descriptor = self.describe(payload);
        debug!(id = descriptor.id.raw(), title = %descriptor.title, "Showing notification");
        self.sink.show(&descriptor);
        if let Some(url) = &descriptor.url {
            self.click_urls().put(descriptor.id, url.clone());
        }
        descriptor
    }

    fn describe(&self, payload: &[u8]) -> NotificationDescriptor {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();
        let parsed = if text.starts_with('{') {
            match serde_json::from_str::<PushPayload>(text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Push payload is not valid JSON, using it as text");
                    PushPayload {
                        body: Some(text.to_string()),
                        ..Default::default()
                    }
                }
            }
        } else {
            PushPayload {
                body: (!text.is_empty()).then(|| text.to_string()),
                ..Default::default()
            }
        };

        NotificationDescriptor {
            id: NotificationId::next(),
            title: parsed
                .title
                .unwrap_or_else(|| self.config.default_title.clone()),
            body: parsed
                .body
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| self.config.default_body.clone()),
            icon: parsed.icon.or_else(|| self.config.icon.clone()),
            badge: parsed.badge.or_else(|| self.config.badge.clone()),
            tag: parsed.tag,
            actions: parsed.actions,
            url: parsed.url,
        }
    }

    /// Dismiss the clicked notification and resolve the command. Total: an
    /// unknown or absent action opens the notification's page, or the
    /// default page.
    pub fn on_click(&self, click: NotificationClick) -> AppCommand {
        self.sink.dismiss(click.notification_id);
        let url = self.click_urls().pop(&click.notification_id);

        if let Some(action) = click.action_id.as_deref() {
            if let Some(binding) = self.config.actions.iter().find(|b| b.action == action) {
                return binding.command.clone();
            }
            debug!(action, "Unknown notification action, using default");
        }

        let url = url.unwrap_or_else(|| self.config.default_url.clone());
        AppCommand::OpenWindow { url }
    }

    /// The user closed a notification without clicking it.
    pub fn on_close(&self, id: NotificationId) {
        if self.click_urls().pop(&id).is_some() {
            debug!(id = id.raw(), "Notification closed");
        }
    }

    /// Notifications whose click target is still remembered.
    pub fn tracked(&self) -> usize {
        self.click_urls().len()
    }
}
