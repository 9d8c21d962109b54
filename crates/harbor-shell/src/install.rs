//! Install prompt coordination.
//!
//! The platform hands out a one-shot, deferrable install prompt. It is held
//! as a ticket until the application asks for it, and can be used exactly
//! once. A second caller gets [`HarborError::PromptUnavailable`] immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use harbor_common::{HarborError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// The user's answer to the install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallOutcome {
    Accepted,
    Dismissed,
}

/// A platform install prompt that was deferred for later use.
pub trait DeferredPrompt: Send {
    /// Show the prompt and resolve with the user's decision. Consumes the
    /// prompt.
    fn prompt(self: Box<Self>) -> BoxFuture<'static, InstallOutcome>;
}

enum Ticket {
    Empty,
    Captured(Box<dyn DeferredPrompt>),
    /// Prompt shown, decision pending.
    Prompting,
}

impl Ticket {
    fn label(&self) -> &'static str {
        match self {
            Ticket::Empty => "empty",
            Ticket::Captured(_) => "captured",
            Ticket::Prompting => "prompting",
        }
    }
}

/// Clears a `Prompting` ticket when the prompt resolves or the caller gives up.
struct PromptingGuard<'a>(&'a InstallPromptCoordinator);

impl Drop for PromptingGuard<'_> {
    fn drop(&mut self) {
        let mut ticket = self.0.ticket();
        if matches!(*ticket, Ticket::Prompting) {
            *ticket = Ticket::Empty;
        }
    }
}

/// Holds the install ticket.
pub struct InstallPromptCoordinator {
    ticket: Mutex<Ticket>,
    installed: AtomicBool,
}

impl std::fmt::Debug for InstallPromptCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallPromptCoordinator")
            .field("ticket", &self.ticket().label())
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl Default for InstallPromptCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallPromptCoordinator {
    pub fn new() -> Self {
        Self {
            ticket: Mutex::new(Ticket::Empty),
            installed: AtomicBool::new(false),
        }
    }

    fn ticket(&self) -> MutexGuard<'_, Ticket> {
        self.ticket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a fresh platform prompt. Replaces a captured one; ignored while a
    /// prompt is on screen.
    pub fn capture(&self, prompt: Box<dyn DeferredPrompt>) -> bool {
        let mut ticket = self.ticket();
        if matches!(*ticket, Ticket::Prompting) {
            debug!("Install prompt captured while prompting, ignored");
            return false;
        }
        *ticket = Ticket::Captured(prompt);
        debug!("Install prompt captured");
        true
    }

    /// A ticket is ready to be shown.
    pub fn can_install(&self) -> bool {
        matches!(*self.ticket(), Ticket::Captured(_))
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Show the captured prompt and wait for the user. Dropping the returned
    /// future abandons the prompt and frees the ticket for a fresh signal.
    pub async fn prompt_install(&self) -> Result<InstallOutcome> {
        let prompt = {
            let mut ticket = self.ticket();
            match std::mem::replace(&mut *ticket, Ticket::Prompting) {
                Ticket::Captured(prompt) => prompt,
                other => {
                    *ticket = other;
                    return Err(HarborError::PromptUnavailable);
                }
            }
        };

        let guard = PromptingGuard(self);
        let outcome = prompt.prompt().await;
        drop(guard);

        if outcome == InstallOutcome::Accepted {
            self.installed.store(true, Ordering::SeqCst);
        }
        info!(?outcome, "Install prompt resolved");
        Ok(outcome)
    }

    /// Discard a captured ticket without showing it.
    pub fn dismiss(&self) -> bool {
        let mut ticket = self.ticket();
        if matches!(*ticket, Ticket::Captured(_)) {
            *ticket = Ticket::Empty;
            debug!("Install prompt dismissed by application");
            true
        } else {
            false
        }
    }

    /// The platform reports the app as installed.
    pub fn app_installed(&self) {
        self.installed.store(true, Ordering::SeqCst);
        let mut ticket = self.ticket();
        if matches!(*ticket, Ticket::Captured(_)) {
            *ticket = Ticket::Empty;
        }
        info!("App installed");
    }
}
