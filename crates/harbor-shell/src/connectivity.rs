//! Online/offline state mirror.
//!
//! Driven only by platform edge signals. Repeated identical signals are
//! swallowed, so every broadcast is a real transition.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// Process-wide connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

/// Single writer of [`ConnectivityState`].
#[derive(Debug)]
pub struct ConnectivityMonitor {
    online: AtomicBool,
    events: broadcast::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            online: AtomicBool::new(initial.is_online()),
            events,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState::from_online(self.is_online())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Apply a platform signal. Returns whether it was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return false;
        }
        let state = ConnectivityState::from_online(online);
        info!(?state, "Connectivity changed");
        let _ = self.events.send(state);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityState> {
        self.events.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}
