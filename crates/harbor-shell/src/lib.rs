//! # Harbor Shell
//!
//! Everything between platform signals and the application UI: connectivity,
//! the install prompt, notifications, and the [`Coordinator`] that folds them
//! together with the worker lifecycle into one observable [`AppState`].

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod install;
pub mod notifications;

pub use config::HarborConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use coordinator::{AppState, Coordinator, Platform, ShellEvent};
pub use install::{DeferredPrompt, InstallOutcome, InstallPromptCoordinator};
pub use notifications::{
    ActionBinding, AppCommand, ChannelSink, NotificationAction, NotificationClick,
    NotificationConfig, NotificationDescriptor, NotificationDispatcher, NotificationId,
    NotificationSink, SinkMessage,
};
