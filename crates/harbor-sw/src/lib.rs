//! # Harbor SW
//!
//! The background worker side of Harbor.
//!
//! ## Architecture
//!
//! ```text
//! LifecycleManager
//!     ├── installing / waiting / active (WorkerVersion)
//!     ├── Precache (revision-keyed app shell)
//!     └── CacheRouter (runtime routes)
//!
//! SyncRegistrar
//!     └── tag → pending delivery (SyncEvent)
//! ```

pub mod lifecycle;
pub mod sync;

pub use lifecycle::{
    DeployOutcome, LifecycleConfig, LifecycleEvent, LifecycleManager, RegistrationSnapshot,
    VersionId, VersionState, WorkerVersion,
};
pub use sync::{SyncConfig, SyncEvent, SyncRegistrar};
