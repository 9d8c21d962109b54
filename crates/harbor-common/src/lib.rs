//! # Harbor Common
//!
//! Shared error taxonomy, logging configuration, retry helpers and clocks for
//! the Harbor offline resilience layer.
//!
//! ## Features
//!
//! - Unified [`HarborError`] covering network, install-prompt and precache failures
//! - Logging configuration and setup
//! - Retry and timeout utilities
//! - Injectable wall clock for cache ageing

use std::time::Duration;
use thiserror::Error;

pub mod clock;
pub mod logging;
pub mod retry;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, Timestamp};
pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for Harbor.
#[derive(Error, Debug)]
pub enum HarborError {
    /// No connectivity (or the network failed) and no cache fallback exists.
    #[error("Network unavailable for {url}: {reason}")]
    NetworkUnavailable { url: String, reason: String },

    /// Install prompt invoked without a captured, unresolved ticket.
    #[error("No install prompt available")]
    PromptUnavailable,

    /// An asset in the precache manifest could not be fetched.
    #[error("Precache failed for {url}: {reason}")]
    PrecacheFailure { url: String, reason: String },

    /// Operation exceeded its time budget.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl HarborError {
    /// Create a network-unavailable error.
    pub fn network_unavailable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NetworkUnavailable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a precache failure.
    pub fn precache(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PrecacheFailure {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Check if this error is worth retrying later (e.g. once back online).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarborError::NetworkUnavailable { .. }
                | HarborError::PrecacheFailure { .. }
                | HarborError::Timeout(_)
                | HarborError::Io(_)
        )
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            HarborError::NetworkUnavailable { .. } => "network_unavailable",
            HarborError::PromptUnavailable => "prompt_unavailable",
            HarborError::PrecacheFailure { .. } => "precache_failure",
            HarborError::Timeout(_) => "timeout",
            HarborError::Config { .. } => "config",
            HarborError::Io(_) => "io",
            HarborError::Json(_) => "json",
            HarborError::NotFound(_) => "not_found",
            HarborError::InvalidArgument(_) => "invalid_argument",
            HarborError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for Harbor operations.
pub type Result<T> = std::result::Result<T, HarborError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Wrap any error as a config error carrying `message`.
    fn config_context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn config_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| HarborError::config_with_source(message, e))
    }
}

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| HarborError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            HarborError::network_unavailable("https://a/", "offline").category(),
            "network_unavailable"
        );
        assert_eq!(HarborError::PromptUnavailable.category(), "prompt_unavailable");
        assert_eq!(
            HarborError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(HarborError::network_unavailable("u", "r").is_retryable());
        assert!(HarborError::precache("u", "r").is_retryable());
        assert!(!HarborError::PromptUnavailable.is_retryable());
        assert!(!HarborError::config("bad").is_retryable());
    }

    #[test]
    fn test_display_mentions_url() {
        let err = HarborError::precache("https://example.com/", "status 500");
        assert_eq!(
            err.to_string(),
            "Precache failed for https://example.com/: status 500"
        );
    }

    #[test]
    fn test_config_context() {
        let parsed: std::result::Result<u32, _> = "x".parse::<u32>();
        let err = parsed.config_context("max_entries").unwrap_err();
        assert!(matches!(err, HarborError::Config { source: Some(_), .. }));
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("test").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("test"),
            Err(HarborError::NotFound(_))
        ));
    }
}
