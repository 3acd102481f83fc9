//! Unified error handling for the ranksync crate
//!
//! Every failure the engine can observe is mapped onto a single [`Error`] enum.
//! The enum carries the information the orchestration layers branch on:
//!
//! - [`Error::is_retryable`] - the explicit retryable flag the substrate consults
//! - [`Error::is_rate_limited`] - the rate-limit family that triggers a checkpoint
//!   and a continuation instead of a failure
//! - [`Error::category`] - coarse classification used for logging and metrics
//!
//! # Usage
//!
//! ```rust,ignore
//! use ranksync::error::{Error, ErrorCategory};
//!
//! fn handle(err: Error) {
//!     if err.is_rate_limited() {
//!         // checkpoint and continue as a fresh execution
//!     } else if err.is_retryable() {
//!         // let the substrate retry the activity
//!     } else {
//!         // terminal failure
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::models::RateLimitInfo;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Points temporarily low, regenerate shortly
    RateLimit,
    /// Hourly budget exhausted, wait for the reset window
    QuotaExceeded,
    /// Upstream API returned an error status
    Api,
    /// Transport-level failure
    Network,
    /// Invalid input, never retried
    Validation,
    /// Storage failure
    Persistence,
    /// Upstream cancellation
    Cancelled,
    /// Configuration errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Api => "api",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Persistence => "persistence",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the ranksync crate
#[derive(Error, Debug)]
pub enum Error {
    /// Points are low; a short wait lets them regenerate
    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        info: Option<RateLimitInfo>,
    },

    /// Hourly budget exhausted; only the reset window helps
    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        info: Option<RateLimitInfo>,
    },

    /// Upstream API error status
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        retryable: bool,
    },

    /// Transport failure reported without a reqwest error
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid input or plan
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// Storage-level invariant violations
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Upstream cancellation observed between pages or units
    #[error("Operation cancelled")]
    Cancelled,

    /// Activity exceeded its timeout or stopped heartbeating
    #[error("Activity '{activity}' timed out after {elapsed_ms}ms")]
    ActivityTimeout { activity: String, elapsed_ms: u64 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Whether the substrate may re-run the failed operation
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } | Self::QuotaExceeded { .. } => true,
            Self::Api { retryable, .. } => *retryable,
            Self::Network(_) => true,
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            Self::ActivityTimeout { .. } => true,
            Self::Io(_) => true,
            Self::Validation(_)
            | Self::Database(_)
            | Self::Persistence(_)
            | Self::Cancelled
            | Self::Json(_)
            | Self::Config(_)
            | Self::Other { .. } => false,
        }
    }

    /// Whether this error belongs to the rate-limit family
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::QuotaExceeded { .. })
    }

    /// Rate limit snapshot attached to the error, if any
    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        match self {
            Self::RateLimit { info, .. } | Self::QuotaExceeded { info, .. } => info.as_ref(),
            _ => None,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimit { .. } => ErrorCategory::RateLimit,
            Self::QuotaExceeded { .. } => ErrorCategory::QuotaExceeded,
            Self::Api { .. } => ErrorCategory::Api,
            Self::Network(_) | Self::Http(_) | Self::ActivityTimeout { .. } => {
                ErrorCategory::Network
            }
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Database(_) | Self::Persistence(_) | Self::Io(_) => ErrorCategory::Persistence,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Json(_) => ErrorCategory::Other,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limit(msg: impl Into<String>, info: Option<RateLimitInfo>) -> Self {
        Self::RateLimit {
            message: msg.into(),
            info,
        }
    }

    /// Create a quota exceeded error
    pub fn quota_exceeded(msg: impl Into<String>, info: Option<RateLimitInfo>) -> Self {
        Self::QuotaExceeded {
            message: msg.into(),
            info,
        }
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
