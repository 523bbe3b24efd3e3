use std::time::Duration;
use thiserror::Error;

use crate::config::RetryConfig;

/// Failure reported by a backend for a single generation attempt.
///
/// The transient/permanent split drives retry behavior in the step executor:
/// transient failures are retried with backoff, permanent failures surface
/// immediately as a failed step.
#[derive(Debug, Clone)]
pub enum BackendError {
    Timeout { duration_ms: u64 },
    RateLimited { retry_after_secs: Option<u64> },
    Network(String),
    /// Backend rejected the input (malformed prompt, unsupported model).
    Rejected(String),
    Unavailable(String),
    Other(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Network(_) | Self::Unavailable(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Short stable label used in audit payloads.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Network(_) => "network",
            Self::Rejected(_) => "rejected",
            Self::Unavailable(_) => "unavailable",
            Self::Other(_) => "other",
        }
    }

    /// Minimum delay before the next attempt, before exponential scaling.
    pub fn suggested_delay(&self, config: &RetryConfig) -> Duration {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs),
            _ => Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { duration_ms } => write!(f, "timeout after {}ms", duration_ms),
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => write!(f, "rate limited, retry after {}s", secs),
            Self::RateLimited { .. } => write!(f, "rate limited"),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Rejected(msg) => write!(f, "input rejected: {}", msg),
            Self::Unavailable(msg) => write!(f, "backend unavailable: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

#[derive(Error, Debug)]
pub enum ParallaxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown specialist: {0}")]
    UnknownSpecialist(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("No specialist matched objective: {0}")]
    NoSpecialistMatch(String),

    #[error("Invalid path state transition: {from} -> {to}")]
    InvalidPathTransition { from: String, to: String },

    #[error("Memory store error: {0}")]
    MemoryStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ParallaxError>;
