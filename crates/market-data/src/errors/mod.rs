//! Error types and retry classification for the market data crate.
//!
//! This module provides:
//! - [`MarketDataError`]: The main error enum for all market data operations
//! - [`RetryClass`]: Classification for determining retry behavior

mod retry;

pub use retry::RetryClass;

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during market data operations.
///
/// The enum is `Clone` because a single fetch outcome is handed to every
/// caller that joined a coalesced request. Each variant is classified into a
/// [`RetryClass`] via [`retry_class`](Self::retry_class), which the request
/// dispatcher consults before retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketDataError {
    /// The request to the provider timed out.
    #[error("Timeout: {provider}")]
    Timeout {
        /// The provider that timed out
        provider: String,
    },

    /// The provider answered with a 5xx status.
    #[error("Server error from {provider} ({status}): {message}")]
    ServerError {
        provider: String,
        status: u16,
        message: String,
    },

    /// The provider rate limited the request (HTTP 429).
    ///
    /// `retry_after` carries the provider's hint when it sent one.
    #[error("Rate limited: {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    /// Transport-level failure (connection reset, DNS, TLS).
    #[error("Network error from {provider}: {message}")]
    Network { provider: String, message: String },

    /// The request itself is malformed; retrying won't help.
    #[error("Invalid request to {provider}: {message}")]
    InvalidRequest { provider: String, message: String },

    /// The provider answered with a non-retryable 4xx status.
    #[error("Client error from {provider} ({status}): {message}")]
    ClientError {
        provider: String,
        status: u16,
        message: String,
    },

    /// The requested token is unknown to the provider.
    #[error("Token not found: {0}")]
    NotFound(String),

    /// A batched fetch completed but did not return this key.
    #[error("Unresolved key in batch fetch: {key}")]
    Unresolved { key: String },

    /// The dispatcher was shut down before the request settled.
    #[error("Request dispatcher closed")]
    DispatcherClosed,

    /// The task running a fetch panicked or was aborted.
    #[error("Fetch aborted: {0}")]
    FetchAborted(String),
}

impl MarketDataError {
    /// Returns the retry classification for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokenpulse_market_data::errors::{MarketDataError, RetryClass};
    ///
    /// let error = MarketDataError::RateLimited { provider: "DEXSCREENER".to_string(), retry_after: None };
    /// assert_eq!(error.retry_class(), RetryClass::WithBackoff);
    ///
    /// let error = MarketDataError::NotFound("INVALID".to_string());
    /// assert_eq!(error.retry_class(), RetryClass::Never);
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::Network { .. } => RetryClass::WithBackoff,

            Self::InvalidRequest { .. }
            | Self::ClientError { .. }
            | Self::NotFound(_)
            | Self::Unresolved { .. }
            | Self::DispatcherClosed
            | Self::FetchAborted(_) => RetryClass::Never,
        }
    }

    /// Whether this is a transient failure worth retrying.
    pub fn is_transient(&self) -> bool {
        self.retry_class() == RetryClass::WithBackoff
    }

    /// Backoff hint carried by an upstream rate-limit rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classifies an HTTP status code returned by a provider.
    ///
    /// Provider implementations call this so the dispatcher sees a uniform
    /// taxonomy regardless of the upstream API.
    pub fn from_status(provider: &str, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 => Self::Timeout {
                provider: provider.to_string(),
            },
            429 => Self::RateLimited {
                provider: provider.to_string(),
                retry_after: None,
            },
            404 => Self::NotFound(message),
            400 | 422 => Self::InvalidRequest {
                provider: provider.to_string(),
                message,
            },
            500..=599 => Self::ServerError {
                provider: provider.to_string(),
                status,
                message,
            },
            _ => Self::ClientError {
                provider: provider.to_string(),
                status,
                message,
            },
        }
    }
}
