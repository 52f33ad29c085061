//! # Error Taxonomy
//!
//! Every failure an adapter can surface is classified into a closed
//! [`ErrorKind`] set. The kind drives all downstream handling: whether the
//! circuit breaker counts the failure, whether the dispatcher fails over to
//! the next provider, and how the aggregate [`ClientError::AllProvidersFailed`]
//! report reads.
//!
//! ## Classification
//!
//! | Kind           | Breaker counts it (default) | Dispatcher behavior        |
//! |----------------|-----------------------------|----------------------------|
//! | `Auth`         | yes                         | skip to next provider      |
//! | `RateLimit`    | yes                         | fail over                  |
//! | `Timeout`      | yes                         | fail over                  |
//! | `Network`      | yes                         | fail over                  |
//! | `SafetyBlock`  | no (content, not health)    | skip to next provider      |
//! | `BadRequest`   | yes                         | skip to next provider      |
//! | `Upstream5xx`  | yes                         | fail over                  |
//! | `Malformed`    | no (shape, not health)      | skip to next provider      |
//! | `Unknown`      | yes                         | fail over                  |
//!
//! Adapters map native errors through explicit tables; anything unmapped
//! becomes [`ErrorKind::Unknown`] and is logged.

use crate::models::ValidationError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed classification of provider failures.
///
/// Part of the public API; serialized in SCREAMING_SNAKE_CASE on diagnostic
/// surfaces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Invalid or rejected credentials
    Auth,
    /// Provider rate limit exceeded
    RateLimit,
    /// Request or connection deadline elapsed
    Timeout,
    /// Connectivity failure before a response arrived
    Network,
    /// The provider refused to produce content on policy grounds
    SafetyBlock,
    /// The provider rejected the request shape or parameters
    BadRequest,
    /// Provider-side 5xx failure
    #[serde(rename = "UPSTREAM_5XX")]
    Upstream5xx,
    /// Response or input could not be parsed into the expected shape
    Malformed,
    /// Anything the mapping tables do not cover
    Unknown,
}

impl ErrorKind {
    /// Whether the dispatcher should keep trying further providers after
    /// seeing this kind. Non-retryable kinds still cause a skip to the next
    /// provider, but are reported as permanent for that attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::Upstream5xx
                | ErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Auth => "AUTH",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Network => "NETWORK",
            ErrorKind::SafetyBlock => "SAFETY_BLOCK",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::Upstream5xx => "UPSTREAM_5XX",
            ErrorKind::Malformed => "MALFORMED",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Classified provider failure.
///
/// Raised by adapters and consumed by the dispatcher; never surfaced to
/// callers directly, only inside [`ClientError::AllProvidersFailed`].
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    /// Classification driving breaker and failover behavior
    pub kind: ErrorKind,
    /// Free-form description
    pub message: String,
    /// Original provider error code, when one was present
    pub provider_code: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider_code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn safety_block(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SafetyBlock, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream5xx, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::timeout(err.to_string())
        } else if err.is_connect() {
            ProviderError::network(err.to_string())
        } else if err.is_decode() {
            ProviderError::malformed(err.to_string())
        } else {
            ProviderError::unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::malformed(err.to_string())
    }
}

/// Outcome of one per-provider attempt within a dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    /// The provider served the response
    Success,
    /// The breaker rejected the call without invoking the adapter
    RejectedOpen,
    /// Transient failure; later providers were still tried
    FailTransient,
    /// Permanent failure for this request (auth, request shape, content policy)
    FailPermanent,
}

/// Per-provider record of one attempt within a single dispatch.
///
/// Ephemeral diagnostics; collected into [`ClientError::AllProvidersFailed`]
/// and per-process counters, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// Provider the attempt targeted
    pub provider: String,
    /// Wall-clock duration of the attempt in milliseconds
    pub duration_ms: u64,
    /// How the attempt ended
    pub outcome: AttemptOutcome,
    /// Error classification, when the attempt failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Error message, when the attempt failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Errors surfaced at the client boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Request failed validation before any provider was touched
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Invalid or inconsistent client/provider configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Every candidate provider was either open or failed.
    ///
    /// One [`Attempt`] per registered provider, in priority order, so
    /// operators can tell "all circuits open" apart from "all upstreams
    /// failing".
    #[error("all providers failed ({} attempted)", .attempts.len())]
    AllProvidersFailed { attempts: Vec<Attempt> },

    /// Cross-worker synchronization failure during client setup or teardown
    #[error("sync error: {0}")]
    Sync(#[from] crate::sync::SyncError),
}

impl ClientError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ClientError::Configuration {
            message: message.into(),
        }
    }
}
