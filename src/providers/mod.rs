//! # Provider Adapters
//!
//! This module defines the adapter abstraction over the upstream AI services
//! and the factory that turns a [`ProviderConfig`] into a concrete adapter.
//!
//! ## Supported kinds
//!
//! Adapter kinds are a closed enum: adding a provider family means adding a
//! [`ProviderKind`] variant and a factory arm, not runtime registration.
//!
//! - [`ProviderKind::OpenAi`]: OpenAI-compatible `/chat/completions` APIs
//!   (OpenAI itself and the many services that mirror its wire format)
//! - [`ProviderKind::Anthropic`]: Anthropic-style `/v1/messages` APIs
//! - [`ProviderKind::Vertex`]: Google Gemini / Vertex-style
//!   `:generateContent` APIs
//!
//! ## Contract
//!
//! Each adapter executes exactly one upstream call per [`Provider::complete`]
//! invocation, with one exception: rate-limit and upstream-5xx responses may
//! be retried internally with bounded exponential backoff while the deadline
//! allows. Internal retries are invisible to the dispatcher.
//!
//! Every failure an adapter returns is classified into an
//! [`ErrorKind`](crate::error::ErrorKind) through the explicit tables in
//! [`http_client`]; unmapped errors become `Unknown`.
//!
//! ## Usage
//!
//! ```rust
//! use llm_dispatch::providers::{create_provider, ProviderConfig, ProviderKind};
//!
//! let config = ProviderConfig::new("primary", ProviderKind::OpenAi, "sk-key")
//!     .with_priority(1)
//!     .with_default_model("gpt-4o-mini");
//! let provider = create_provider(&config)?;
//! ```

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod anthropic;
pub mod http_client;
pub mod openai;
pub mod vertex;

/// How long a health probe result stays valid.
pub(crate) const HEALTH_PROBE_TTL: Duration = Duration::from_secs(60);

/// Supported provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat-completions API
    OpenAi,
    /// Anthropic-compatible messages API
    Anthropic,
    /// Google Gemini / Vertex-compatible generateContent API
    Vertex,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => f.write_str("openai"),
            ProviderKind::Anthropic => f.write_str("anthropic"),
            ProviderKind::Vertex => f.write_str("vertex"),
        }
    }
}

/// Static description of an adapter instance.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescription {
    /// Configured provider name (unique within a process)
    pub name: String,
    /// Provider family
    pub kind: ProviderKind,
    /// Models this adapter recognizes out of the box
    pub supported_models: Vec<String>,
    /// Version of the adapter implementation
    pub adapter_version: String,
}

/// Internal retry policy for rate-limit and upstream-5xx responses.
///
/// Retries use exponential backoff with jitter and never outlive the
/// per-attempt deadline handed down by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum internal retry attempts after the initial call
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "crate::common::duration_serde")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "crate::common::duration_serde")]
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_multiplier: f64,
    /// Fraction of the delay added as random jitter
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Configuration for one provider adapter.
///
/// Credentials and endpoints only ever arrive through this struct; the core
/// reads no environment variables.
///
/// # Example
///
/// ```rust
/// let config = ProviderConfig::new("fallback", ProviderKind::Anthropic, "key")
///     .with_priority(2)
///     .with_timeout(Duration::from_secs(20))
///     .with_model_mapping("default", "claude-3-5-haiku-latest");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name, unique within a process
    pub name: String,
    /// Provider family, selects the adapter implementation
    pub kind: ProviderKind,
    /// Dispatch priority; lower values are tried first, ties broken by
    /// registration order
    pub priority: u32,
    /// Model used when a request does not name one
    pub default_model: String,
    /// API key or token for the upstream service
    pub api_key: String,
    /// Optional base URL override for self-hosted or proxied endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Model name mappings (neutral name → provider name)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_mapping: HashMap<String, String>,
    /// Extra HTTP headers sent with every request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Per-call timeout for this provider
    #[serde(with = "crate::common::duration_serde")]
    pub timeout: Duration,
    /// Internal retry policy for transient upstream responses
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Breaker configuration override; the client default applies when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl ProviderConfig {
    /// Create a configuration with defaults: priority 1, 30 s timeout.
    pub fn new(name: impl Into<String>, kind: ProviderKind, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: 1,
            default_model: String::new(),
            api_key: api_key.into(),
            base_url: None,
            model_mapping: HashMap::new(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            circuit_breaker: None,
        }
    }

    /// Set the dispatch priority (≥ 1, lower is tried first).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the model used when the request does not name one.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Override the provider base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Map a neutral model name to this provider's model name.
    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    /// Add a custom HTTP header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Override this provider's circuit breaker configuration.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Check structural constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("provider name must not be empty".to_string());
        }
        if self.priority == 0 {
            return Err(format!(
                "provider '{}': priority must be at least 1",
                self.name
            ));
        }
        if let Some(cb) = &self.circuit_breaker {
            cb.validate()
                .map_err(|e| format!("provider '{}': {e}", self.name))?;
        }
        Ok(())
    }

    /// Resolve the model to send upstream for a request.
    pub(crate) fn resolve_model(&self, requested: &str) -> String {
        if let Some(mapped) = self.model_mapping.get(requested) {
            return mapped.clone();
        }
        if requested.is_empty() {
            return self.default_model.clone();
        }
        requested.to_string()
    }
}

/// One upstream chat-completion service.
///
/// Implementations are stateless beyond their HTTP client and health cache;
/// a single instance serves concurrent calls.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Static description: name, kind, recognized models, adapter version.
    fn describe(&self) -> ProviderDescription;

    /// Cheap credential shape check; performs no I/O.
    fn validate_credentials(&self) -> bool;

    /// Execute one chat completion against the upstream service.
    ///
    /// `deadline` bounds the whole call including internal retries.
    async fn complete(
        &self,
        request: &ChatRequest,
        deadline: Duration,
    ) -> Result<ChatResponse, ProviderError>;

    /// Lightweight reachability probe for operators.
    ///
    /// Results are cached for up to 60 seconds.
    async fn health_probe(&self) -> bool;
}

/// Time-bounded cache for health probe results.
pub(crate) struct HealthCache {
    inner: tokio::sync::RwLock<Option<(Instant, bool)>>,
}

impl HealthCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: tokio::sync::RwLock::new(None),
        }
    }

    pub(crate) async fn cached(&self) -> Option<bool> {
        let guard = self.inner.read().await;
        guard.and_then(|(at, healthy)| (at.elapsed() < HEALTH_PROBE_TTL).then_some(healthy))
    }

    pub(crate) async fn store(&self, healthy: bool) {
        let mut guard = self.inner.write().await;
        *guard = Some((Instant::now(), healthy));
    }
}

/// Construct the adapter for a provider configuration.
///
/// The kind → constructor mapping is the only place adapter implementations
/// are named; new kinds extend this match.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    match config.kind {
        ProviderKind::OpenAi => Ok(Arc::new(openai::OpenAiProvider::new(config.clone())?)),
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicProvider::new(config.clone())?)),
        ProviderKind::Vertex => Ok(Arc::new(vertex::VertexProvider::new(config.clone())?)),
    }
}
