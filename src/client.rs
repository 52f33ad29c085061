//! # Dispatch Client
//!
//! The client drives the failover loop: validate the request, walk the
//! registry in priority order, gate each candidate through its circuit
//! breaker, and return the first success, or an
//! [`AllProvidersFailed`](crate::error::ClientError::AllProvidersFailed)
//! report carrying one attempt record per candidate.
//!
//! ## Construction
//!
//! ```rust
//! use llm_dispatch::{DispatchClient, ProviderConfig, ProviderKind};
//!
//! let client = DispatchClient::builder()
//!     .with_provider(
//!         ProviderConfig::new("openai-primary", ProviderKind::OpenAi, "sk-key")
//!             .with_priority(1)
//!             .with_default_model("gpt-4o-mini"),
//!     )
//!     .with_provider(
//!         ProviderConfig::new("anthropic-fallback", ProviderKind::Anthropic, "key")
//!             .with_priority(2)
//!             .with_default_model("claude-3-5-haiku-latest"),
//!     )
//!     .with_redis_sync("redis://127.0.0.1:6379")
//!     .build()
//!     .await?;
//!
//! let response = client.dispatch(request).await?;
//! println!("{} answered: {}", response.provider, response.content);
//! ```
//!
//! ## Determinism
//!
//! Candidate order is stable: ascending priority with registration order as
//! the tiebreak. The dispatcher never reorders based on latency or recent
//! success; a provider is skipped only when its breaker is open.
//!
//! ## Deadlines
//!
//! Every dispatch carries an overall deadline (the builder default unless
//! [`dispatch_with_deadline`](DispatchClient::dispatch_with_deadline) is
//! used). Each attempt receives `min(remaining, provider.timeout)`. When the
//! overall deadline dies mid-dispatch the in-flight provider is recorded as
//! timed out and no further providers are tried.
//!
//! ## Concurrency
//!
//! `dispatch` is safe for any number of concurrent callers. The per-breaker
//! mutex and the stats lock are the only synchronization points; there is no
//! per-request queue and no global lock.

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use crate::error::{Attempt, AttemptOutcome, ClientError, ErrorKind};
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::{Provider, ProviderConfig};
use crate::registry::ProviderRegistry;
use crate::sync::{InMemorySyncBackend, RedisSyncBackend, SyncBackend, SyncManager, WorkerId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const DEFAULT_DISPATCH_DEADLINE: Duration = Duration::from_secs(60);
const DEFAULT_SYNC_PREFIX: &str = "llm_dispatch";

/// Per-provider dispatch counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    /// Attempts routed at this provider, including breaker rejections
    pub attempts: u64,
    /// Attempts that produced a response
    pub successes: u64,
    /// Attempts that failed in the adapter
    pub failures: u64,
    /// Total latency across measured attempts, in milliseconds
    pub total_latency_ms: u64,
}

/// Per-process dispatch counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Provider that served the most recent success
    pub last_used_provider: Option<String>,
    pub per_provider: HashMap<String, ProviderStats>,
}

/// Operator-facing view of one provider's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<i64>,
    /// True only when the breaker is fully closed; an open or still-probing
    /// circuit is not considered healthy.
    pub healthy: bool,
}

enum SyncChoice {
    InMemory,
    Redis { url: String },
    Custom(Arc<dyn SyncBackend>),
}

/// Builder for [`DispatchClient`].
///
/// Configuration is a startup-only phase; the built client is immutable
/// apart from breaker state and counters.
pub struct DispatchClientBuilder {
    providers: Vec<ProviderConfig>,
    custom_adapters: Vec<(ProviderConfig, Arc<dyn Provider>)>,
    breaker_defaults: CircuitBreakerConfig,
    sync: SyncChoice,
    sync_prefix: String,
    worker_id: Option<WorkerId>,
    default_deadline: Duration,
}

impl Default for DispatchClientBuilder {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            custom_adapters: Vec::new(),
            breaker_defaults: CircuitBreakerConfig::default(),
            sync: SyncChoice::InMemory,
            sync_prefix: DEFAULT_SYNC_PREFIX.to_string(),
            worker_id: None,
            default_deadline: DEFAULT_DISPATCH_DEADLINE,
        }
    }
}

impl DispatchClientBuilder {
    /// Add a provider built through the kind factory.
    pub fn with_provider(mut self, config: ProviderConfig) -> Self {
        self.providers.push(config);
        self
    }

    /// Add a provider with a caller-supplied adapter. The config still
    /// drives priority, timeout, and breaker construction.
    pub fn with_custom_provider(
        mut self,
        config: ProviderConfig,
        adapter: Arc<dyn Provider>,
    ) -> Self {
        self.custom_adapters.push((config, adapter));
        self
    }

    /// Breaker configuration applied to providers without their own.
    pub fn with_circuit_breaker_defaults(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_defaults = config;
        self
    }

    /// Synchronize breaker state across workers through redis.
    ///
    /// If redis is unreachable at startup the client falls back to the
    /// in-process backend and logs a warning.
    pub fn with_redis_sync(mut self, url: impl Into<String>) -> Self {
        self.sync = SyncChoice::Redis { url: url.into() };
        self
    }

    /// Use a caller-supplied sync backend.
    pub fn with_sync_backend(mut self, backend: Arc<dyn SyncBackend>) -> Self {
        self.sync = SyncChoice::Custom(backend);
        self
    }

    /// Key/channel prefix for the distributed backend.
    pub fn with_sync_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sync_prefix = prefix.into();
        self
    }

    /// Override the generated worker identity.
    pub fn with_worker_id(mut self, worker_id: impl Into<WorkerId>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Overall deadline applied when `dispatch` is called without one.
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    /// Validate configuration, construct adapters and breakers, and start
    /// the sync layer.
    pub async fn build(self) -> Result<DispatchClient, ClientError> {
        self.breaker_defaults
            .validate()
            .map_err(ClientError::configuration)?;

        let mut registry = ProviderRegistry::new(self.breaker_defaults);
        for config in self.providers {
            registry
                .register(config)
                .map_err(|e| ClientError::configuration(e.to_string()))?;
        }
        for (config, adapter) in self.custom_adapters {
            registry
                .register_with_adapter(config, adapter)
                .map_err(|e| ClientError::configuration(e.to_string()))?;
        }

        for entry in registry.list_by_priority() {
            if !entry.adapter.validate_credentials() {
                tracing::warn!(
                    provider = %entry.config.name,
                    "provider credentials failed the sanity check"
                );
            }
        }

        let backend: Arc<dyn SyncBackend> = match self.sync {
            SyncChoice::InMemory => Arc::new(InMemorySyncBackend::new()),
            SyncChoice::Custom(backend) => backend,
            SyncChoice::Redis { url } => {
                match RedisSyncBackend::connect(&url, self.sync_prefix.clone()).await {
                    Ok(backend) => Arc::new(backend),
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            "distributed sync backend unreachable, falling back to in-process sync"
                        );
                        Arc::new(InMemorySyncBackend::new())
                    }
                }
            }
        };

        let worker_id = self.worker_id.unwrap_or_else(WorkerId::generate);
        tracing::info!(worker_id = %worker_id, providers = registry.len(), "starting dispatch client");

        let sync = SyncManager::new(backend, worker_id);
        for entry in registry.list_by_priority() {
            sync.register(entry.breaker.clone());
        }
        sync.start().await?;

        Ok(DispatchClient {
            registry,
            stats: Arc::new(RwLock::new(DispatchStats::default())),
            sync: Arc::new(sync),
            default_deadline: self.default_deadline,
        })
    }
}

/// Resilient dispatcher over the registered providers.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct DispatchClient {
    registry: ProviderRegistry,
    stats: Arc<RwLock<DispatchStats>>,
    sync: Arc<SyncManager>,
    default_deadline: Duration,
}

impl DispatchClient {
    pub fn builder() -> DispatchClientBuilder {
        DispatchClientBuilder::default()
    }

    /// Dispatch with the builder's default deadline.
    pub async fn dispatch(&self, request: ChatRequest) -> Result<ChatResponse, ClientError> {
        self.dispatch_with_deadline(request, self.default_deadline)
            .await
    }

    /// Serve one request, failing over across providers in priority order.
    pub async fn dispatch_with_deadline(
        &self,
        request: ChatRequest,
        deadline: Duration,
    ) -> Result<ChatResponse, ClientError> {
        // Shape problems fail fast and touch no breaker.
        request.validate()?;

        let candidates = self.registry.list_by_priority();
        if candidates.is_empty() {
            tracing::warn!("dispatch with no registered providers");
            self.record_dispatch_failed().await;
            return Err(ClientError::AllProvidersFailed { attempts: vec![] });
        }

        let request_id = uuid::Uuid::new_v4();
        let dispatch_start = Instant::now();
        let mut attempts: Vec<Attempt> = Vec::with_capacity(candidates.len());

        let mut i = 0;
        while i < candidates.len() {
            let entry = &candidates[i];
            let remaining = deadline.saturating_sub(dispatch_start.elapsed());
            if remaining.is_zero() {
                // Overall deadline died; the rest of the order is recorded
                // but never invoked.
                for skipped in &candidates[i..] {
                    let attempt = Attempt {
                        provider: skipped.config.name.clone(),
                        duration_ms: 0,
                        outcome: AttemptOutcome::FailTransient,
                        error_kind: Some(ErrorKind::Timeout),
                        message: Some("deadline exhausted before provider was attempted".into()),
                    };
                    self.record_attempt(&skipped.config.name, &attempt).await;
                    attempts.push(attempt);
                }
                break;
            }
            i += 1;

            let attempt_budget = remaining.min(entry.config.timeout);
            let start = Instant::now();
            let outcome = entry
                .breaker
                .call(|| async {
                    match tokio::time::timeout(
                        attempt_budget,
                        entry.adapter.complete(&request, attempt_budget),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(crate::error::ProviderError::timeout(format!(
                            "no response within {} ms",
                            attempt_budget.as_millis()
                        ))),
                    }
                })
                .await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(mut response) => {
                    response.provider = entry.config.name.clone();
                    response.latency_ms = duration_ms;
                    tracing::debug!(
                        %request_id,
                        provider = %entry.config.name,
                        latency_ms = duration_ms,
                        "dispatch served"
                    );
                    self.record_dispatch_success(&entry.config.name, duration_ms)
                        .await;
                    return Ok(response);
                }
                Err(CircuitBreakerError::Open) => {
                    tracing::debug!(
                        %request_id,
                        provider = %entry.config.name,
                        "skipping provider with open circuit"
                    );
                    let attempt = Attempt {
                        provider: entry.config.name.clone(),
                        duration_ms,
                        outcome: AttemptOutcome::RejectedOpen,
                        error_kind: None,
                        message: None,
                    };
                    self.record_attempt(&entry.config.name, &attempt).await;
                    attempts.push(attempt);
                }
                Err(CircuitBreakerError::Provider(err)) => {
                    let outcome = if err.kind.is_retryable() {
                        AttemptOutcome::FailTransient
                    } else {
                        AttemptOutcome::FailPermanent
                    };
                    tracing::warn!(
                        %request_id,
                        provider = %entry.config.name,
                        kind = %err.kind,
                        error = %err.message,
                        "provider attempt failed, trying next"
                    );
                    let attempt = Attempt {
                        provider: entry.config.name.clone(),
                        duration_ms,
                        outcome,
                        error_kind: Some(err.kind),
                        message: Some(err.message),
                    };
                    self.record_attempt(&entry.config.name, &attempt).await;
                    attempts.push(attempt);
                }
            }
        }

        self.record_dispatch_failed().await;
        Err(ClientError::AllProvidersFailed { attempts })
    }

    /// Breaker state per registered provider.
    pub async fn provider_status(&self) -> HashMap<String, ProviderStatus> {
        let mut statuses = HashMap::new();
        for entry in self.registry.list_by_priority() {
            let snapshot = entry.breaker.snapshot().await;
            statuses.insert(
                entry.config.name.clone(),
                ProviderStatus {
                    state: snapshot.state,
                    failure_count: snapshot.consecutive_failures,
                    success_count: snapshot.successes_since_close,
                    last_failure_at: snapshot.last_failure_at,
                    healthy: snapshot.state == CircuitState::Closed,
                },
            );
        }
        statuses
    }

    /// Active upstream reachability per provider, via each adapter's cached
    /// health probe.
    pub async fn provider_health(&self) -> HashMap<String, bool> {
        let mut health = HashMap::new();
        for entry in self.registry.list_by_priority() {
            health.insert(
                entry.config.name.clone(),
                entry.adapter.health_probe().await,
            );
        }
        health
    }

    /// Per-process dispatch counters.
    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }

    /// Force one breaker (or all) back to closed.
    pub async fn reset_breakers(&self, name: Option<&str>) {
        self.registry.reset_breakers(name).await;
    }

    /// Identity this worker publishes sync events under.
    pub fn worker_id(&self) -> &WorkerId {
        self.sync.worker_id()
    }

    /// Whether the cross-worker sync backend is currently reachable. Local
    /// dispatching is unaffected either way.
    pub async fn sync_healthy(&self) -> bool {
        self.sync.backend_healthy().await
    }

    /// Stop the sync layer and release its resources. Idempotent.
    pub async fn close(&self) {
        self.sync.close().await;
    }

    fn entry_stats<'a>(
        stats: &'a mut DispatchStats,
        provider: &str,
    ) -> &'a mut ProviderStats {
        stats.per_provider.entry(provider.to_string()).or_default()
    }

    async fn record_attempt(&self, provider: &str, attempt: &Attempt) {
        let mut stats = self.stats.write().await;
        let provider_stats = Self::entry_stats(&mut stats, provider);
        provider_stats.attempts += 1;
        provider_stats.total_latency_ms += attempt.duration_ms;
        if matches!(
            attempt.outcome,
            AttemptOutcome::FailTransient | AttemptOutcome::FailPermanent
        ) {
            provider_stats.failures += 1;
        }
    }

    async fn record_dispatch_success(&self, provider: &str, latency_ms: u64) {
        let mut stats = self.stats.write().await;
        stats.total_requests += 1;
        stats.successful_requests += 1;
        stats.last_used_provider = Some(provider.to_string());
        let provider_stats = Self::entry_stats(&mut stats, provider);
        provider_stats.attempts += 1;
        provider_stats.successes += 1;
        provider_stats.total_latency_ms += latency_ms;
    }

    async fn record_dispatch_failed(&self) {
        let mut stats = self.stats.write().await;
        stats.total_requests += 1;
        stats.failed_requests += 1;
    }
}
