//! # Circuit Breaker Module
//!
//! Per-provider circuit breaker guarding upstream calls. Each provider in the
//! registry owns exactly one breaker for the lifetime of the process; the
//! dispatcher routes every call through [`CircuitBreaker::call`] and skips
//! providers whose breaker is open.
//!
//! ## States
//!
//! - **Closed**: normal operation. Counted failures accumulate; reaching the
//!   failure threshold opens the circuit.
//! - **Open**: calls are rejected without touching the adapter. After the
//!   recovery timeout the next arriving call is admitted as a probe.
//! - **Half-open**: up to `half_open_max_calls` concurrent probes are
//!   admitted. The first success closes the circuit; a failure reopens it
//!   with a fresh recovery window.
//!
//! ## Counted vs. ignored failures
//!
//! Only error kinds listed in [`CircuitBreakerConfig::expected_error_kinds`]
//! move the failure counter. The default set treats content-policy blocks and
//! malformed payloads as user problems rather than provider health signals.
//! An **empty** set means every kind counts, so novel errors are never
//! silently swallowed. An uncounted failure during a recovery probe releases
//! its probe slot and leaves the circuit half-open, so the next call can
//! probe again.
//!
//! ## Cross-worker state
//!
//! Every transition is reported to an optional [`StateChangeListener`]. The
//! sync layer installs a listener that broadcasts [`CircuitSnapshot`]s to
//! sibling workers; snapshots arriving from other workers are applied through
//! [`CircuitBreaker::apply_remote`], which overwrites local state without
//! re-emitting (no feedback loops) and is idempotent under redelivery and
//! reordering.
//!
//! ## Usage
//!
//! ```rust
//! use llm_dispatch::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("primary".to_string(), CircuitBreakerConfig::default());
//!
//! let result = breaker.call(|| async {
//!     provider.complete(&request, deadline).await
//! }).await;
//! ```

use crate::error::{ErrorKind, ProviderError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors produced by the breaker gate.
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// The circuit is open (or the half-open probe budget is exhausted);
    /// the adapter was not invoked.
    #[error("circuit breaker is open")]
    Open,
    /// The admitted operation failed; the failure has already been recorded.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Circuit breaker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests admitted
    Closed,
    /// Failure threshold reached, requests rejected
    Open,
    /// Recovery probing, limited requests admitted
    HalfOpen,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a recovery probe
    #[serde(with = "crate::common::duration_serde")]
    pub recovery_timeout: Duration,
    /// Maximum concurrent probe calls while half-open
    pub half_open_max_calls: u32,
    /// Error kinds that count toward opening the circuit.
    ///
    /// Empty means every kind counts.
    pub expected_error_kinds: Vec<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            expected_error_kinds: vec![
                ErrorKind::Auth,
                ErrorKind::RateLimit,
                ErrorKind::Timeout,
                ErrorKind::Network,
                ErrorKind::BadRequest,
                ErrorKind::Upstream5xx,
                ErrorKind::Unknown,
            ],
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate threshold and probe-budget constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.half_open_max_calls == 0 {
            return Err("half_open_max_calls must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Serializable point-in-time view of a breaker.
///
/// The unit of cross-worker exchange: local transitions publish one, and
/// [`CircuitBreaker::apply_remote`] consumes one. Timestamps are epoch
/// milliseconds so snapshots compare across hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive counted failures
    #[serde(rename = "failures")]
    pub consecutive_failures: u32,
    /// Successes recorded since the circuit last closed
    #[serde(default)]
    pub successes_since_close: u32,
    /// When the circuit opened, if it is open
    pub opened_at: Option<i64>,
    /// When the last counted failure was recorded
    #[serde(default)]
    pub last_failure_at: Option<i64>,
    /// Probe calls currently in flight while half-open
    #[serde(default)]
    pub half_open_in_flight: u32,
    /// When this snapshot's state last changed
    #[serde(default)]
    pub updated_at: i64,
}

/// Kinds of breaker transitions reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitEventKind {
    /// The circuit opened
    Opened,
    /// The circuit closed
    Closed,
    /// The circuit admitted a recovery probe
    HalfOpen,
    /// A counted failure below the threshold
    Failure,
    /// A success that cleared accumulated failures
    Success,
}

/// A breaker transition, delivered synchronously to the installed listener.
#[derive(Debug, Clone)]
pub struct CircuitEvent {
    pub kind: CircuitEventKind,
    pub provider: String,
    pub snapshot: CircuitSnapshot,
}

/// Observer for breaker transitions.
///
/// Implementations must not block: `on_event` runs while the breaker's state
/// lock is held, so it should do no more than enqueue.
pub trait StateChangeListener: Send + Sync {
    fn on_event(&self, event: &CircuitEvent);
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    successes_since_close: u32,
    opened_at: Option<i64>,
    last_failure_at: Option<i64>,
    half_open_in_flight: u32,
    updated_at: i64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            successes_since_close: 0,
            opened_at: None,
            last_failure_at: None,
            half_open_in_flight: 0,
            // Zero until the first transition, so stored sync records always
            // hydrate a fresh breaker.
            updated_at: 0,
        }
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            successes_since_close: self.successes_since_close,
            opened_at: self.opened_at,
            last_failure_at: self.last_failure_at,
            half_open_in_flight: self.half_open_in_flight,
            updated_at: self.updated_at,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-provider circuit breaker.
///
/// All transitions are serialized by one internal mutex; the lock is held
/// only for counter updates and listener enqueues, never across an upstream
/// call.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    listener: std::sync::RwLock<Option<Arc<dyn StateChangeListener>>>,
}

impl CircuitBreaker {
    /// Create a breaker for one provider.
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(BreakerState::new()),
            listener: std::sync::RwLock::new(None),
        }
    }

    /// Provider name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the transition listener. At most one listener is active; the
    /// sync manager installs its own at registration time.
    pub fn set_listener(&self, listener: Arc<dyn StateChangeListener>) {
        let mut slot = self
            .listener
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(listener);
    }

    fn emit(&self, kind: CircuitEventKind, state: &BreakerState) {
        let listener = {
            let slot = self
                .listener
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.clone()
        };
        if let Some(listener) = listener {
            listener.on_event(&CircuitEvent {
                kind,
                provider: self.name.clone(),
                snapshot: state.snapshot(),
            });
        }
    }

    /// Execute an operation under the breaker gate.
    ///
    /// Open circuits reject without invoking the operation. Admitted
    /// operations have their outcome recorded automatically: successes reset
    /// the failure counter (and close a half-open circuit), counted failures
    /// advance it.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        if !self.try_acquire().await {
            tracing::debug!(breaker = %self.name, "circuit open, rejecting call");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(err.kind).await;
                Err(CircuitBreakerError::Provider(err))
            }
        }
    }

    /// Gate decision: may a call proceed right now?
    ///
    /// Transitions Open → HalfOpen when the recovery timeout has elapsed and
    /// reserves a probe slot for the admitted call.
    async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(opened_at) = state.opened_at else {
                    return false;
                };
                let elapsed = now_ms().saturating_sub(opened_at);
                if elapsed >= self.config.recovery_timeout.as_millis() as i64 {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_in_flight = 1;
                    state.updated_at = now_ms();
                    tracing::info!(breaker = %self.name, "transitioning to HALF_OPEN");
                    self.emit(CircuitEventKind::HalfOpen, &state);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight < self.config.half_open_max_calls {
                    state.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// Public so adapters that run their operation outside [`call`] can
    /// report outcomes.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::Closed => {
                state.successes_since_close += 1;
                if state.consecutive_failures > 0 {
                    state.consecutive_failures = 0;
                    state.updated_at = now_ms();
                    self.emit(CircuitEventKind::Success, &state);
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.successes_since_close = 1;
                state.half_open_in_flight = 0;
                state.opened_at = None;
                state.updated_at = now_ms();
                tracing::info!(breaker = %self.name, "recovery probe succeeded, transitioning to CLOSED");
                self.emit(CircuitEventKind::Closed, &state);
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
                state.successes_since_close += 1;
            }
        }
    }

    /// Record a failed call of the given kind.
    ///
    /// Kinds outside the configured expected set leave all counters
    /// untouched, except that a half-open probe slot reserved for the call
    /// is always released; a content-level failure must not wedge the
    /// recovery window.
    pub async fn record_failure(&self, kind: ErrorKind) {
        let mut state = self.state.lock().await;

        if !self.counts(kind) {
            if state.state == CircuitState::HalfOpen {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }
            tracing::debug!(breaker = %self.name, %kind, "failure kind not counted");
            return;
        }

        let now = now_ms();
        state.last_failure_at = Some(now);

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                state.updated_at = now;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        "failure threshold reached, transitioning to OPEN"
                    );
                    self.emit(CircuitEventKind::Opened, &state);
                } else {
                    self.emit(CircuitEventKind::Failure, &state);
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.consecutive_failures += 1;
                state.half_open_in_flight = 0;
                state.opened_at = Some(now);
                state.updated_at = now;
                tracing::warn!(breaker = %self.name, "recovery probe failed, transitioning back to OPEN");
                self.emit(CircuitEventKind::Opened, &state);
            }
            CircuitState::Open => {
                // Late completion of a call admitted earlier; the recovery
                // window is not extended.
            }
        }
    }

    fn counts(&self, kind: ErrorKind) -> bool {
        self.config.expected_error_kinds.is_empty()
            || self.config.expected_error_kinds.contains(&kind)
    }

    /// Overwrite local state with a snapshot from another worker.
    ///
    /// Does not notify the listener, so remotely-applied transitions are not
    /// re-broadcast. Applying the same snapshot any number of times yields
    /// the same state.
    pub async fn apply_remote(&self, snapshot: &CircuitSnapshot) {
        let mut state = self.state.lock().await;
        state.state = snapshot.state;
        state.consecutive_failures = snapshot.consecutive_failures;
        state.successes_since_close = snapshot.successes_since_close;
        state.opened_at = snapshot.opened_at;
        state.last_failure_at = snapshot.last_failure_at;
        state.half_open_in_flight = snapshot.half_open_in_flight;
        state.updated_at = snapshot.updated_at;
        tracing::debug!(breaker = %self.name, state = ?snapshot.state, "applied remote state");
    }

    /// Current state.
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Point-in-time snapshot of all counters.
    pub async fn snapshot(&self) -> CircuitSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Force the breaker closed and clear all counters.
    ///
    /// Emits a `Closed` event so sibling workers converge too.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.successes_since_close = 0;
        state.opened_at = None;
        state.last_failure_at = None;
        state.half_open_in_flight = 0;
        state.updated_at = now_ms();
        tracing::info!(breaker = %self.name, "manually reset to CLOSED");
        self.emit(CircuitEventKind::Closed, &state);
    }
}
