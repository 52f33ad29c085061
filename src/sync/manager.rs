//! The sync manager wires local circuit breakers to a [`SyncBackend`]: it
//! owns the worker identity, forwards local transitions to the backend, and
//! routes incoming remote events to the right breaker.

use crate::circuit_breaker::{CircuitBreaker, CircuitEvent, StateChangeListener};
use crate::sync::{StateRecord, SyncBackend, SyncError, SyncEvent, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identity of one worker process.
///
/// Unique per process: a random token plus the pid and startup nanos. The
/// token stands in for a hostname so the core stays free of environment
/// lookups; deployments that want host-qualified ids can supply their own
/// via `From<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn generate() -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self(format!("{}-{}-{}", &token[..8], std::process::id(), nanos))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Breaker listener that forwards transitions into the manager's channel.
///
/// `on_event` runs while the breaker lock is held, so it only enqueues.
struct ChannelListener {
    tx: mpsc::UnboundedSender<CircuitEvent>,
}

impl StateChangeListener for ChannelListener {
    fn on_event(&self, event: &CircuitEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Wires registered breakers to the sync backend.
///
/// Lifecycle: [`register`](SyncManager::register) every breaker during
/// configuration, [`start`](SyncManager::start) once, and
/// [`close`](SyncManager::close) on shutdown.
pub struct SyncManager {
    backend: Arc<dyn SyncBackend>,
    worker_id: WorkerId,
    breakers: Arc<std::sync::RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    event_tx: mpsc::UnboundedSender<CircuitEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<CircuitEvent>>>,
    state_ttl: Duration,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SyncManager {
    pub fn new(backend: Arc<dyn SyncBackend>, worker_id: WorkerId) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            worker_id,
            breakers: Arc::new(std::sync::RwLock::new(HashMap::new())),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            state_ttl: crate::sync::DEFAULT_STATE_TTL,
            tasks: std::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Whether the sync backend is currently reachable.
    pub async fn backend_healthy(&self) -> bool {
        self.backend.health().await
    }

    /// Track a breaker and install the listener that feeds its transitions
    /// into the publish loop. Call before [`start`](SyncManager::start).
    pub fn register(&self, breaker: Arc<CircuitBreaker>) {
        breaker.set_listener(Arc::new(ChannelListener {
            tx: self.event_tx.clone(),
        }));
        self.breakers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(breaker.name().to_string(), breaker);
    }

    /// Hydrate breakers from stored state, then spawn the publisher and
    /// subscription-router loops.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.hydrate().await;

        let rx = self
            .event_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or_else(|| SyncError::backend("sync manager already started"))?;

        let publisher = self.spawn_publisher(rx);
        let router = self.spawn_router().await?;

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.push(publisher);
        tasks.push(router);
        Ok(())
    }

    /// Apply stored state records that are newer than local state and came
    /// from another worker.
    async fn hydrate(&self) {
        let breakers: Vec<(String, Arc<CircuitBreaker>)> = {
            let guard = self
                .breakers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (name, breaker) in breakers {
            match self.backend.get_state(&name).await {
                Ok(Some(record)) => {
                    if record.worker_id == self.worker_id.as_str() {
                        continue;
                    }
                    let local = breaker.snapshot().await;
                    if record.payload.updated_at > local.updated_at {
                        tracing::info!(
                            breaker = %name,
                            state = ?record.payload.state,
                            "hydrating breaker from stored sync state"
                        );
                        breaker.apply_remote(&record.payload).await;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(breaker = %name, error = %err, "failed to read stored sync state");
                }
            }
        }
    }

    fn spawn_publisher(&self, mut rx: mpsc::UnboundedReceiver<CircuitEvent>) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let worker_id = self.worker_id.clone();
        let ttl = self.state_ttl;

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let sync_event = SyncEvent {
                    v: SCHEMA_VERSION,
                    kind: event.kind,
                    provider: event.provider.clone(),
                    worker_id: worker_id.as_str().to_string(),
                    ts: chrono::Utc::now().timestamp_millis(),
                    payload: event.snapshot.clone(),
                };

                // Publish failures delay convergence only; local state is
                // already correct.
                if let Err(err) = backend.publish(&sync_event).await {
                    tracing::warn!(provider = %event.provider, error = %err, "failed to publish sync event");
                }

                let record = StateRecord {
                    worker_id: worker_id.as_str().to_string(),
                    payload: event.snapshot,
                };
                if let Err(err) = backend.set_state(&event.provider, &record, ttl).await {
                    tracing::warn!(provider = %event.provider, error = %err, "failed to store sync state");
                }
            }
        })
    }

    async fn spawn_router(&self) -> Result<JoinHandle<()>, SyncError> {
        let mut rx = self.backend.subscribe().await?;
        let breakers = self.breakers.clone();
        let worker_id = self.worker_id.clone();

        Ok(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.v != SCHEMA_VERSION {
                    tracing::warn!(version = event.v, "skipping sync event with unknown schema");
                    continue;
                }
                if event.worker_id == worker_id.as_str() {
                    continue;
                }

                let breaker = {
                    let guard = breakers
                        .read()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    guard.get(&event.provider).cloned()
                };
                match breaker {
                    Some(breaker) => {
                        tracing::debug!(
                            provider = %event.provider,
                            from_worker = %event.worker_id,
                            state = ?event.payload.state,
                            "applying remote breaker state"
                        );
                        breaker.apply_remote(&event.payload).await;
                    }
                    None => {
                        tracing::debug!(provider = %event.provider, "sync event for unknown provider");
                    }
                }
            }
        }))
    }

    /// Stop the loops and release backend resources. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = {
            let mut guard = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
        self.backend.close().await;
    }
}
