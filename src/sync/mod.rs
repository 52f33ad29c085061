//! # Cross-Worker State Synchronization
//!
//! A deployment typically runs several worker processes behind a load
//! balancer. Without coordination, each worker has to rediscover a failing
//! provider on its own, paying the full failure threshold again. This module
//! keeps circuit-breaker state consistent across workers through a small
//! backend abstraction:
//!
//! - **events**: every local breaker transition is published (fire and
//!   forget) on one channel; sibling workers apply incoming snapshots to
//!   their own breakers.
//! - **state records**: the latest snapshot per provider is written to a
//!   key/value store with a TTL, so a freshly started worker can hydrate
//!   breaker state instead of starting cold.
//!
//! Two backends satisfy [`SyncBackend`]: the distributed
//! [`redis::RedisSyncBackend`] and the in-process
//! [`memory::InMemorySyncBackend`], which is used when sync is disabled or
//! the distributed backend is unreachable at startup.
//!
//! Losing the backend never affects local correctness: publishes are logged
//! and dropped, and the subscriber reconnects with backoff indefinitely.
//! Convergence is delayed, not broken.
//!
//! ## Wire format
//!
//! Events are self-describing JSON with a schema version:
//!
//! ```json
//! {
//!   "v": 1,
//!   "kind": "opened",
//!   "provider": "openai-primary",
//!   "worker_id": "a1b2c3d4-41-1712345678901234",
//!   "ts": 1712345678901,
//!   "payload": {
//!     "state": "OPEN",
//!     "failures": 5,
//!     "opened_at": 1712345678901
//!   }
//! }
//! ```

use crate::circuit_breaker::{CircuitEventKind, CircuitSnapshot};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod manager;
pub mod memory;
pub mod redis;

pub use manager::{SyncManager, WorkerId};
pub use memory::InMemorySyncBackend;
pub use redis::RedisSyncBackend;

/// Current event schema version.
pub const SCHEMA_VERSION: u8 = 1;

/// How long a state record lives in the backend without being refreshed.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(3600);

/// Synchronization-layer failures.
///
/// These are logged and tolerated at runtime; they only surface to callers
/// during client setup.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync backend error: {message}")]
    Backend { message: String },
    #[error("sync serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl SyncError {
    pub fn backend(message: impl Into<String>) -> Self {
        SyncError::Backend {
            message: message.into(),
        }
    }
}

/// One breaker transition broadcast to sibling workers.
///
/// Events are append-only and unacknowledged; the payload carries the full
/// snapshot so applying one is idempotent under redelivery and reordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Schema version, always [`SCHEMA_VERSION`]
    pub v: u8,
    /// Which transition happened
    pub kind: CircuitEventKind,
    /// Provider whose breaker transitioned
    pub provider: String,
    /// Worker that observed the transition
    pub worker_id: String,
    /// Epoch milliseconds when the event was emitted
    pub ts: i64,
    /// Full breaker snapshot after the transition
    pub payload: CircuitSnapshot,
}

/// Latest known breaker state for one provider, as stored in the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// Worker that last wrote the record
    pub worker_id: String,
    /// Breaker snapshot at write time
    pub payload: CircuitSnapshot,
}

/// Durable key/value + pub/sub transport for breaker state.
///
/// Subscribers receive every published event, including their own worker's;
/// own-event filtering happens in the [`SyncManager`], which knows the local
/// worker id.
#[async_trait::async_trait]
pub trait SyncBackend: Send + Sync {
    /// Fire-and-forget broadcast of one event.
    async fn publish(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Open the event stream. May be called once per manager.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SyncEvent>, SyncError>;

    /// Read the stored state record for a provider, if any.
    async fn get_state(&self, provider: &str) -> Result<Option<StateRecord>, SyncError>;

    /// Overwrite the stored state record for a provider; the TTL restarts on
    /// every write.
    async fn set_state(
        &self,
        provider: &str,
        record: &StateRecord,
        ttl: Duration,
    ) -> Result<(), SyncError>;

    /// Backend reachability.
    async fn health(&self) -> bool;

    /// Drain subscriptions and release connections. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;

    fn open_snapshot() -> CircuitSnapshot {
        CircuitSnapshot {
            state: CircuitState::Open,
            consecutive_failures: 5,
            successes_since_close: 0,
            opened_at: Some(1_712_345_678_901),
            last_failure_at: Some(1_712_345_678_901),
            half_open_in_flight: 0,
            updated_at: 1_712_345_678_901,
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let event = SyncEvent {
            v: SCHEMA_VERSION,
            kind: CircuitEventKind::Opened,
            provider: "openai-primary".to_string(),
            worker_id: "worker-1".to_string(),
            ts: 1_712_345_678_901,
            payload: open_snapshot(),
        };

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["kind"], "opened");
        assert_eq!(json["payload"]["state"], "OPEN");
        assert_eq!(json["payload"]["failures"], 5);
        // Nulls are explicit on the wire.
        let closed = SyncEvent {
            payload: CircuitSnapshot {
                state: CircuitState::Closed,
                opened_at: None,
                ..open_snapshot()
            },
            ..event
        };
        let json = serde_json::to_value(&closed).unwrap();
        assert!(json["payload"]["opened_at"].is_null());
    }

    #[test]
    fn test_event_round_trip() {
        let event = SyncEvent {
            v: SCHEMA_VERSION,
            kind: CircuitEventKind::HalfOpen,
            provider: "fallback".to_string(),
            worker_id: "worker-2".to_string(),
            ts: 42,
            payload: open_snapshot(),
        };

        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"half_open\""));
        let decoded: SyncEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.provider, "fallback");
        assert_eq!(decoded.payload, event.payload);
    }

    #[test]
    fn test_state_record_round_trip() {
        let record = StateRecord {
            worker_id: "worker-3".to_string(),
            payload: open_snapshot(),
        };
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: StateRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.worker_id, "worker-3");
        assert_eq!(decoded.payload.consecutive_failures, 5);
    }
}
