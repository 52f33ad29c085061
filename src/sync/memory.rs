//! In-process sync backend: a mutex-guarded state map plus a local fan-out of
//! event subscribers. Stands in for the distributed backend when sync is
//! disabled or the distributed backend is unreachable at startup; also the
//! workhorse for tests.

use crate::sync::{StateRecord, SyncBackend, SyncError, SyncEvent};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

#[derive(Default)]
pub struct InMemorySyncBackend {
    states: Mutex<HashMap<String, (StateRecord, Instant)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl InMemorySyncBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SyncBackend for InMemorySyncBackend {
    async fn publish(&self, event: &SyncEvent) -> Result<(), SyncError> {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SyncEvent>, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        Ok(rx)
    }

    async fn get_state(&self, provider: &str) -> Result<Option<StateRecord>, SyncError> {
        let mut states = self.states.lock().await;
        match states.get(provider) {
            Some((record, expires_at)) if *expires_at > Instant::now() => Ok(Some(record.clone())),
            Some(_) => {
                states.remove(provider);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_state(
        &self,
        provider: &str,
        record: &StateRecord,
        ttl: Duration,
    ) -> Result<(), SyncError> {
        let mut states = self.states.lock().await;
        states.insert(
            provider.to_string(),
            (record.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn health(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.subscribers.lock().await.clear();
    }
}
