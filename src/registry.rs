//! # Provider Registry
//!
//! Holds the `(config, adapter, breaker)` triple for every registered
//! provider and hands the dispatcher its candidate order. Order is fully
//! deterministic: ascending priority, ties broken by registration order,
//! never by latency or recent success rate.
//!
//! Registration is a startup-phase activity. The registry is not safe for
//! concurrent mutation; the client builder owns it exclusively while
//! configuring, after which it is read-only.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::ProviderError;
use crate::providers::{create_provider, Provider, ProviderConfig};
use std::sync::Arc;
use thiserror::Error;

/// Registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider name '{name}' is already registered")]
    DuplicateName { name: String },
    #[error("provider '{name}' failed to construct: {source}")]
    Adapter {
        name: String,
        #[source]
        source: ProviderError,
    },
    #[error("invalid provider config: {message}")]
    InvalidConfig { message: String },
}

/// One registered provider: its config, adapter, and circuit breaker.
pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub adapter: Arc<dyn Provider>,
    pub breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Priority-ordered set of provider entries, keyed by name.
pub struct ProviderRegistry {
    entries: Vec<Arc<ProviderEntry>>,
    breaker_defaults: CircuitBreakerConfig,
}

impl ProviderRegistry {
    pub fn new(breaker_defaults: CircuitBreakerConfig) -> Self {
        Self {
            entries: Vec::new(),
            breaker_defaults,
        }
    }

    /// Register a provider: validates the config, constructs the adapter via
    /// the kind factory, and creates its circuit breaker.
    pub fn register(&mut self, config: ProviderConfig) -> Result<Arc<ProviderEntry>, RegistryError> {
        self.check(&config)?;
        let adapter = create_provider(&config).map_err(|source| RegistryError::Adapter {
            name: config.name.clone(),
            source,
        })?;
        Ok(self.insert(config, adapter))
    }

    /// Register a provider with a caller-supplied adapter instead of the
    /// kind factory. The config still drives priority, timeout, and breaker
    /// construction.
    pub fn register_with_adapter(
        &mut self,
        config: ProviderConfig,
        adapter: Arc<dyn Provider>,
    ) -> Result<Arc<ProviderEntry>, RegistryError> {
        self.check(&config)?;
        Ok(self.insert(config, adapter))
    }

    fn check(&self, config: &ProviderConfig) -> Result<(), RegistryError> {
        config
            .validate()
            .map_err(|message| RegistryError::InvalidConfig { message })?;
        if self.entries.iter().any(|e| e.config.name == config.name) {
            return Err(RegistryError::DuplicateName {
                name: config.name.clone(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, config: ProviderConfig, adapter: Arc<dyn Provider>) -> Arc<ProviderEntry> {
        let breaker_config = config
            .circuit_breaker
            .clone()
            .unwrap_or_else(|| self.breaker_defaults.clone());
        let breaker = Arc::new(CircuitBreaker::new(config.name.clone(), breaker_config));

        let entry = Arc::new(ProviderEntry {
            config,
            adapter,
            breaker,
        });
        self.entries.push(entry.clone());
        // Stable sort keeps registration order within equal priorities.
        self.entries.sort_by_key(|e| e.config.priority);
        entry
    }

    /// All entries in dispatch order.
    pub fn list_by_priority(&self) -> Vec<Arc<ProviderEntry>> {
        self.entries.clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.entries
            .iter()
            .find(|e| e.config.name == name)
            .cloned()
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<ProviderEntry>> {
        let idx = self.entries.iter().position(|e| e.config.name == name)?;
        Some(self.entries.remove(idx))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Reset one breaker by name, or all of them.
    pub async fn reset_breakers(&self, name: Option<&str>) {
        for entry in &self.entries {
            if name.is_none() || name == Some(entry.config.name.as_str()) {
                entry.breaker.reset().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn config(name: &str, priority: u32) -> ProviderConfig {
        ProviderConfig::new(name, ProviderKind::OpenAi, "sk-test").with_priority(priority)
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(CircuitBreakerConfig::default())
    }

    #[test]
    fn test_priority_order_with_registration_tiebreak() {
        let mut registry = registry();
        registry.register(config("low", 5)).unwrap();
        registry.register(config("first-of-two", 2)).unwrap();
        registry.register(config("second-of-two", 2)).unwrap();
        registry.register(config("top", 1)).unwrap();

        let names: Vec<_> = registry
            .list_by_priority()
            .iter()
            .map(|e| e.config.name.clone())
            .collect();
        assert_eq!(names, vec!["top", "first-of-two", "second-of-two", "low"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = registry();
        registry.register(config("primary", 1)).unwrap();
        let err = registry.register(config("primary", 2)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { .. }));
    }

    #[test]
    fn test_get_and_remove() {
        let mut registry = registry();
        registry.register(config("a", 1)).unwrap();
        registry.register(config("b", 2)).unwrap();

        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());

        let removed = registry.remove("a").unwrap();
        assert_eq!(removed.config.name, "a");
        assert!(registry.get("a").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_breaker_override_applies() {
        let mut registry = registry();
        let custom = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        registry
            .register(config("custom", 1).with_circuit_breaker(custom))
            .unwrap();
        // Breaker exists and is named after the provider.
        assert_eq!(registry.get("custom").unwrap().breaker.name(), "custom");
    }

    #[tokio::test]
    async fn test_reset_breakers_scoped() {
        let mut registry = registry();
        registry.register(config("a", 1)).unwrap();
        registry.register(config("b", 2)).unwrap();

        let a = registry.get("a").unwrap();
        for _ in 0..5 {
            a.breaker
                .record_failure(crate::error::ErrorKind::Network)
                .await;
        }
        assert_eq!(
            a.breaker.state().await,
            crate::circuit_breaker::CircuitState::Open
        );

        registry.reset_breakers(Some("a")).await;
        assert_eq!(
            a.breaker.state().await,
            crate::circuit_breaker::CircuitState::Closed
        );
    }
}
