//! # llm-dispatch
//!
//! A resilient request-dispatch layer fronting multiple generative-AI
//! chat-completion services with one provider-neutral request/response
//! contract. Providers are tried in priority order, each behind its own
//! circuit breaker, and breaker state is kept consistent across worker
//! processes through a pub/sub + key/value sync backend.
//!
//! ## Overview
//!
//! The crate provides:
//! - **Neutral contract**: one [`ChatRequest`]/[`ChatResponse`] shape for
//!   OpenAI-style, Anthropic-style, and Google Vertex/Gemini-style APIs
//! - **Priority failover**: deterministic candidate order, skipping
//!   providers whose circuit is open
//! - **Circuit breakers**: per-provider three-state machines with automatic
//!   recovery probing
//! - **Error taxonomy**: every provider failure classified into a closed
//!   [`ErrorKind`] set that drives breaker counting and failover
//! - **Cross-worker sync**: breaker transitions broadcast over redis so a
//!   fleet of workers converges on provider health together
//!
//! ## Quick start
//!
//! ```rust
//! use llm_dispatch::{ChatRequest, DispatchClient, Message, ProviderConfig, ProviderKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DispatchClient::builder()
//!         .with_provider(
//!             ProviderConfig::new("openai-primary", ProviderKind::OpenAi, "sk-key")
//!                 .with_priority(1)
//!                 .with_default_model("gpt-4o-mini"),
//!         )
//!         .with_provider(
//!             ProviderConfig::new("anthropic-fallback", ProviderKind::Anthropic, "key")
//!                 .with_priority(2)
//!                 .with_default_model("claude-3-5-haiku-latest"),
//!         )
//!         .build()
//!         .await?;
//!
//!     let response = client
//!         .dispatch(ChatRequest {
//!             model: "gpt-4o-mini".to_string(),
//!             messages: vec![Message::user("Hello!")],
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     println!("[{}] {}", response.provider, response.content);
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Failover behavior
//!
//! A dispatch walks the registry in priority order. Providers with an open
//! breaker are skipped without being invoked. Transient failures
//! (rate limits, timeouts, network, upstream 5xx) fail over to the next
//! candidate; permanent ones for this request (auth, bad request, content
//! policy) skip the provider too but are reported as permanent. When every
//! candidate is exhausted the caller receives
//! [`ClientError::AllProvidersFailed`] with one attempt record per provider.
//!
//! ## Cross-worker synchronization
//!
//! With [`DispatchClientBuilder::with_redis_sync`], breaker transitions are
//! published on `<prefix>:events` and the latest state per provider is kept
//! under `<prefix>:state:<provider>` with a TTL. Sibling workers apply
//! incoming snapshots to their own breakers, so one worker discovering an
//! outage spares the rest from rediscovering it. Without redis (or when it
//! is unreachable at startup) the client degrades to in-process semantics.

pub mod circuit_breaker;
pub mod client;
pub mod common;
pub mod error;
pub mod models;
pub mod providers;
pub mod registry;
pub mod sync;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitEventKind, CircuitSnapshot,
    CircuitState, StateChangeListener,
};
pub use client::{
    DispatchClient, DispatchClientBuilder, DispatchStats, ProviderStats, ProviderStatus,
};
pub use error::{Attempt, AttemptOutcome, ClientError, ErrorKind, ProviderError};
pub use models::{
    ChatRequest, ChatResponse, FinishReason, Message, Role, TokenUsage, ValidationError,
};
pub use providers::{Provider, ProviderConfig, ProviderDescription, ProviderKind, RetryPolicy};
pub use registry::{ProviderRegistry, RegistryError};
pub use sync::{
    InMemorySyncBackend, RedisSyncBackend, StateRecord, SyncBackend, SyncEvent, SyncManager,
    WorkerId,
};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let user_msg = Message::user("Hello, world!");
        assert_eq!(user_msg.role, Role::User);
        assert_eq!(user_msg.content, "Hello, world!");

        let system_msg = Message::system("You are a helpful assistant.");
        assert_eq!(system_msg.role, Role::System);
    }

    #[test]
    fn test_chat_request_default() {
        let request = ChatRequest::default();
        assert_eq!(request.model, "");
        assert!(request.messages.is_empty());
        assert_eq!(request.temperature, None);
        assert!(!request.stream);
    }

    #[test]
    fn test_provider_config_creation() {
        let config = ProviderConfig::new("primary", ProviderKind::OpenAi, "sk-test");
        assert_eq!(config.name, "primary");
        assert_eq!(config.priority, 1);
        assert_eq!(config.timeout.as_secs(), 30);
    }

    #[test]
    fn test_breaker_defaults_exclude_content_kinds() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert!(!config.expected_error_kinds.contains(&ErrorKind::SafetyBlock));
        assert!(!config.expected_error_kinds.contains(&ErrorKind::Malformed));
        assert!(config.expected_error_kinds.contains(&ErrorKind::Auth));
    }
}
