//! Shared test fixtures: a scripted in-process provider that plays back a
//! queue of outcomes, so failover behavior can be driven without a network.
#![allow(dead_code)]

use llm_dispatch::providers::{Provider, ProviderDescription, ProviderKind};
use llm_dispatch::{
    ChatRequest, ChatResponse, FinishReason, ProviderConfig, ProviderError, TokenUsage,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn ok_response(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        model: "scripted-model".to_string(),
        provider: String::new(),
        usage: TokenUsage::new(Some(5), Some(2), None),
        finish_reason: FinishReason::Stop,
        metadata: Default::default(),
        latency_ms: 0,
    }
}

pub fn ping() -> ChatRequest {
    ChatRequest {
        model: "scripted-model".to_string(),
        messages: vec![llm_dispatch::Message::user("ping")],
        ..Default::default()
    }
}

/// Adapter that pops one scripted outcome per call and falls back to a
/// default outcome when the script runs dry.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    fallback: Result<ChatResponse, ProviderError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn always_ok(name: &str, content: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(ok_response(content)),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always_err(name: &str, err: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Err(err),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// Play the given outcomes in order, then keep returning `fallback`.
    pub fn scripted(
        name: &str,
        outcomes: Vec<Result<ChatResponse, ProviderError>>,
        fallback: Result<ChatResponse, ProviderError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(outcomes.into()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow_ok(name: &str, content: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(ok_response(content)),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn describe(&self) -> ProviderDescription {
        ProviderDescription {
            name: self.name.clone(),
            kind: ProviderKind::OpenAi,
            supported_models: vec!["scripted-model".to_string()],
            adapter_version: "test".to_string(),
        }
    }

    fn validate_credentials(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        _request: &ChatRequest,
        _deadline: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn health_probe(&self) -> bool {
        true
    }
}

/// Provider config shell for a scripted adapter.
pub fn scripted_config(name: &str, priority: u32) -> ProviderConfig {
    ProviderConfig::new(name, ProviderKind::OpenAi, "test-key").with_priority(priority)
}

/// Opt-in test logging: `RUST_LOG=llm_dispatch=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
