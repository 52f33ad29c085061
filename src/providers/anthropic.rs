use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, FinishReason, Role, TokenUsage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{HealthCache, Provider, ProviderConfig, ProviderDescription};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_TEMPERATURE: f32 = 0.7;
// The messages API requires an explicit token cap.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
    health: HealthCache,
}

#[derive(Debug, Serialize)]
struct AnthropicChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    stop_sequence: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

/// Translate a neutral request into the messages-API wire shape.
///
/// System messages are lifted into the dedicated `system` field. Tool
/// messages and opaque tool-call payloads have no equivalent in this wire
/// shape (tool use is content blocks here) and are dropped.
fn to_wire(request: &ChatRequest, config: &ProviderConfig) -> Result<serde_json::Value, ProviderError> {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                if !message.content.is_empty() {
                    system_parts.push(message.content.clone());
                }
            }
            Role::User => messages.push(AnthropicMessage {
                role: "user",
                content: message.content.clone(),
            }),
            Role::Assistant => messages.push(AnthropicMessage {
                role: "assistant",
                content: message.content.clone(),
            }),
            Role::Tool => continue,
        }
    }

    if messages.is_empty() {
        return Err(ProviderError::malformed(
            "request contained no user or assistant messages",
        ));
    }

    let wire = AnthropicChatRequest {
        model: config.resolve_model(&request.model),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
        temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop.clone(),
    };

    let mut value = serde_json::to_value(&wire)?;
    if let serde_json::Value::Object(obj) = &mut value {
        for (k, v) in &request.extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Ok(value)
}

/// Translate a native response into the neutral shape, concatenating text
/// content blocks.
fn from_wire(resp: AnthropicChatResponse) -> Result<ChatResponse, ProviderError> {
    let content = resp
        .content
        .iter()
        .filter(|block| block.block_type == "text" || block.block_type.is_empty())
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    let finish_reason = map_stop_reason(resp.stop_reason.as_deref());

    if resp.stop_reason.as_deref() == Some("refusal") && content.is_empty() {
        return Err(ProviderError::safety_block(
            "the model refused to produce a completion",
        ));
    }
    if resp.content.is_empty() && resp.stop_reason.is_none() {
        return Err(ProviderError::malformed("response contained no content"));
    }

    let usage = resp
        .usage
        .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens, None))
        .unwrap_or_default();

    let mut metadata = HashMap::new();
    if let Some(id) = resp.id {
        metadata.insert("id".to_string(), serde_json::Value::String(id));
    }
    if let Some(reason) = &resp.stop_reason {
        metadata.insert(
            "stop_reason".to_string(),
            serde_json::Value::String(reason.clone()),
        );
    }
    if let Some(seq) = resp.stop_sequence {
        metadata.insert("stop_sequence".to_string(), serde_json::Value::String(seq));
    }

    Ok(ChatResponse {
        content,
        model: resp.model.unwrap_or_default(),
        provider: String::new(),
        usage,
        finish_reason,
        metadata,
        latency_ms: 0,
    })
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let mut headers = config.headers.clone();
        headers.insert("anthropic-version".to_string(), API_VERSION.to_string());
        let http = HttpProviderClient::new(
            config.kind,
            config.timeout,
            config.base_url.clone(),
            DEFAULT_BASE_URL,
            &headers,
            AuthStrategy::Header {
                name: "x-api-key".to_string(),
                value: config.api_key.clone(),
            },
        )?;
        Ok(Self {
            http,
            config,
            health: HealthCache::new(),
        })
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn describe(&self) -> ProviderDescription {
        ProviderDescription {
            name: self.config.name.clone(),
            kind: self.config.kind,
            supported_models: vec![
                "claude-3-5-sonnet-latest".to_string(),
                "claude-3-5-haiku-latest".to_string(),
                "claude-3-7-sonnet-latest".to_string(),
                "claude-3-opus-latest".to_string(),
            ],
            adapter_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn validate_credentials(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        deadline: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        let wire = to_wire(request, &self.config)?;
        let resp: AnthropicChatResponse = self
            .http
            .post_json_with_retry("/v1/messages", &wire, deadline, &self.config.retry)
            .await?;
        from_wire(resp)
    }

    async fn health_probe(&self) -> bool {
        if let Some(healthy) = self.health.cached().await {
            return healthy;
        }

        // No dedicated health endpoint; a minimal one-token completion
        // doubles as the probe.
        let probe = serde_json::json!({
            "model": self.config.resolve_model(""),
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "Hi"}],
        });
        let healthy = self
            .http
            .post_json::<serde_json::Value, serde_json::Value>(
                "/v1/messages",
                &probe,
                self.config.timeout,
            )
            .await
            .is_ok();
        self.health.store(healthy).await;
        healthy
    }
}
