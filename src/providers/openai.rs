//! Adapter for OpenAI-compatible chat-completion APIs.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, FinishReason, Role, TokenUsage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{HealthCache, Provider, ProviderConfig, ProviderDescription};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TEMPERATURE: f32 = 0.7;

pub struct OpenAiProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
    health: HealthCache,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<u64>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    system_fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
}

/// Translate a neutral request into the OpenAI wire shape.
///
/// Pure: no I/O, deterministic. `extra` entries are merged into the
/// top-level object without overriding mapped fields. An opaque tool-call
/// payload rides along as `tool_calls` on assistant messages and as
/// `tool_call_id` on tool-result messages.
fn to_wire(request: &ChatRequest, config: &ProviderConfig) -> Result<serde_json::Value, ProviderError> {
    let messages = request
        .messages
        .iter()
        .map(|m| {
            let (tool_calls, tool_call_id) = match m.role {
                Role::Assistant => (m.tool_call.clone(), None),
                Role::Tool => (None, m.tool_call.clone()),
                _ => (None, None),
            };
            OpenAiMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                },
                content: m.content.clone(),
                name: m.name.clone(),
                tool_calls,
                tool_call_id,
            }
        })
        .collect();

    let wire = OpenAiChatRequest {
        model: config.resolve_model(&request.model),
        messages,
        temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        max_tokens: request.max_tokens,
        top_p: request.top_p,
        stop: request.stop.clone(),
        tools: request.tools.clone(),
    };

    let mut value = serde_json::to_value(&wire)?;
    if let serde_json::Value::Object(obj) = &mut value {
        for (k, v) in &request.extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Ok(value)
}

/// Translate a native response into the neutral shape.
///
/// The dispatcher stamps `provider` and `latency_ms` afterwards. A response
/// with no choices is malformed; a content-filtered response with no content
/// at all is a safety block, not a completion.
fn from_wire(resp: OpenAiChatResponse) -> Result<ChatResponse, ProviderError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::malformed("response contained no choices"))?;

    let content = choice.message.content.unwrap_or_default();
    let finish_reason = map_finish_reason(choice.finish_reason.as_deref());

    if finish_reason == FinishReason::ContentFilter && content.is_empty() {
        return Err(ProviderError::safety_block(
            "completion was suppressed by the provider's content filter",
        ));
    }

    let usage = resp
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens, u.total_tokens))
        .unwrap_or_default();

    let mut metadata = HashMap::new();
    if let Some(id) = resp.id {
        metadata.insert("id".to_string(), serde_json::Value::String(id));
    }
    if let Some(created) = resp.created {
        metadata.insert("created".to_string(), serde_json::json!(created));
    }
    if let Some(fp) = resp.system_fingerprint {
        metadata.insert(
            "system_fingerprint".to_string(),
            serde_json::Value::String(fp),
        );
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

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        _ => FinishReason::Other,
    }
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config.kind,
            config.timeout,
            config.base_url.clone(),
            DEFAULT_BASE_URL,
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
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
impl Provider for OpenAiProvider {
    fn describe(&self) -> ProviderDescription {
        ProviderDescription {
            name: self.config.name.clone(),
            kind: self.config.kind,
            supported_models: vec![
                "gpt-4o".to_string(),
                "gpt-4o-mini".to_string(),
                "gpt-4.1".to_string(),
                "gpt-4.1-mini".to_string(),
                "o3-mini".to_string(),
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
        let resp: OpenAiChatResponse = self
            .http
            .post_json_with_retry("/chat/completions", &wire, deadline, &self.config.retry)
            .await?;
        from_wire(resp)
    }

    async fn health_probe(&self) -> bool {
        if let Some(healthy) = self.health.cached().await {
            return healthy;
        }
        let healthy = self.http.get_ok("/models", self.config.timeout).await;
        self.health.store(healthy).await;
        healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::providers::ProviderKind;

    fn config() -> ProviderConfig {
        ProviderConfig::new("openai-test", ProviderKind::OpenAi, "sk-test")
            .with_default_model("gpt-4o-mini")
    }

    #[test]
    fn test_to_wire_maps_roles_and_defaults_temperature() {
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::system("be brief"), Message::user("hi")],
            ..Default::default()
        };

        let wire = to_wire(&request, &config()).unwrap();
        assert_eq!(wire["model"], "gpt-4o");
        assert_eq!(wire["messages"][0]["role"], "system");
        assert_eq!(wire["messages"][1]["role"], "user");
        assert!((wire["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!(wire.get("max_tokens").is_none());
    }

    #[test]
    fn test_to_wire_merges_extra_without_overriding() {
        let mut request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::user("hi")],
            temperature: Some(0.1),
            ..Default::default()
        };
        request
            .extra
            .insert("seed".to_string(), serde_json::json!(42));
        request
            .extra
            .insert("temperature".to_string(), serde_json::json!(1.9));

        let wire = to_wire(&request, &config()).unwrap();
        assert_eq!(wire["seed"], 42);
        // Mapped fields win over passthrough collisions.
        assert!((wire["temperature"].as_f64().unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_to_wire_forwards_tool_payloads() {
        let mut assistant = Message::assistant("");
        assistant.tool_call = Some(serde_json::json!([{
            "id": "call_1",
            "type": "function",
            "function": {"name": "get_weather", "arguments": "{}"}
        }]));
        let tool_result = Message {
            role: Role::Tool,
            content: "72F".to_string(),
            name: None,
            tool_call: Some(serde_json::json!("call_1")),
        };
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::user("weather?"), assistant, tool_result],
            ..Default::default()
        };

        let wire = to_wire(&request, &config()).unwrap();
        assert!(wire["messages"][0].get("tool_calls").is_none());
        assert_eq!(wire["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire["messages"][2]["role"], "tool");
        assert_eq!(wire["messages"][2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_from_wire_maps_fields() {
        let resp: OpenAiChatResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-123",
            "created": 1700000000u64,
            "model": "gpt-4o-2024",
            "choices": [{"message": {"content": "pong"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        }))
        .unwrap();

        let neutral = from_wire(resp).unwrap();
        assert_eq!(neutral.content, "pong");
        assert_eq!(neutral.model, "gpt-4o-2024");
        assert_eq!(neutral.finish_reason, FinishReason::Stop);
        assert_eq!(neutral.usage.total_tokens, 7);
        assert_eq!(neutral.metadata["id"], "chatcmpl-123");
    }

    #[test]
    fn test_from_wire_zero_fills_missing_usage() {
        let resp: OpenAiChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "ok"}, "finish_reason": "length"}]
        }))
        .unwrap();

        let neutral = from_wire(resp).unwrap();
        assert_eq!(neutral.usage, TokenUsage::default());
        assert_eq!(neutral.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_from_wire_rejects_empty_choices() {
        let resp: OpenAiChatResponse =
            serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        let err = from_wire(resp).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Malformed);
    }

    #[test]
    fn test_content_filter_without_content_is_safety_block() {
        let resp: OpenAiChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {}, "finish_reason": "content_filter"}]
        }))
        .unwrap();
        let err = from_wire(resp).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::SafetyBlock);
    }

    #[test]
    fn test_unknown_finish_reason_collapses_to_other() {
        assert_eq!(map_finish_reason(Some("eos_token")), FinishReason::Other);
        assert_eq!(map_finish_reason(None), FinishReason::Other);
    }
}
