use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, FinishReason, Role, TokenUsage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{HealthCache, Provider, ProviderConfig, ProviderDescription};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TEMPERATURE: f32 = 0.7;

pub struct VertexProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
    health: HealthCache,
}

#[derive(Debug, Serialize)]
struct VertexChatRequest {
    contents: Vec<VertexContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<VertexContent>,
    #[serde(rename = "generationConfig")]
    generation_config: VertexGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct VertexContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    role: String,
    #[serde(default)]
    parts: Vec<VertexPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VertexPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VertexGenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct VertexChatResponse {
    #[serde(default)]
    candidates: Vec<VertexCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<VertexUsage>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<serde_json::Value>,
    #[serde(rename = "modelVersion", default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VertexCandidate {
    #[serde(default)]
    content: Option<VertexContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
    #[serde(rename = "safetyRatings", default)]
    safety_ratings: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VertexUsage {
    #[serde(default)]
    prompt_token_count: Option<u32>,
    #[serde(default)]
    candidates_token_count: Option<u32>,
    #[serde(default)]
    total_token_count: Option<u32>,
}

/// Translate a neutral request into the generateContent wire shape.
///
/// Assistant turns become `model` turns; system messages move into
/// `systemInstruction`. Tool messages and opaque tool-call payloads have no
/// equivalent in this wire shape (tool use is function-call parts here) and
/// are dropped.
fn to_wire(request: &ChatRequest) -> Result<serde_json::Value, ProviderError> {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                if !message.content.is_empty() {
                    system_parts.push(VertexPart {
                        text: message.content.clone(),
                    });
                }
            }
            Role::User => contents.push(VertexContent {
                role: "user".to_string(),
                parts: vec![VertexPart {
                    text: message.content.clone(),
                }],
            }),
            Role::Assistant => contents.push(VertexContent {
                role: "model".to_string(),
                parts: vec![VertexPart {
                    text: message.content.clone(),
                }],
            }),
            Role::Tool => continue,
        }
    }

    if contents.is_empty() {
        return Err(ProviderError::malformed(
            "request contained no user or assistant messages",
        ));
    }

    let wire = VertexChatRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| VertexContent {
            role: String::new(),
            parts: system_parts,
        }),
        generation_config: VertexGenerationConfig {
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_output_tokens: request.max_tokens,
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences: request.stop.clone(),
        },
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
/// A block reason in `promptFeedback` or a safety finish with no content is a
/// safety block; anything else without candidates is malformed.
fn from_wire(resp: VertexChatResponse, model: &str) -> Result<ChatResponse, ProviderError> {
    if let Some(block_reason) = resp
        .prompt_feedback
        .as_ref()
        .and_then(|fb| fb.get("blockReason"))
        .and_then(|r| r.as_str())
    {
        return Err(
            ProviderError::safety_block("prompt was blocked by the provider's safety filters")
                .with_code(block_reason.to_string()),
        );
    }

    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::malformed("response contained no candidates"))?;

    let content = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let finish_reason = map_finish_reason(candidate.finish_reason.as_deref());

    if finish_reason == FinishReason::ContentFilter && content.is_empty() {
        let mut err =
            ProviderError::safety_block("completion was blocked by the provider's safety filters");
        if let Some(code) = &candidate.finish_reason {
            err = err.with_code(code.clone());
        }
        return Err(err);
    }

    let usage = resp
        .usage_metadata
        .map(|u| {
            TokenUsage::new(
                u.prompt_token_count,
                u.candidates_token_count,
                u.total_token_count,
            )
        })
        .unwrap_or_default();

    let mut metadata = HashMap::new();
    if let Some(reason) = candidate.finish_reason {
        metadata.insert(
            "finish_reason".to_string(),
            serde_json::Value::String(reason),
        );
    }
    if let Some(ratings) = candidate.safety_ratings {
        metadata.insert("safety_ratings".to_string(), ratings);
    }
    if let Some(version) = &resp.model_version {
        metadata.insert(
            "model_version".to_string(),
            serde_json::Value::String(version.clone()),
        );
    }

    Ok(ChatResponse {
        content,
        model: resp.model_version.unwrap_or_else(|| model.to_string()),
        provider: String::new(),
        usage,
        finish_reason,
        metadata,
        latency_ms: 0,
    })
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") | Some("PROHIBITED_CONTENT") | Some("BLOCKLIST") => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Other,
    }
}

impl VertexProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config.kind,
            config.timeout,
            config.base_url.clone(),
            DEFAULT_BASE_URL,
            &config.headers,
            AuthStrategy::Header {
                name: "x-goog-api-key".to_string(),
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
impl Provider for VertexProvider {
    fn describe(&self) -> ProviderDescription {
        ProviderDescription {
            name: self.config.name.clone(),
            kind: self.config.kind,
            supported_models: vec![
                "gemini-1.5-pro".to_string(),
                "gemini-1.5-flash".to_string(),
                "gemini-2.0-flash".to_string(),
                "gemini-2.5-pro".to_string(),
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
        let model = self.config.resolve_model(&request.model);
        let path = format!("/models/{model}:generateContent");
        let wire = to_wire(request)?;
        let resp: VertexChatResponse = self
            .http
            .post_json_with_retry(&path, &wire, deadline, &self.config.retry)
            .await?;
        from_wire(resp, &model)
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

    #[test]
    fn test_to_wire_maps_roles_and_system_instruction() {
        let request = ChatRequest {
            model: "gemini-1.5-pro".to_string(),
            messages: vec![
                Message::system("be helpful"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("how are you?"),
            ],
            temperature: Some(0.3),
            max_tokens: Some(128),
            ..Default::default()
        };

        let wire = to_wire(&request).unwrap();
        assert_eq!(wire["systemInstruction"]["parts"][0]["text"], "be helpful");
        let contents = wire["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(wire["generationConfig"]["maxOutputTokens"], 128);
        assert!((wire["generationConfig"]["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_from_wire_concatenates_parts_and_maps_usage() {
        let resp: VertexChatResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "po"}, {"text": "ng"}]},
                "finishReason": "STOP",
                "safetyRatings": [{"category": "HARM_CATEGORY_HARASSMENT", "probability": "NEGLIGIBLE"}]
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7},
            "modelVersion": "gemini-1.5-pro-002"
        }))
        .unwrap();

        let neutral = from_wire(resp, "gemini-1.5-pro").unwrap();
        assert_eq!(neutral.content, "pong");
        assert_eq!(neutral.finish_reason, FinishReason::Stop);
        assert_eq!(neutral.usage.total_tokens, 7);
        assert_eq!(neutral.model, "gemini-1.5-pro-002");
        assert!(neutral.metadata.contains_key("safety_ratings"));
    }

    #[test]
    fn test_blocked_prompt_is_safety_block() {
        let resp: VertexChatResponse = serde_json::from_value(serde_json::json!({
            "candidates": [],
            "promptFeedback": {"blockReason": "SAFETY"}
        }))
        .unwrap();

        let err = from_wire(resp, "gemini-1.5-pro").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::SafetyBlock);
        assert_eq!(err.provider_code.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn test_safety_finish_without_content_is_safety_block() {
        let resp: VertexChatResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"finishReason": "SAFETY"}]
        }))
        .unwrap();
        let err = from_wire(resp, "gemini-1.5-pro").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::SafetyBlock);
    }

    #[test]
    fn test_empty_candidates_are_malformed() {
        let resp: VertexChatResponse =
            serde_json::from_value(serde_json::json!({"candidates": []})).unwrap();
        let err = from_wire(resp, "gemini-1.5-pro").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Malformed);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(
            map_finish_reason(Some("RECITATION")),
            FinishReason::ContentFilter
        );
        assert_eq!(map_finish_reason(Some("OTHER")), FinishReason::Other);
        assert_eq!(map_finish_reason(None), FinishReason::Other);
    }
}
