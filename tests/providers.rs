//! Adapter wire tests against mock upstream servers: request shaping,
//! response normalization, error classification, and internal retry.

use llm_dispatch::providers::create_provider;
use llm_dispatch::{
    ChatRequest, ErrorKind, FinishReason, Message, ProviderConfig, ProviderKind, RetryPolicy,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEADLINE: Duration = Duration::from_secs(5);

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    }
}

fn config(kind: ProviderKind, server: &MockServer) -> ProviderConfig {
    let mut config = ProviderConfig::new("wire-test", kind, "sk-test")
        .with_base_url(server.uri())
        .with_default_model("default-model");
    config.retry = no_retry();
    config
}

fn request(model: &str) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![Message::system("be terse"), Message::user("ping")],
        max_tokens: Some(64),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_openai_adapter_round_trip() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "ping"}
            ],
            "max_tokens": 64
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000u64,
            "model": "gpt-4o-2024",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "pong"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = create_provider(&config(ProviderKind::OpenAi, &server))?;
    let response = provider.complete(&request("gpt-4o"), DEADLINE).await?;

    assert_eq!(response.content, "pong");
    assert_eq!(response.model, "gpt-4o-2024");
    assert_eq!(response.usage.total_tokens, 7);
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.metadata["id"], "chatcmpl-1");
    Ok(())
}

#[tokio::test]
async fn test_openai_adapter_classifies_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {
                "message": "Incorrect API key provided",
                "type": "invalid_request_error",
                "code": "invalid_api_key"
            }
        })))
        .mount(&server)
        .await;

    let provider = create_provider(&config(ProviderKind::OpenAi, &server)).unwrap();
    let err = provider
        .complete(&request("gpt-4o"), DEADLINE)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Auth);
    assert_eq!(err.provider_code.as_deref(), Some("invalid_api_key"));
}

#[tokio::test]
async fn test_openai_adapter_retries_upstream_5xx_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"message": "internal", "type": "server_error"}
        })))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "eventually"}, "finish_reason": "stop"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config(ProviderKind::OpenAi, &server);
    config.retry = RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    };

    let provider = create_provider(&config).unwrap();
    let response = provider.complete(&request("gpt-4o"), DEADLINE).await.unwrap();
    assert_eq!(response.content, "eventually");
}

#[tokio::test]
async fn test_openai_adapter_times_out_against_slow_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"choices": []}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let provider = create_provider(&config(ProviderKind::OpenAi, &server)).unwrap();
    let err = provider
        .complete(&request("gpt-4o"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_anthropic_adapter_round_trip_with_system_extraction() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "system": "be terse",
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 64
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "pong"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 2}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = create_provider(&config(ProviderKind::Anthropic, &server))?;
    let response = provider
        .complete(&request("claude-3-5-haiku-20241022"), DEADLINE)
        .await?;

    assert_eq!(response.content, "pong");
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.total_tokens, 7);
    assert_eq!(response.metadata["stop_reason"], "end_turn");
    Ok(())
}

#[tokio::test]
async fn test_anthropic_adapter_classifies_overload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })))
        .mount(&server)
        .await;

    let provider = create_provider(&config(ProviderKind::Anthropic, &server)).unwrap();
    let err = provider
        .complete(&request("claude-3-5-haiku-20241022"), DEADLINE)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Upstream5xx);
    assert_eq!(err.provider_code.as_deref(), Some("overloaded_error"));
}

#[tokio::test]
async fn test_vertex_adapter_round_trip() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-1.5-flash:generateContent"))
        .and(header("x-goog-api-key", "sk-test"))
        .and(body_partial_json(json!({
            "contents": [{"role": "user", "parts": [{"text": "ping"}]}],
            "generationConfig": {"maxOutputTokens": 64}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "pong"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 5,
                "candidatesTokenCount": 2,
                "totalTokenCount": 7
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = create_provider(&config(ProviderKind::Vertex, &server))?;
    let response = provider
        .complete(&request("gemini-1.5-flash"), DEADLINE)
        .await?;

    assert_eq!(response.content, "pong");
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.total_tokens, 7);
    Ok(())
}

#[tokio::test]
async fn test_vertex_adapter_classifies_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-1.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "status": "RESOURCE_EXHAUSTED"
            }
        })))
        .mount(&server)
        .await;

    let provider = create_provider(&config(ProviderKind::Vertex, &server)).unwrap();
    let err = provider
        .complete(&request("gemini-1.5-flash"), DEADLINE)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::RateLimit);
    assert_eq!(err.provider_code.as_deref(), Some("RESOURCE_EXHAUSTED"));
}

#[tokio::test]
async fn test_vertex_adapter_reports_blocked_prompt_as_safety_block() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-1.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        })))
        .mount(&server)
        .await;

    let provider = create_provider(&config(ProviderKind::Vertex, &server)).unwrap();
    let err = provider
        .complete(&request("gemini-1.5-flash"), DEADLINE)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SafetyBlock);
}

#[tokio::test]
async fn test_model_mapping_rewrites_the_wire_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "provider-specific-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(ProviderKind::OpenAi, &server)
        .with_model_mapping("neutral-alias", "provider-specific-model");
    let provider = create_provider(&config).unwrap();
    let response = provider
        .complete(&request("neutral-alias"), DEADLINE)
        .await
        .unwrap();
    assert_eq!(response.content, "ok");
}
