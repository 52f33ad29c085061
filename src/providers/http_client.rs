//! Shared HTTP plumbing for provider adapters: one thin `reqwest` wrapper,
//! the explicit native-error → [`ErrorKind`] classification tables, and the
//! deadline-aware internal retry loop.

use crate::error::{ErrorKind, ProviderError};
use crate::providers::{ProviderKind, RetryPolicy};
use rand::Rng;
use reqwest::{header::HeaderMap, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How an adapter authenticates against its upstream.
#[derive(Clone, Debug)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
    None,
}

/// Thin wrapper over a shared `reqwest::Client` with the provider's base URL
/// and default headers baked in. One instance per adapter; connections are
/// pooled by `reqwest`.
#[derive(Clone)]
pub struct HttpProviderClient {
    http: Client,
    kind: ProviderKind,
    base_url: String,
    default_headers: HeaderMap,
}

impl HttpProviderClient {
    pub fn new(
        kind: ProviderKind,
        timeout: Duration,
        base_url: Option<String>,
        default_base: &str,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::unknown(format!("failed to create HTTP client: {e}")))?;

        let mut default_headers = HeaderMap::new();

        match auth {
            AuthStrategy::Bearer { token } => {
                let value = format!("Bearer {token}")
                    .parse()
                    .map_err(|_| ProviderError::unknown("API key is not a valid header value"))?;
                default_headers.insert("Authorization", value);
            }
            AuthStrategy::Header { name, value } => {
                let name: reqwest::header::HeaderName = name
                    .parse()
                    .map_err(|_| ProviderError::unknown("invalid auth header name"))?;
                let value = value
                    .parse()
                    .map_err(|_| ProviderError::unknown("API key is not a valid header value"))?;
                default_headers.insert(name, value);
            }
            AuthStrategy::None => {}
        }

        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            } else {
                tracing::warn!(header = %k, "skipping invalid custom header");
            }
        }

        Ok(Self {
            http,
            kind,
            base_url: base_url.unwrap_or_else(|| default_base.to_string()),
            default_headers,
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    pub async fn post_json<TReq, TResp>(
        &self,
        path: &str,
        body: &TReq,
        deadline: Duration,
    ) -> Result<TResp, ProviderError>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        let resp = self
            .http
            .request(Method::POST, self.build_url(path))
            .headers(self.default_headers.clone())
            .timeout(deadline)
            .json(body)
            .send()
            .await
            .map_err(ProviderError::from)?;

        if !resp.status().is_success() {
            return Err(classify_error_response(self.kind, resp).await);
        }
        resp.json::<TResp>().await.map_err(ProviderError::from)
    }

    /// POST with the adapter's internal retry loop.
    ///
    /// Only rate-limit and upstream-5xx responses are retried, and only while
    /// the remaining deadline can absorb the next backoff delay.
    pub async fn post_json_with_retry<TReq, TResp>(
        &self,
        path: &str,
        body: &TReq,
        deadline: Duration,
        policy: &RetryPolicy,
    ) -> Result<TResp, ProviderError>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(ProviderError::timeout("deadline exhausted before request"));
            }

            match self.post_json(path, body, remaining).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable_internally =
                        matches!(err.kind, ErrorKind::RateLimit | ErrorKind::Upstream5xx);
                    if !retryable_internally || attempt >= policy.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(policy, attempt);
                    if start.elapsed() + delay >= deadline {
                        return Err(err);
                    }
                    tracing::debug!(
                        kind = %err.kind,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying transient upstream failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        path: &str,
        deadline: Duration,
    ) -> Result<TResp, ProviderError> {
        let resp = self
            .http
            .request(Method::GET, self.build_url(path))
            .headers(self.default_headers.clone())
            .timeout(deadline)
            .send()
            .await
            .map_err(ProviderError::from)?;

        if !resp.status().is_success() {
            return Err(classify_error_response(self.kind, resp).await);
        }
        resp.json::<TResp>().await.map_err(ProviderError::from)
    }

    /// GET that only reports reachability; used by health probes.
    pub async fn get_ok(&self, path: &str, deadline: Duration) -> bool {
        self.http
            .request(Method::GET, self.build_url(path))
            .headers(self.default_headers.clone())
            .timeout(deadline)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .initial_delay
        .mul_f64(policy.backoff_multiplier.powi(attempt as i32))
        .min(policy.max_delay);
    let jitter = base.mul_f64(policy.jitter_factor * rand::thread_rng().gen::<f64>());
    base + jitter
}

/// Turn a non-success HTTP response into a classified [`ProviderError`].
///
/// The provider's own error code takes precedence; the HTTP status decides
/// otherwise. Unmapped combinations become `Unknown` and are logged.
pub async fn classify_error_response(kind: ProviderKind, resp: Response) -> ProviderError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();

    let (message, code) = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .map(|v| extract_error_fields(kind, &v))
        .unwrap_or((None, None));

    let message = message.unwrap_or_else(|| {
        if body.is_empty() {
            format!("HTTP {status}")
        } else {
            body.chars().take(512).collect()
        }
    });

    let error_kind = code
        .as_deref()
        .and_then(|c| classify_code(kind, c))
        .unwrap_or_else(|| classify_status(status));

    if error_kind == ErrorKind::Unknown {
        tracing::warn!(provider_kind = %kind, status, code = ?code, "unmapped provider error");
    }

    let mut err = ProviderError::new(error_kind, message);
    if let Some(code) = code {
        err = err.with_code(code);
    }
    err
}

/// Pull the message and native error code out of a provider error body.
fn extract_error_fields(
    kind: ProviderKind,
    body: &serde_json::Value,
) -> (Option<String>, Option<String>) {
    let error = body.get("error").unwrap_or(body);
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(|s| s.to_string());

    let code = match kind {
        // {"error": {"message", "type", "code"}}
        ProviderKind::OpenAi => error
            .get("code")
            .and_then(|c| c.as_str())
            .or_else(|| error.get("type").and_then(|t| t.as_str())),
        // {"type": "error", "error": {"type", "message"}}
        ProviderKind::Anthropic => error.get("type").and_then(|t| t.as_str()),
        // {"error": {"code": 429, "message", "status": "RESOURCE_EXHAUSTED"}}
        ProviderKind::Vertex => error.get("status").and_then(|s| s.as_str()),
    }
    .map(|s| s.to_string());

    (message, code)
}

/// Provider error-code → [`ErrorKind`] tables.
fn classify_code(kind: ProviderKind, code: &str) -> Option<ErrorKind> {
    let mapped = match kind {
        ProviderKind::OpenAi => match code {
            "invalid_api_key" | "authentication_error" | "invalid_organization" => ErrorKind::Auth,
            "rate_limit_exceeded" | "insufficient_quota" => ErrorKind::RateLimit,
            "content_policy_violation" | "content_filter" => ErrorKind::SafetyBlock,
            "model_not_found" | "invalid_request_error" => ErrorKind::BadRequest,
            "server_error" => ErrorKind::Upstream5xx,
            _ => return None,
        },
        ProviderKind::Anthropic => match code {
            "authentication_error" | "permission_error" => ErrorKind::Auth,
            "rate_limit_error" => ErrorKind::RateLimit,
            "invalid_request_error" | "not_found_error" | "request_too_large" => {
                ErrorKind::BadRequest
            }
            "overloaded_error" | "api_error" => ErrorKind::Upstream5xx,
            _ => return None,
        },
        ProviderKind::Vertex => match code {
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => ErrorKind::Auth,
            "RESOURCE_EXHAUSTED" => ErrorKind::RateLimit,
            "INVALID_ARGUMENT" | "NOT_FOUND" | "FAILED_PRECONDITION" => ErrorKind::BadRequest,
            "DEADLINE_EXCEEDED" => ErrorKind::Timeout,
            "UNAVAILABLE" | "INTERNAL" => ErrorKind::Upstream5xx,
            _ => return None,
        },
    };
    Some(mapped)
}

/// HTTP status → [`ErrorKind`] fallback table, shared by all kinds.
fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Auth,
        400 | 404 | 405 | 422 => ErrorKind::BadRequest,
        408 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::Upstream5xx,
        _ => ErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_fallback_table() {
        assert_eq!(classify_status(401), ErrorKind::Auth);
        assert_eq!(classify_status(403), ErrorKind::Auth);
        assert_eq!(classify_status(400), ErrorKind::BadRequest);
        assert_eq!(classify_status(404), ErrorKind::BadRequest);
        assert_eq!(classify_status(408), ErrorKind::Timeout);
        assert_eq!(classify_status(429), ErrorKind::RateLimit);
        assert_eq!(classify_status(500), ErrorKind::Upstream5xx);
        assert_eq!(classify_status(503), ErrorKind::Upstream5xx);
        assert_eq!(classify_status(302), ErrorKind::Unknown);
    }

    #[test]
    fn test_provider_code_takes_precedence() {
        assert_eq!(
            classify_code(ProviderKind::Anthropic, "overloaded_error"),
            Some(ErrorKind::Upstream5xx)
        );
        assert_eq!(
            classify_code(ProviderKind::OpenAi, "content_policy_violation"),
            Some(ErrorKind::SafetyBlock)
        );
        assert_eq!(
            classify_code(ProviderKind::Vertex, "RESOURCE_EXHAUSTED"),
            Some(ErrorKind::RateLimit)
        );
        assert_eq!(classify_code(ProviderKind::OpenAi, "novel_code"), None);
    }

    #[test]
    fn test_error_field_extraction() {
        let openai = serde_json::json!({
            "error": {"message": "bad key", "type": "invalid_request_error", "code": "invalid_api_key"}
        });
        let (msg, code) = extract_error_fields(ProviderKind::OpenAi, &openai);
        assert_eq!(msg.as_deref(), Some("bad key"));
        assert_eq!(code.as_deref(), Some("invalid_api_key"));

        let anthropic = serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        });
        let (msg, code) = extract_error_fields(ProviderKind::Anthropic, &anthropic);
        assert_eq!(msg.as_deref(), Some("Overloaded"));
        assert_eq!(code.as_deref(), Some("overloaded_error"));

        let vertex = serde_json::json!({
            "error": {"code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED"}
        });
        let (msg, code) = extract_error_fields(ProviderKind::Vertex, &vertex);
        assert_eq!(msg.as_deref(), Some("quota"));
        assert_eq!(code.as_deref(), Some("RESOURCE_EXHAUSTED"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(400));
    }
}
