//! # Neutral Request/Response Types
//!
//! This module defines the provider-neutral data model shared by every
//! adapter. A caller builds a [`ChatRequest`] once; each adapter translates it
//! into its provider's native wire shape and translates the native response
//! back into a [`ChatResponse`].
//!
//! ## Messages
//!
//! Conversations are ordered sequences of [`Message`] values with four roles:
//!
//! - **System**: instructions and context for the model
//! - **User**: end-user input
//! - **Assistant**: model output
//! - **Tool**: tool/function results fed back to the model
//!
//! ```rust
//! use llm_dispatch::models::{ChatRequest, Message};
//!
//! let request = ChatRequest {
//!     model: "gpt-4o".to_string(),
//!     messages: vec![
//!         Message::system("You are a helpful assistant."),
//!         Message::user("Hello!"),
//!     ],
//!     temperature: Some(0.7),
//!     max_tokens: Some(256),
//!     ..Default::default()
//! };
//! request.validate()?;
//! ```
//!
//! ## Validation
//!
//! [`ChatRequest::validate`] enforces the request contract up front so that a
//! malformed request fails fast, before any provider or circuit breaker is
//! touched. Parameter ranges follow the common provider envelope: temperature
//! in `[0, 2]`, nucleus sampling in `[0, 1]`, token caps strictly positive.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Request validation failure.
///
/// Returned before any provider is contacted; never recorded against a
/// circuit breaker.
#[derive(Debug, Clone, Error)]
#[error("invalid request: {message}")]
pub struct ValidationError {
    /// Human-readable description of the violated constraint
    pub message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions and context
    System,
    /// User input and questions
    User,
    /// Model responses and completions
    Assistant,
    /// Tool/function results
    Tool,
}

/// A single message in a conversation.
///
/// Immutable once constructed; the convenience constructors cover the common
/// cases.
///
/// # Example
///
/// ```rust
/// let user_msg = Message::user("What's the weather like?");
/// let system_msg = Message::system("You are a helpful assistant.");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content of the message
    pub content: String,
    /// Optional name for the message sender
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Opaque tool-call payload. Forwarded verbatim where the provider's
    /// wire shape takes one (the tool-call list on OpenAI-style assistant
    /// messages, the call id on OpenAI-style tool results) and dropped for
    /// providers whose native tool encoding cannot accept it opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<serde_json::Value>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
            tool_call: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
            tool_call: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_call: None,
        }
    }
}

/// Provider-neutral chat-completion request.
///
/// Fields a provider does not support are dropped by its normalizer; the
/// `extra` map is passed through verbatim for provider-specific knobs.
///
/// # Example
///
/// ```rust
/// let request = ChatRequest {
///     model: "claude-3-5-sonnet".to_string(),
///     messages: vec![Message::user("ping")],
///     temperature: Some(0.2),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// The model to use for completion
    pub model: String,
    /// The messages to generate a response for
    pub messages: Vec<Message>,
    /// Controls randomness (0.0 to 2.0); normalizers default to 0.7
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum number of tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Nucleus sampling cutoff (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k sampling cutoff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Sequences that stop generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Streaming flag; accepted for interface compatibility, ignored by the
    /// dispatcher
    #[serde(default)]
    pub stream: bool,
    /// Tools available to the model, carried through opaquely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    /// Provider-specific passthrough parameters merged into the native request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChatRequest {
    /// Validate the request against the neutral contract.
    ///
    /// Checks message shape (non-empty, first non-system message is a user
    /// message) and parameter ranges. Runs before any provider is selected.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.model.trim().is_empty() {
            return Err(ValidationError::new("model must not be empty"));
        }
        if self.messages.is_empty() {
            return Err(ValidationError::new(
                "request must contain at least one message",
            ));
        }
        if let Some(first) = self.messages.iter().find(|m| m.role != Role::System) {
            if first.role != Role::User {
                return Err(ValidationError::new(
                    "first non-system message must have role 'user'",
                ));
            }
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ValidationError::new(format!(
                    "temperature must be within [0.0, 2.0], got {t}"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ValidationError::new(format!(
                    "top_p must be within [0.0, 1.0], got {p}"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ValidationError::new("max_tokens must be positive"));
        }
        if self.top_k == Some(0) {
            return Err(ValidationError::new("top_k must be positive"));
        }
        Ok(())
    }
}

/// Token usage statistics for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Build usage counts, zero-filling missing fields.
    ///
    /// When the provider omits a total it is derived from the two parts.
    pub fn new(prompt: Option<u32>, completion: Option<u32>, total: Option<u32>) -> Self {
        let prompt_tokens = prompt.unwrap_or(0);
        let completion_tokens = completion.unwrap_or(0);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total.unwrap_or(prompt_tokens + completion_tokens),
        }
    }
}

/// Why generation stopped, mapped into a closed set.
///
/// Provider codes with no neutral equivalent collapse to [`FinishReason::Other`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of generation or a stop sequence
    Stop,
    /// Token cap reached
    Length,
    /// Output suppressed by the provider's content policy
    ContentFilter,
    /// The model requested tool invocation
    ToolCalls,
    /// Unrecognized provider-specific code
    Other,
}

/// Provider-neutral chat-completion response.
///
/// `provider` and `latency_ms` are stamped by the dispatcher once the serving
/// adapter is known; `metadata` preserves provider-native extras (request
/// ids, safety ratings, stop sequences) verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Primary text content of the completion
    pub content: String,
    /// Model name as returned by the provider
    pub model: String,
    /// Name of the provider adapter that served the request
    pub provider: String,
    /// Token usage statistics
    pub usage: TokenUsage,
    /// Why generation stopped
    pub finish_reason: FinishReason,
    /// Provider-native extras preserved verbatim
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Wall-clock latency of the serving attempt in milliseconds
    pub latency_ms: u64,
}
