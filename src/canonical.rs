//! Canonical request/response model.
//!
//! Everything inside the gateway core speaks this schema. Provider adapters
//! translate to and from their wire formats at the boundary; vendor-specific
//! fields never appear here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Ingress role names outside the canonical set collapse to `user`.
    pub fn parse(s: &str) -> Role {
        match s {
            "system" | "developer" => Role::System,
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    #[default]
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMode {
    Strict,
    #[default]
    Standard,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub project_id: Option<String>,
    pub priority: Priority,
    pub residency_region: Option<String>,
    pub privacy_mode: PrivacyMode,
}

/// Normalized inbound request, scoped to a tenant.
///
/// `model_family` is a capability tag, not a concrete SKU; the router picks
/// the `(provider, model)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub team_id: Option<String>,
    pub model_family: String,
    pub messages: Vec<Message>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub stream: bool,
    pub metadata: RequestMetadata,
}

impl CanonicalRequest {
    /// Full prompt text, used for token estimation and cache embeddings.
    pub fn prompt_text(&self) -> String {
        let mut out = String::new();
        for msg in &self.messages {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(msg.role.as_str());
            out.push_str(": ");
            out.push_str(&msg.content);
        }
        out
    }
}

/// Closed set of completion termination causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
            FinishReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub model_resolved: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl CanonicalResponse {
    /// Concatenated assistant text across choices.
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .map(|c| c.message.content.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// One element of a streaming response.
///
/// Streams are lazy, single-pass and finite; exactly one event carries a
/// `finish_reason`, and nothing follows it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamEvent {
    pub delta_text: Option<String>,
    pub role: Option<Role>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl StreamEvent {
    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            ..Default::default()
        }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta_text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason, usage: Option<Usage>) -> Self {
        Self {
            finish_reason: Some(reason),
            usage,
            ..Default::default()
        }
    }

    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }
}
