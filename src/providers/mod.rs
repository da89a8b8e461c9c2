//! Provider adapter layer.
//!
//! One uniform capability per provider: chat completion (blocking and
//! streaming), embeddings and a health probe. Adapters own their pooled
//! HTTP client, translate the canonical schema to the provider wire format
//! and back, and collapse provider-specific stop reasons into the closed
//! `FinishReason` set. Credentials are resolved from the environment at
//! construction and never logged.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::canonical::{CanonicalRequest, CanonicalResponse, StreamEvent};
use crate::config::{GatewayConfig, ProviderConfig, ProviderKind};
use crate::error::GatewayError;

/// Failure classes drive retry policy: transient and protocol errors may
/// fail over, permanent errors never do.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream transient: {0}")]
    Transient(String),
    #[error("upstream permanent: {0}")]
    Permanent(String),
    #[error("upstream protocol: {0}")]
    Protocol(String),
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_) | AdapterError::Protocol(_))
    }

    /// Classify a reqwest transport failure. Connect errors and timeouts
    /// are transient; anything else on the wire is too.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            AdapterError::Transient(format!("connect/timeout: {err}"))
        } else {
            AdapterError::Transient(err.to_string())
        }
    }

    /// Classify a non-success HTTP status. The error body is truncated so
    /// provider responses cannot flood logs or envelopes.
    pub fn from_status(status: u16, body: &str) -> Self {
        let preview: String = body.chars().take(300).collect();
        if status >= 500 {
            AdapterError::Transient(format!("HTTP {status}: {preview}"))
        } else {
            AdapterError::Permanent(format!("HTTP {status}: {preview}"))
        }
    }
}

impl From<AdapterError> for GatewayError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transient(msg) => GatewayError::UpstreamTransient(msg),
            AdapterError::Permanent(msg) => GatewayError::UpstreamPermanent(msg),
            AdapterError::Protocol(msg) => GatewayError::UpstreamProtocol(msg),
            AdapterError::Cancelled => GatewayError::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingsResponse {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: u32,
}

/// Lazy, single-pass, finite event sequence. Exactly one event carries a
/// `finish_reason`; dropping the stream cancels the upstream request.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AdapterError>> + Send>>;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn region(&self) -> Option<&str>;

    /// Model ids this adapter serves, from configuration.
    fn models(&self) -> Vec<String>;

    async fn chat_completion(
        &self,
        request: &CanonicalRequest,
        model: &str,
    ) -> Result<CanonicalResponse, AdapterError>;

    async fn chat_completion_stream(
        &self,
        request: &CanonicalRequest,
        model: &str,
    ) -> Result<EventStream, AdapterError>;

    async fn embeddings(
        &self,
        request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, AdapterError>;

    async fn health_check(&self) -> HealthStatus;
}

/// Client name announced to every provider.
const CLIENT_NAME: &str = "alfred-gateway";

/// Shared pooled client construction: keep-alive with a per-host idle cap
/// and the provider's configured timeouts. The total timeout doubles as the
/// wall-clock bound on streamed responses.
pub(crate) fn build_http_client(config: &ProviderConfig) -> anyhow::Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        "x-client-name",
        reqwest::header::HeaderValue::from_static(CLIENT_NAME),
    );
    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?)
}

pub(crate) fn resolve_api_key(config: &ProviderConfig) -> Option<String> {
    config
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
}

/// Buffered SSE line splitter for upstream byte streams. Collects chunks
/// and yields complete `data:` payloads in arrival order.
pub(crate) struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Next complete `data:` payload, if a full line is buffered.
    pub fn next_data(&mut self) -> Option<String> {
        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim().to_string();
            self.buffer = self.buffer[line_end + 1..].to_string();

            if line.is_empty() {
                continue;
            }
            if let Some(data) = line.strip_prefix("data: ") {
                return Some(data.to_string());
            }
            if let Some(data) = line.strip_prefix("data:") {
                return Some(data.trim_start().to_string());
            }
            // event:/id:/retry: framing lines carry nothing we meter.
        }
        None
    }
}

/// All adapters for one configuration snapshot, keyed by provider name.
pub struct AdapterRegistry {
    by_name: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        let mut by_name: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        for provider in &config.providers {
            let adapter: Arc<dyn ProviderAdapter> = match provider.kind {
                ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => {
                    Arc::new(openai::OpenAiAdapter::new(provider)?)
                }
                ProviderKind::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(provider)?),
                ProviderKind::Gemini => Arc::new(gemini::GeminiAdapter::new(provider)?),
            };
            by_name.insert(provider.name.clone(), adapter);
        }
        Ok(Self { by_name })
    }

    /// Registry over pre-built adapters, keyed by their names. Lets harness
    /// code swap in stub providers without a config document.
    pub fn from_adapters(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        Self {
            by_name: adapters
                .into_iter()
                .map(|a| (a.name().to_string(), a))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ProviderAdapter>)> {
        self.by_name.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            AdapterError::from_status(503, "overloaded"),
            AdapterError::Transient(_)
        ));
        assert!(matches!(
            AdapterError::from_status(401, "bad key"),
            AdapterError::Permanent(_)
        ));
        assert!(AdapterError::from_status(502, "").retryable());
        assert!(!AdapterError::from_status(400, "").retryable());
        assert!(AdapterError::Protocol("truncated".into()).retryable());
    }

    #[test]
    fn test_sse_line_buffer_reassembles_split_chunks() {
        let mut buffer = SseLineBuffer::new();
        buffer.push(b"data: {\"a\":");
        assert_eq!(buffer.next_data(), None);
        buffer.push(b" 1}\n\ndata: [DONE]\n");
        assert_eq!(buffer.next_data(), Some("{\"a\": 1}".to_string()));
        assert_eq!(buffer.next_data(), Some("[DONE]".to_string()));
        assert_eq!(buffer.next_data(), None);
    }

    #[test]
    fn test_sse_line_buffer_skips_framing_lines() {
        let mut buffer = SseLineBuffer::new();
        buffer.push(b"event: message_start\nid: 7\ndata: {}\n");
        assert_eq!(buffer.next_data(), Some("{}".to_string()));
    }

    #[test]
    fn test_error_body_truncated() {
        let long_body = "x".repeat(10_000);
        let err = AdapterError::from_status(500, &long_body);
        assert!(err.to_string().len() < 400);
    }
}
