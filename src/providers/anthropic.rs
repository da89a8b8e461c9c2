//! Anthropic Messages adapter.
//!
//! Translation notes: Anthropic takes all system prompts joined into one
//! `system` field, requires `max_tokens`, and authenticates with `x-api-key`
//! plus a pinned `anthropic-version` header rather than a bearer token.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use crate::canonical::{
    CanonicalRequest, CanonicalResponse, Choice, FinishReason, Message, Role, StreamEvent, Usage,
};
use crate::config::ProviderConfig;
use crate::providers::{
    build_http_client, resolve_api_key, AdapterError, EmbeddingsRequest, EmbeddingsResponse,
    EventStream, HealthStatus, ProviderAdapter, SseLineBuffer,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    name: String,
    region: Option<String>,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    models: Vec<String>,
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            region: config.region.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: resolve_api_key(config),
            client: build_http_client(config)?,
            models: config.models.iter().map(|m| m.id.clone()).collect(),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    fn build_body(
        &self,
        request: &CanonicalRequest,
        model: &str,
        stream: bool,
    ) -> serde_json::Value {
        // All system turns collapse into the single system field.
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                serde_json::json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(stop) = &request.stop {
            if !stop.is_empty() {
                body["stop_sequences"] = serde_json::json!(stop);
            }
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

fn parse_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "refusal" => FinishReason::ContentFilter,
        // end_turn and stop_sequence are both ordinary stops.
        _ => FinishReason::Stop,
    }
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    #[serde(default)]
    model: Option<String>,
    content: Vec<WireContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: WireUsage,
}

/// Streaming events, tagged by `type` in each SSE data payload.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
    MessageStart {
        message: WireMessageStart,
    },
    ContentBlockStart {},
    ContentBlockDelta {
        delta: WireBlockDelta,
    },
    ContentBlockStop {},
    MessageDelta {
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<WireDeltaUsage>,
    },
    MessageStop,
    Ping,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessageStart {
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn chat_completion(
        &self,
        request: &CanonicalRequest,
        model: &str,
    ) -> Result<CanonicalResponse, AdapterError> {
        let body = self.build_body(request, model, false);
        let response = self
            .authorized(self.client.post(self.messages_url()))
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), &text));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("response parse: {e}")))?;

        let text = wire
            .content
            .iter()
            .filter_map(|block| match block {
                WireContentBlock::Text { text } => Some(text.as_str()),
                WireContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CanonicalResponse {
            id: wire.id,
            created_at: chrono::Utc::now(),
            model_resolved: wire.model.unwrap_or_else(|| model.to_string()),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: text,
                },
                finish_reason: wire
                    .stop_reason
                    .as_deref()
                    .map(parse_stop_reason)
                    .unwrap_or(FinishReason::Stop),
            }],
            usage: Usage::new(wire.usage.input_tokens, wire.usage.output_tokens),
        })
    }

    async fn chat_completion_stream(
        &self,
        request: &CanonicalRequest,
        model: &str,
    ) -> Result<EventStream, AdapterError> {
        let body = self.build_body(request, model, true);
        let response = self
            .authorized(self.client.post(self.messages_url()))
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), &text));
        }

        let mut upstream = Box::pin(response.bytes_stream());
        let stream = async_stream::stream! {
            let mut buffer = SseLineBuffer::new();
            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;
            let mut pending_finish: Option<FinishReason> = None;
            let mut sent_role = false;

            while let Some(chunk) = upstream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(AdapterError::from_transport(e));
                        return;
                    }
                };
                buffer.push(&bytes);

                while let Some(data) = buffer.next_data() {
                    let event: WireStreamEvent = match serde_json::from_str(&data) {
                        Ok(event) => event,
                        Err(e) => {
                            yield Err(AdapterError::Protocol(format!("stream parse: {e}")));
                            return;
                        }
                    };
                    match event {
                        WireStreamEvent::MessageStart { message } => {
                            input_tokens = message.usage.input_tokens;
                            output_tokens = message.usage.output_tokens;
                            if !sent_role {
                                sent_role = true;
                                yield Ok(StreamEvent::role(Role::Assistant));
                            }
                        }
                        WireStreamEvent::ContentBlockDelta { delta } => {
                            if let WireBlockDelta::TextDelta { text } = delta {
                                if !text.is_empty() {
                                    yield Ok(StreamEvent::delta(text));
                                }
                            }
                        }
                        WireStreamEvent::MessageDelta { delta, usage } => {
                            if let Some(usage) = usage {
                                output_tokens = usage.output_tokens;
                            }
                            if let Some(reason) = delta.stop_reason.as_deref() {
                                pending_finish = Some(parse_stop_reason(reason));
                            }
                        }
                        WireStreamEvent::MessageStop => {
                            yield Ok(StreamEvent::finish(
                                pending_finish.take().unwrap_or(FinishReason::Stop),
                                Some(Usage::new(input_tokens, output_tokens)),
                            ));
                            return;
                        }
                        WireStreamEvent::ContentBlockStart {}
                        | WireStreamEvent::ContentBlockStop {}
                        | WireStreamEvent::Ping
                        | WireStreamEvent::Other => {}
                    }
                }
            }

            // Upstream closed without message_stop; terminate exactly once.
            yield Ok(StreamEvent::finish(
                pending_finish.take().unwrap_or(FinishReason::Stop),
                Some(Usage::new(input_tokens, output_tokens)),
            ));
        };
        Ok(Box::pin(stream))
    }

    async fn embeddings(
        &self,
        _request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, AdapterError> {
        Err(AdapterError::Permanent(
            "anthropic exposes no embeddings endpoint".to_string(),
        ))
    }

    async fn health_check(&self) -> HealthStatus {
        // Minimal request; 4xx still proves the endpoint is reachable and
        // terminating TLS, which is what the breaker probe needs.
        match self
            .authorized(self.client.post(self.messages_url()))
            .json(&serde_json::json!({
                "model": self.models.first().cloned().unwrap_or_default(),
                "max_tokens": 1,
                "messages": [{ "role": "user", "content": "ping" }],
            }))
            .send()
            .await
        {
            Ok(response) if response.status().is_server_error() => HealthStatus {
                healthy: false,
                detail: Some(format!("HTTP {}", response.status())),
            },
            Ok(_) => HealthStatus {
                healthy: true,
                detail: None,
            },
            Err(e) => HealthStatus {
                healthy: false,
                detail: Some(e.to_string()),
            },
        }
    }
}
