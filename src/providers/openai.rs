//! OpenAI adapter.
//!
//! Also serves any endpoint speaking the OpenAI wire schema (Azure OpenAI,
//! vLLM, Ollama, gateway-style aggregators) via a `base_url` override.

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    name: String,
    region: Option<String>,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    models: Vec<String>,
}

impl OpenAiAdapter {
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

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn build_body(
        &self,
        request: &CanonicalRequest,
        model: &str,
        stream: bool,
    ) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        if let Some(max) = request.max_output_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(stop) = &request.stop {
            if !stop.is_empty() {
                body["stop"] = serde_json::json!(stop);
            }
        }
        if stream {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" | "max_tokens" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(wire: WireUsage) -> Self {
        Usage::new(wire.prompt_tokens, wire.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: Option<u32>,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Option<Vec<WireStreamChoice>>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingsResponse {
    data: Vec<WireEmbedding>,
    #[serde(default)]
    usage: Option<WireEmbeddingsUsage>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingsUsage {
    #[serde(default)]
    total_tokens: u32,
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
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
            .authorized(self.client.post(self.url("chat/completions")))
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

        let choices = wire
            .choices
            .into_iter()
            .enumerate()
            .map(|(i, choice)| Choice {
                index: choice.index.unwrap_or(i as u32),
                message: Message {
                    role: choice
                        .message
                        .role
                        .as_deref()
                        .map(Role::parse)
                        .unwrap_or(Role::Assistant),
                    content: choice.message.content.unwrap_or_default(),
                },
                finish_reason: choice
                    .finish_reason
                    .as_deref()
                    .map(parse_finish_reason)
                    .unwrap_or(FinishReason::Stop),
            })
            .collect();

        Ok(CanonicalResponse {
            id: wire
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            created_at: chrono::Utc::now(),
            model_resolved: wire.model.unwrap_or_else(|| model.to_string()),
            choices,
            usage: wire.usage.map(Into::into).unwrap_or_default(),
        })
    }

    async fn chat_completion_stream(
        &self,
        request: &CanonicalRequest,
        model: &str,
    ) -> Result<EventStream, AdapterError> {
        let body = self.build_body(request, model, true);
        let response = self
            .authorized(self.client.post(self.url("chat/completions")))
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
            let mut pending_usage: Option<Usage> = None;
            let mut pending_finish: Option<FinishReason> = None;

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
                    if data == "[DONE]" {
                        yield Ok(StreamEvent::finish(
                            pending_finish.take().unwrap_or(FinishReason::Stop),
                            pending_usage.take(),
                        ));
                        return;
                    }
                    let parsed: WireChunk = match serde_json::from_str(&data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            yield Err(AdapterError::Protocol(format!("stream parse: {e}")));
                            return;
                        }
                    };
                    if let Some(usage) = parsed.usage {
                        pending_usage = Some(usage.into());
                    }
                    for choice in parsed.choices.unwrap_or_default() {
                        if let Some(delta) = choice.delta {
                            if let Some(role) = delta.role.as_deref() {
                                yield Ok(StreamEvent::role(Role::parse(role)));
                            }
                            if let Some(content) = delta.content {
                                if !content.is_empty() {
                                    yield Ok(StreamEvent::delta(content));
                                }
                            }
                        }
                        if let Some(reason) = choice.finish_reason.as_deref() {
                            // Held until [DONE] so the final event can carry
                            // the usage chunk that arrives after it.
                            pending_finish = Some(parse_finish_reason(reason));
                        }
                    }
                }
            }

            // Upstream closed without [DONE]; still terminate exactly once.
            yield Ok(StreamEvent::finish(
                pending_finish.take().unwrap_or(FinishReason::Stop),
                pending_usage.take(),
            ));
        };
        Ok(Box::pin(stream))
    }

    async fn embeddings(
        &self,
        request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, AdapterError> {
        let body = serde_json::json!({
            "model": request.model,
            "input": request.input,
        });
        let response = self
            .authorized(self.client.post(self.url("embeddings")))
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), &text));
        }

        let wire: WireEmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("embeddings parse: {e}")))?;

        Ok(EmbeddingsResponse {
            vectors: wire.data.into_iter().map(|d| d.embedding).collect(),
            total_tokens: wire.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }

    async fn health_check(&self) -> HealthStatus {
        match self
            .authorized(self.client.get(self.url("models")))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => HealthStatus {
                healthy: true,
                detail: None,
            },
            Ok(response) => HealthStatus {
                healthy: false,
                detail: Some(format!("HTTP {}", response.status())),
            },
            Err(e) => HealthStatus {
                healthy: false,
                detail: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::RequestMetadata;

    fn adapter() -> OpenAiAdapter {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "name": "openai",
            "kind": "open_ai",
            "models": [
                { "id": "gpt-4o", "family": "frontier", "in_rate": 2.5, "out_rate": 10.0 }
            ]
        }))
        .unwrap();
        OpenAiAdapter::new(&config).unwrap()
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            team_id: None,
            model_family: "frontier".into(),
            messages: vec![
                Message {
                    role: Role::System,
                    content: "be brief".into(),
                },
                Message {
                    role: Role::User,
                    content: "hello".into(),
                },
            ],
            max_output_tokens: Some(256),
            temperature: Some(0.2),
            top_p: None,
            stop: Some(vec!["\n\n".into()]),
            stream: false,
            metadata: RequestMetadata::default(),
        }
    }

    #[test]
    fn test_body_translation() {
        let body = adapter().build_body(&request(), "gpt-4o", false);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stop"][0], "\n\n");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_stream_body_requests_usage() {
        let body = adapter().build_body(&request(), "gpt-4o", true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_finish_reason_closed_set() {
        assert_eq!(parse_finish_reason("stop"), FinishReason::Stop);
        assert_eq!(parse_finish_reason("length"), FinishReason::Length);
        assert_eq!(
            parse_finish_reason("content_filter"),
            FinishReason::ContentFilter
        );
        assert_eq!(parse_finish_reason("tool_calls"), FinishReason::Stop);
    }

    #[test]
    fn test_wire_response_parses() {
        let raw = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-2024",
            "choices": [
                { "index": 0,
                  "message": { "role": "assistant", "content": "hi there" },
                  "finish_reason": "stop" }
            ],
            "usage": { "prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12 }
        });
        let wire: WireResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(wire.choices[0].message.content.as_deref(), Some("hi there"));
        assert_eq!(wire.usage.unwrap().completion_tokens, 2);
    }

    #[test]
    fn test_wire_chunk_parses_usage_only_frame() {
        // The final frame before [DONE] has empty choices and the usage.
        let raw = serde_json::json!({
            "choices": [],
            "usage": { "prompt_tokens": 7, "completion_tokens": 21, "total_tokens": 28 }
        });
        let chunk: WireChunk = serde_json::from_value(raw).unwrap();
        assert!(chunk.choices.unwrap().is_empty());
        assert_eq!(chunk.usage.unwrap().completion_tokens, 21);
    }
}
