//! Google Gemini adapter (generateContent surface).
//!
//! Translation notes: roles are `user`/`model`, system prompts ride in
//! `systemInstruction`, generation parameters nest under `generationConfig`,
//! and the API key travels as a query parameter.

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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiAdapter {
    name: String,
    region: Option<String>,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    models: Vec<String>,
}

impl GeminiAdapter {
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

    fn url(&self, model: &str, method: &str, sse: bool) -> String {
        let key = self.api_key.as_deref().unwrap_or_default();
        if sse {
            format!(
                "{}/v1beta/models/{}:{}?alt=sse&key={}",
                self.base_url, model, method, key
            )
        } else {
            format!(
                "{}/v1beta/models/{}:{}?key={}",
                self.base_url, model, method, key
            )
        }
    }

    fn build_body(&self, request: &CanonicalRequest) -> serde_json::Value {
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let contents: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation = serde_json::Map::new();
        if let Some(max) = request.max_output_tokens {
            generation.insert("maxOutputTokens".to_string(), serde_json::json!(max));
        }
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".to_string(), serde_json::json!(top_p));
        }
        if let Some(stop) = &request.stop {
            if !stop.is_empty() {
                generation.insert("stopSequences".to_string(), serde_json::json!(stop));
            }
        }

        let mut body = serde_json::json!({ "contents": contents });
        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        if !generation.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation);
        }
        body
    }
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
            FinishReason::ContentFilter
        }
        "STOP" => FinishReason::Stop,
        _ => FinishReason::Stop,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

impl WireCandidate {
    fn text(&self) -> String {
        self.content
            .as_ref()
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct WireBatchEmbeddings {
    embeddings: Vec<WireEmbeddingValues>,
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
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
        let body = self.build_body(request);
        let response = self
            .client
            .post(self.url(model, "generateContent", false))
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
            .candidates
            .iter()
            .enumerate()
            .map(|(i, candidate)| Choice {
                index: i as u32,
                message: Message {
                    role: Role::Assistant,
                    content: candidate.text(),
                },
                finish_reason: candidate
                    .finish_reason
                    .as_deref()
                    .map(parse_finish_reason)
                    .unwrap_or(FinishReason::Stop),
            })
            .collect();

        let usage = wire
            .usage_metadata
            .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(CanonicalResponse {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now(),
            model_resolved: wire.model_version.unwrap_or_else(|| model.to_string()),
            choices,
            usage,
        })
    }

    async fn chat_completion_stream(
        &self,
        request: &CanonicalRequest,
        model: &str,
    ) -> Result<EventStream, AdapterError> {
        let body = self.build_body(request);
        let response = self
            .client
            .post(self.url(model, "streamGenerateContent", true))
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
            let mut usage: Option<Usage> = None;
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
                    let frame: WireResponse = match serde_json::from_str(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            yield Err(AdapterError::Protocol(format!("stream parse: {e}")));
                            return;
                        }
                    };
                    if let Some(meta) = frame.usage_metadata {
                        usage = Some(Usage::new(
                            meta.prompt_token_count,
                            meta.candidates_token_count,
                        ));
                    }
                    for candidate in &frame.candidates {
                        if !sent_role {
                            sent_role = true;
                            yield Ok(StreamEvent::role(Role::Assistant));
                        }
                        let text = candidate.text();
                        if !text.is_empty() {
                            yield Ok(StreamEvent::delta(text));
                        }
                        if let Some(reason) = candidate.finish_reason.as_deref() {
                            pending_finish = Some(parse_finish_reason(reason));
                        }
                    }
                }
            }

            yield Ok(StreamEvent::finish(
                pending_finish.take().unwrap_or(FinishReason::Stop),
                usage.take(),
            ));
        };
        Ok(Box::pin(stream))
    }

    async fn embeddings(
        &self,
        request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, AdapterError> {
        let requests: Vec<serde_json::Value> = request
            .input
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": format!("models/{}", request.model),
                    "content": { "parts": [{ "text": text }] },
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });

        let response = self
            .client
            .post(self.url(&request.model, "batchEmbedContents", false))
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), &text));
        }

        let wire: WireBatchEmbeddings = response
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("embeddings parse: {e}")))?;

        // No usage metadata on this surface; approximate for billing.
        let total_chars: usize = request.input.iter().map(|s| s.chars().count()).sum();
        Ok(EmbeddingsResponse {
            vectors: wire.embeddings.into_iter().map(|e| e.values).collect(),
            total_tokens: (total_chars as u32).div_ceil(4),
        })
    }

    async fn health_check(&self) -> HealthStatus {
        let url = format!(
            "{}/v1beta/models?key={}",
            self.base_url,
            self.api_key.as_deref().unwrap_or_default()
        );
        match self.client.get(url).send().await {
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

    fn adapter() -> GeminiAdapter {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "name": "gemini",
            "kind": "gemini",
            "models": [
                { "id": "gemini-2.0-flash", "family": "fast", "in_rate": 0.1, "out_rate": 0.4 }
            ]
        }))
        .unwrap();
        GeminiAdapter::new(&config).unwrap()
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            team_id: None,
            model_family: "fast".into(),
            messages: vec![
                Message {
                    role: Role::System,
                    content: "be brief".into(),
                },
                Message {
                    role: Role::User,
                    content: "hello".into(),
                },
                Message {
                    role: Role::Assistant,
                    content: "hi".into(),
                },
                Message {
                    role: Role::User,
                    content: "continue".into(),
                },
            ],
            max_output_tokens: Some(128),
            temperature: Some(0.5),
            top_p: None,
            stop: None,
            stream: false,
            metadata: RequestMetadata::default(),
        }
    }

    #[test]
    fn test_body_translation() {
        let body = adapter().build_body(&request());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 128);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(parse_finish_reason("STOP"), FinishReason::Stop);
        assert_eq!(parse_finish_reason("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(parse_finish_reason("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(parse_finish_reason("RECITATION"), FinishReason::ContentFilter);
        assert_eq!(parse_finish_reason("OTHER"), FinishReason::Stop);
    }

    #[test]
    fn test_wire_response_parses() {
        let wire: WireResponse = serde_json::from_value(serde_json::json!({
            "candidates": [
                { "content": { "role": "model", "parts": [{ "text": "Hello!" }] },
                  "finishReason": "STOP" }
            ],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 2 }
        }))
        .unwrap();
        assert_eq!(wire.candidates[0].text(), "Hello!");
        assert_eq!(wire.usage_metadata.unwrap().candidates_token_count, 2);
    }
}
