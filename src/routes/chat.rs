//! Chat completion ingress (OpenAI-compatible).
//!
//! Flow: rate limit → normalize → policy decision → semantic cache →
//! reserve credits → provider call with failover → settle → respond with
//! `alfred_usage` attached. Streaming requests hand off to the proxy in
//! [`super::streaming`] after the same pre-flight.
//!
//! Request and response bodies are never logged; billing uses token counts
//! and the journal only.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::AuthenticatedRequest;
use crate::breaker::CircuitBreaker;
use crate::cache;
use crate::canonical::{
    CanonicalRequest, CanonicalResponse, Message, RequestMetadata, Role, Usage,
};
use crate::config::Snapshot;
use crate::credits::Credits;
use crate::error::GatewayError;
use crate::guardrails;
use crate::metering;
use crate::pricing::{ModelEntry, ModelRef};
use crate::router::{self, RequestFacts};
use crate::wallet::ChargeScope;
use crate::AppState;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl WireMessage {
    /// Flatten string or multi-part content into plain text.
    fn text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

/// OpenAI-format request (what clients send)
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Option<serde_json::Value>,
    #[serde(default)]
    pub stream: Option<bool>,
}

fn canonicalize(
    auth: &AuthenticatedRequest,
    wire: CompletionRequest,
) -> Result<CanonicalRequest, GatewayError> {
    if wire.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }
    let messages: Vec<Message> = wire
        .messages
        .iter()
        .map(|m| Message {
            role: Role::parse(&m.role),
            content: m.text(),
        })
        .collect();

    let stop = match wire.stop {
        Some(serde_json::Value::String(s)) => Some(vec![s]),
        Some(serde_json::Value::Array(items)) => Some(
            items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        Some(serde_json::Value::Null) | None => None,
        Some(_) => {
            return Err(GatewayError::InvalidRequest(
                "stop must be a string or an array of strings".to_string(),
            ))
        }
    };

    Ok(CanonicalRequest {
        tenant_id: auth.tenant_id.clone(),
        user_id: auth.user_id.clone(),
        team_id: auth.team_id.clone(),
        model_family: wire.model,
        messages,
        max_output_tokens: wire.max_completion_tokens.or(wire.max_tokens),
        temperature: wire.temperature,
        top_p: wire.top_p,
        stop,
        stream: wire.stream.unwrap_or(false),
        metadata: RequestMetadata {
            project_id: auth.project_id.clone(),
            priority: auth.priority,
            residency_region: None,
            privacy_mode: auth.privacy_mode,
        },
    })
}

// =============================================================================
// Pre-flight shared by blocking and streaming paths
// =============================================================================

pub struct Prepared {
    pub snapshot: Arc<Snapshot>,
    pub request: CanonicalRequest,
    pub request_id: String,
    pub leaf_wallet: String,
    pub candidates: Vec<ModelRef>,
    pub reservation_id: String,
    pub prompt_tokens_estimate: u32,
    pub effective_cap: u32,
    pub transfer_funded: bool,
    pub cache_vector: Option<Vec<f32>>,
}

pub enum Preflight {
    /// Semantic cache hit; already billed at the access fee.
    CacheHit {
        response: CanonicalResponse,
        charged: Credits,
        remaining: Credits,
    },
    Proceed(Box<Prepared>),
}

/// Charge a flat fee through the normal reserve→settle path so it journals
/// like any other spend.
async fn charge_flat(
    state: &AppState,
    leaf_wallet: &str,
    fee: Credits,
    ref_id: &str,
    ttl: Duration,
) -> Result<Credits, GatewayError> {
    let reservation = state.wallets.reserve(leaf_wallet, fee, ttl).await?;
    Ok(state.wallets.settle(&reservation.id, fee, ref_id).await?)
}

pub async fn prepare(
    state: &Arc<AppState>,
    auth: &AuthenticatedRequest,
    mut request: CanonicalRequest,
) -> Result<Preflight, GatewayError> {
    let snapshot = state.gateway.current();
    let request_id = uuid::Uuid::new_v4().to_string();

    let scope = ChargeScope {
        tenant_id: &auth.tenant_id,
        team_id: auth.team_id.as_deref(),
        user_id: &auth.user_id,
        project_id: auth.project_id.as_deref(),
    };
    let leaf_wallet = state.wallets.ensure_chain(&scope, &snapshot.config.wallet);
    let wallet_view = state.wallets.snapshot(&leaf_wallet).await?;

    let residency = snapshot
        .config
        .api_keys
        .iter()
        .find(|k| k.tenant_id == auth.tenant_id && k.user_id == auth.user_id)
        .and_then(|k| k.residency_region.clone());
    request.metadata.residency_region = residency.clone();

    let facts = RequestFacts {
        tenant_id: &auth.tenant_id,
        team_id: auth.team_id.as_deref(),
        roles: &auth.roles,
        privacy_strict: auth.privacy_strict(),
        priority_critical: auth.priority == crate::canonical::Priority::Critical,
        residency_region: residency.as_deref(),
        mfa_verified: auth.mfa_verified,
        available: wallet_view.available,
    };

    let decision = match router::decide(&snapshot, &request, &facts, chrono::Utc::now()) {
        Ok(decision) => decision,
        Err(err) => {
            if matches!(err, GatewayError::Forbidden(_)) {
                state
                    .audit
                    .record_block(&leaf_wallet, &request_id, err.code());
            }
            return Err(err);
        }
    };

    // Semantic cache: bounded embedding lookup, skipped entirely under
    // strict privacy.
    let cache_config = &snapshot.config.cache;
    let mut cache_vector = None;
    if cache_config.enabled && !auth.privacy_strict() {
        if let (Some(provider), Some(model)) = (
            cache_config.embeddings_provider.as_deref(),
            cache_config.embeddings_model.as_deref(),
        ) {
            if let Some(adapter) = snapshot.adapters.get(provider) {
                cache_vector = cache::embed_prompt(
                    &adapter,
                    model,
                    &request.prompt_text(),
                    Duration::from_millis(cache_config.embed_timeout_ms),
                )
                .await;
            }
        }

        if let Some(vector) = &cache_vector {
            if let Some(cached) = state.cache.lookup(
                &auth.tenant_id,
                &request.model_family,
                vector,
                cache_config.similarity_threshold,
            ) {
                let fee = Credits::from_decimal(cache_config.access_fee_credits);
                let ttl = Duration::from_secs(snapshot.config.wallet.reservation_ttl_secs);
                let charged = charge_flat(state, &leaf_wallet, fee, &request_id, ttl).await?;
                let remaining = state.wallets.snapshot(&leaf_wallet).await?.balance;
                return Ok(Preflight::CacheHit {
                    response: cached,
                    charged,
                    remaining,
                });
            }
        }
    }

    let primary = snapshot
        .pricing
        .get_ref(&decision.candidates[0])
        .ok_or_else(|| GatewayError::InvalidRequest("no routable model".to_string()))?;

    let transfer_funded = wallet_view.transferred_in > Credits::ZERO;
    let effective_cap = guardrails::effective_output_cap(
        request.max_output_tokens,
        primary.max_output_tokens,
        &snapshot.config.guardrails,
        transfer_funded,
    );
    request.max_output_tokens = Some(effective_cap);

    let counter = state.tokenizers.resolve(&primary.tokenizer);
    let estimate = metering::estimate(
        counter,
        primary,
        &request,
        snapshot.config.guardrails.policy_max_output_tokens,
    );
    let reserve_amount = estimate.max_cost(primary);
    let ttl = Duration::from_secs(snapshot.config.wallet.reservation_ttl_secs);

    let reservation = match state.wallets.reserve(&leaf_wallet, reserve_amount, ttl).await {
        Ok(reservation) => reservation,
        Err(err) => {
            let gateway_err = GatewayError::from(err);
            if matches!(gateway_err, GatewayError::BudgetExhausted { .. }) {
                state
                    .audit
                    .record_block(&leaf_wallet, &request_id, gateway_err.code());
            }
            return Err(gateway_err);
        }
    };

    Ok(Preflight::Proceed(Box::new(Prepared {
        snapshot,
        request,
        request_id,
        leaf_wallet,
        candidates: decision.candidates,
        reservation_id: reservation.id,
        prompt_tokens_estimate: estimate.prompt_tokens,
        effective_cap,
        transfer_funded,
        cache_vector,
    })))
}

// =============================================================================
// Response shaping
// =============================================================================

pub fn alfred_usage_json(
    charged: Credits,
    remaining: Credits,
    usd_per_credit: f64,
) -> serde_json::Value {
    serde_json::json!({
        "credits_charged": charged.to_decimal(),
        "remaining_balance": remaining.to_decimal(),
        "cost_usd": charged.to_usd(usd_per_credit),
    })
}

pub fn openai_response_json(
    response: &CanonicalResponse,
    alfred_usage: serde_json::Value,
) -> serde_json::Value {
    let choices: Vec<serde_json::Value> = response
        .choices
        .iter()
        .map(|c| {
            serde_json::json!({
                "index": c.index,
                "message": {
                    "role": c.message.role.as_str(),
                    "content": c.message.content,
                },
                "finish_reason": c.finish_reason.as_str(),
            })
        })
        .collect();

    serde_json::json!({
        "id": response.id,
        "object": "chat.completion",
        "created": response.created_at.timestamp(),
        "model": response.model_resolved,
        "choices": choices,
        "usage": {
            "prompt_tokens": response.usage.prompt_tokens,
            "completion_tokens": response.usage.completion_tokens,
            "total_tokens": response.usage.total_tokens,
        },
        "alfred_usage": alfred_usage,
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedRequest,
    Json(wire): Json<CompletionRequest>,
) -> Result<Response, GatewayError> {
    let snapshot = state.gateway.current();
    state
        .limiter
        .try_acquire(&auth.tenant_id, "chat", &snapshot.config.rate_limit)?;
    drop(snapshot);

    let canonical = canonicalize(&auth, wire)?;
    let wants_stream = canonical.stream;

    match prepare(&state, &auth, canonical).await? {
        Preflight::CacheHit {
            response,
            charged,
            remaining,
        } => {
            let alfred = alfred_usage_json(charged, remaining, state.config.usd_per_credit);
            if wants_stream {
                super::streaming::replay_cached(response, alfred)
            } else {
                Ok(Json(openai_response_json(&response, alfred)).into_response())
            }
        }
        Preflight::Proceed(prepared) => {
            if wants_stream {
                super::streaming::create_streaming_response(state, *prepared).await
            } else {
                execute(&state, *prepared).await
            }
        }
    }
}

/// Blocking completion with bounded failover.
async fn execute(state: &Arc<AppState>, prepared: Prepared) -> Result<Response, GatewayError> {
    let snapshot = prepared.snapshot.clone();
    let retry_config = &snapshot.config.retry;
    let breaker_config = &snapshot.config.breaker;

    let mut attempts = 0u32;
    let mut backoff_spent = Duration::ZERO;
    let mut last_err = GatewayError::UpstreamTransient("no healthy provider available".to_string());

    for candidate in &prepared.candidates {
        if attempts > retry_config.max_retries {
            break;
        }
        let Some(entry) = snapshot.pricing.get_ref(candidate) else {
            continue;
        };
        let breaker_key = CircuitBreaker::key(&entry.provider, entry.region.as_deref());
        if !state.breaker.allow(&breaker_key, breaker_config) {
            tracing::debug!(provider = %entry.provider, "skipping provider with open circuit");
            continue;
        }
        let Some(adapter) = snapshot.adapters.get(&entry.provider) else {
            continue;
        };

        if attempts > 0 {
            match router::backoff_delay(attempts - 1, backoff_spent, retry_config) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    backoff_spent += delay;
                }
                None => break,
            }
        }
        attempts += 1;

        let started = Instant::now();
        match adapter.chat_completion(&prepared.request, &entry.id).await {
            Ok(response) => {
                state
                    .breaker
                    .record_success(&breaker_key, started.elapsed(), breaker_config);
                return finalize_success(state, &prepared, entry, response).await;
            }
            Err(err) => {
                state
                    .breaker
                    .record_failure(&breaker_key, started.elapsed(), breaker_config);
                tracing::warn!(
                    provider = %entry.provider,
                    model = %entry.id,
                    attempt = attempts,
                    error = %err,
                    "provider attempt failed"
                );
                let retryable = err.retryable();
                last_err = err.into();
                if !retryable {
                    break;
                }
            }
        }
    }

    if let Err(err) = state.wallets.refund(&prepared.reservation_id).await {
        tracing::error!("refund after failed request: {err}");
    }
    Err(last_err)
}

async fn finalize_success(
    state: &Arc<AppState>,
    prepared: &Prepared,
    entry: &ModelEntry,
    response: CanonicalResponse,
) -> Result<Response, GatewayError> {
    // Providers that omit usage are settled on the local count.
    let usage = if response.usage.total_tokens > 0 {
        response.usage
    } else {
        let counter = state.tokenizers.resolve(&entry.tokenizer);
        Usage::new(
            prepared.prompt_tokens_estimate,
            counter.count(&response.text()),
        )
    };

    let cost = metering::cost(entry, usage.prompt_tokens, usage.completion_tokens);
    let charged = state
        .wallets
        .settle(&prepared.reservation_id, cost, &prepared.request_id)
        .await?;
    let remaining = state.wallets.snapshot(&prepared.leaf_wallet).await?.balance;

    tracing::debug!(
        request_id = %prepared.request_id,
        provider = %entry.provider,
        model = %entry.id,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        credits_charged = %charged,
        "request completed, reservation settled"
    );

    // Populate the semantic cache for future near-duplicates.
    let cache_config = &prepared.snapshot.config.cache;
    if cache_config.enabled {
        if let Some(vector) = &prepared.cache_vector {
            let mut stored = response.clone();
            stored.usage = usage;
            state.cache.insert(
                &prepared.request.tenant_id,
                &prepared.request.model_family,
                vector.clone(),
                stored,
                cache_config,
            );
        }
    }

    let mut final_response = response;
    final_response.usage = usage;
    let alfred = alfred_usage_json(charged, remaining, state.config.usd_per_credit);
    Ok(Json(openai_response_json(&final_response, alfred)).into_response())
}

// =============================================================================
// Embeddings
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EmbeddingsWire {
    pub model: String,
    pub input: serde_json::Value,
}

/// POST /v1/embeddings
pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedRequest,
    Json(wire): Json<EmbeddingsWire>,
) -> Result<Response, GatewayError> {
    let snapshot = state.gateway.current();
    state
        .limiter
        .try_acquire(&auth.tenant_id, "embeddings", &snapshot.config.rate_limit)?;

    let inputs: Vec<String> = match wire.input {
        serde_json::Value::String(s) => vec![s],
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => {
            return Err(GatewayError::InvalidRequest(
                "input must be a string or an array of strings".to_string(),
            ))
        }
    };
    if inputs.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "input must not be empty".to_string(),
        ));
    }

    // Resolve "provider/model" or a bare model id against the registry.
    let entry = ModelRef::parse(&wire.model)
        .and_then(|r| snapshot.pricing.get_ref(&r))
        .or_else(|| {
            snapshot
                .pricing
                .entries()
                .iter()
                .find(|e| e.id == wire.model)
        })
        .ok_or_else(|| {
            GatewayError::InvalidRequest(format!("unknown embeddings model '{}'", wire.model))
        })?;
    let adapter = snapshot
        .adapters
        .get(&entry.provider)
        .ok_or_else(|| GatewayError::InvalidRequest("provider not configured".to_string()))?;

    let scope = ChargeScope {
        tenant_id: &auth.tenant_id,
        team_id: auth.team_id.as_deref(),
        user_id: &auth.user_id,
        project_id: auth.project_id.as_deref(),
    };
    let leaf_wallet = state.wallets.ensure_chain(&scope, &snapshot.config.wallet);
    let request_id = uuid::Uuid::new_v4().to_string();

    let counter = state.tokenizers.resolve(&entry.tokenizer);
    let estimated_tokens: u32 = inputs.iter().map(|text| counter.count(text)).sum();
    let reserve_amount = Credits::per_thousand(entry.in_rate, estimated_tokens as u64);
    let ttl = Duration::from_secs(snapshot.config.wallet.reservation_ttl_secs);
    let reservation = state.wallets.reserve(&leaf_wallet, reserve_amount, ttl).await?;

    let breaker_key = CircuitBreaker::key(&entry.provider, entry.region.as_deref());
    let started = Instant::now();
    let result = adapter
        .embeddings(&crate::providers::EmbeddingsRequest {
            model: entry.id.clone(),
            input: inputs,
        })
        .await;

    let response = match result {
        Ok(response) => {
            state
                .breaker
                .record_success(&breaker_key, started.elapsed(), &snapshot.config.breaker);
            response
        }
        Err(err) => {
            state
                .breaker
                .record_failure(&breaker_key, started.elapsed(), &snapshot.config.breaker);
            state.wallets.refund(&reservation.id).await.ok();
            return Err(err.into());
        }
    };

    let billed_tokens = if response.total_tokens > 0 {
        response.total_tokens
    } else {
        estimated_tokens
    };
    let cost = Credits::per_thousand(entry.in_rate, billed_tokens as u64);
    let charged = state.wallets.settle(&reservation.id, cost, &request_id).await?;
    let remaining = state.wallets.snapshot(&leaf_wallet).await?.balance;

    let data: Vec<serde_json::Value> = response
        .vectors
        .iter()
        .enumerate()
        .map(|(index, embedding)| {
            serde_json::json!({
                "object": "embedding",
                "index": index,
                "embedding": embedding,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "object": "list",
        "data": data,
        "model": entry.id,
        "usage": {
            "prompt_tokens": billed_tokens,
            "total_tokens": billed_tokens,
        },
        "alfred_usage": alfred_usage_json(charged, remaining, state.config.usd_per_credit),
    }))
    .into_response())
}

// =============================================================================
// Model catalog
// =============================================================================

/// GET /v1/models
///
/// OpenAI-style catalog derived from the pricing registry.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.gateway.current();
    let models: Vec<serde_json::Value> = snapshot
        .pricing
        .entries()
        .iter()
        .map(|entry| {
            serde_json::json!({
                "id": entry.model_ref().to_string(),
                "object": "model",
                "owned_by": entry.provider,
                "family": entry.family,
                "max_output_tokens": entry.max_output_tokens,
                "in_rate_credits_per_1k": entry.in_rate.to_decimal(),
                "out_rate_credits_per_1k": entry.out_rate.to_decimal(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "object": "list",
        "data": models,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{PrivacyMode, Priority};

    fn auth() -> AuthenticatedRequest {
        AuthenticatedRequest {
            tenant_id: "acme".into(),
            user_id: "u1".into(),
            team_id: Some("eng".into()),
            roles: vec![],
            privacy_mode: PrivacyMode::Standard,
            project_id: None,
            priority: Priority::Normal,
            mfa_verified: false,
        }
    }

    #[test]
    fn test_canonicalize_flattens_content_parts() {
        let wire = CompletionRequest {
            model: "frontier".into(),
            messages: vec![WireMessage {
                role: "user".into(),
                content: serde_json::json!([
                    { "type": "text", "text": "part one " },
                    { "type": "text", "text": "part two" },
                ]),
            }],
            max_tokens: Some(100),
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
        };
        let canonical = canonicalize(&auth(), wire).unwrap();
        assert_eq!(canonical.messages[0].content, "part one part two");
        assert_eq!(canonical.max_output_tokens, Some(100));
        assert!(!canonical.stream);
    }

    #[test]
    fn test_canonicalize_rejects_empty_messages() {
        let wire = CompletionRequest {
            model: "frontier".into(),
            messages: vec![],
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
        };
        assert!(matches!(
            canonicalize(&auth(), wire),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_canonicalize_stop_variants() {
        let wire = CompletionRequest {
            model: "frontier".into(),
            messages: vec![WireMessage {
                role: "user".into(),
                content: serde_json::json!("hi"),
            }],
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            stop: Some(serde_json::json!("END")),
            stream: Some(true),
        };
        let canonical = canonicalize(&auth(), wire).unwrap();
        assert_eq!(canonical.stop, Some(vec!["END".to_string()]));
        assert!(canonical.stream);
    }

    #[test]
    fn test_max_completion_tokens_takes_precedence() {
        let wire = CompletionRequest {
            model: "frontier".into(),
            messages: vec![WireMessage {
                role: "user".into(),
                content: serde_json::json!("hi"),
            }],
            max_tokens: Some(100),
            max_completion_tokens: Some(50),
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
        };
        let canonical = canonicalize(&auth(), wire).unwrap();
        assert_eq!(canonical.max_output_tokens, Some(50));
    }

    #[test]
    fn test_alfred_usage_shape() {
        let alfred = alfred_usage_json(
            Credits::from_decimal(0.8),
            Credits::from_decimal(99.2),
            1.0,
        );
        assert_eq!(alfred["credits_charged"], 0.8);
        assert_eq!(alfred["remaining_balance"], 99.2);
        assert_eq!(alfred["cost_usd"], 0.8);
    }
}
