//! SSE streaming proxy for chat completions.
//!
//! Forwards provider events to the client while metering tokens in flight
//! and enforcing guardrails. Transient upstream failures fail over to the
//! next candidate transparently while no content has reached the client;
//! after first content, failures terminate the stream with an error event
//! and the partial progress is billed. Client disconnects cancel the
//! upstream (the adapter stream is dropped) and settle for the tokens
//! already delivered.
//!
//! Response bytes are never logged; only counts reach the journal.

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;
use tokio_stream::wrappers::ReceiverStream;

use crate::breaker::CircuitBreaker;
use crate::canonical::{CanonicalResponse, FinishReason, Usage};
use crate::credits::Credits;
use crate::error::GatewayError;
use crate::guardrails::{GuardTrip, StreamGuard};
use crate::metering::Meter;
use crate::pricing::ModelEntry;
use crate::providers::EventStream;
use crate::router;
use crate::routes::chat::{alfred_usage_json, Prepared};
use crate::AppState;

// =============================================================================
// Chunk shaping (OpenAI chat.completion.chunk wire format)
// =============================================================================

fn chunk_json(
    id: &str,
    model: &str,
    role: Option<&str>,
    content: Option<&str>,
    finish: Option<&str>,
) -> String {
    let mut delta = serde_json::Map::new();
    if let Some(role) = role {
        delta.insert("role".to_string(), serde_json::json!(role));
    }
    if let Some(content) = content {
        delta.insert("content".to_string(), serde_json::json!(content));
    }
    serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
    .to_string()
}

fn usage_chunk_json(
    id: &str,
    model: &str,
    usage: Usage,
    alfred_usage: serde_json::Value,
) -> String {
    serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        },
        "alfred_usage": alfred_usage,
    })
    .to_string()
}

fn error_event_json(err: &GatewayError) -> String {
    serde_json::json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
        }
    })
    .to_string()
}

/// Send one SSE data frame; `false` means the client went away.
async fn send_data(tx: &Sender<Result<SseEvent, Infallible>>, data: String) -> bool {
    tx.send(Ok(SseEvent::default().data(data))).await.is_ok()
}

// =============================================================================
// Cache replay
// =============================================================================

/// Replay a cached response as a synthetic single-chunk stream.
pub fn replay_cached(
    response: CanonicalResponse,
    alfred_usage: serde_json::Value,
) -> Result<Response, GatewayError> {
    let id = response.id.clone();
    let model = response.model_resolved.clone();
    let text = response.text();

    let frames = vec![
        chunk_json(&id, &model, Some("assistant"), None, None),
        chunk_json(&id, &model, None, Some(&text), None),
        chunk_json(&id, &model, None, None, Some(FinishReason::Stop.as_str())),
        usage_chunk_json(&id, &model, response.usage, alfred_usage),
        "[DONE]".to_string(),
    ];
    let events = frames
        .into_iter()
        .map(|data| Ok::<_, Infallible>(SseEvent::default().data(data)));

    Ok(Sse::new(futures::stream::iter(events))
        .keep_alive(KeepAlive::new())
        .into_response())
}

// =============================================================================
// Live proxy
// =============================================================================

/// Billing facts for the attempt currently on the wire; billing always uses
/// the pricing of the provider that actually served the stream.
#[derive(Clone)]
struct Attempt {
    provider: String,
    model: String,
    breaker_key: String,
    in_rate: Credits,
    out_rate: Credits,
    tokenizer: String,
}

impl Attempt {
    fn of(entry: &ModelEntry) -> Self {
        Self {
            provider: entry.provider.clone(),
            model: entry.id.clone(),
            breaker_key: CircuitBreaker::key(&entry.provider, entry.region.as_deref()),
            in_rate: entry.in_rate,
            out_rate: entry.out_rate,
            tokenizer: entry.tokenizer.clone(),
        }
    }

    fn cost(&self, usage: Usage) -> Credits {
        Credits::per_thousand(self.in_rate, usage.prompt_tokens as u64)
            + Credits::per_thousand(self.out_rate, usage.completion_tokens as u64)
    }
}

/// Walk the candidate list for the next usable stream, honoring breaker
/// state, the retry bound and the backoff latency ceiling.
async fn acquire_stream(
    state: &Arc<AppState>,
    prepared: &Prepared,
    next_index: &mut usize,
    attempts: &mut u32,
    backoff_spent: &mut Duration,
) -> Result<(Attempt, EventStream), GatewayError> {
    let snapshot = &prepared.snapshot;
    let retry_config = &snapshot.config.retry;
    let breaker_config = &snapshot.config.breaker;
    let mut last_err =
        GatewayError::UpstreamTransient("no healthy provider available".to_string());

    while *next_index < prepared.candidates.len() {
        if *attempts > retry_config.max_retries {
            break;
        }
        let candidate = &prepared.candidates[*next_index];
        *next_index += 1;

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

        if *attempts > 0 {
            match router::backoff_delay(*attempts - 1, *backoff_spent, retry_config) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    *backoff_spent += delay;
                }
                None => break,
            }
        }
        *attempts += 1;

        let started = Instant::now();
        match adapter
            .chat_completion_stream(&prepared.request, &entry.id)
            .await
        {
            Ok(stream) => return Ok((Attempt::of(entry), stream)),
            Err(err) => {
                state
                    .breaker
                    .record_failure(&breaker_key, started.elapsed(), breaker_config);
                tracing::warn!(
                    provider = %entry.provider,
                    model = %entry.id,
                    error = %err,
                    "stream establishment failed"
                );
                let retryable = err.retryable();
                last_err = err.into();
                if !retryable {
                    break;
                }
            }
        }
    }
    Err(last_err)
}

enum Outcome {
    /// Terminal event reached (provider finish or guardrail cut)
    Complete { finish: FinishReason, usage: Usage },
    /// Client disconnected mid-stream
    ClientGone { usage: Usage },
    /// Upstream failed after content was already delivered (or candidates
    /// were exhausted before any stream produced content)
    Failed { usage: Usage, err: GatewayError },
}

/// POST /v1/chat/completions with stream=true.
///
/// The first upstream stream is established before the SSE response starts
/// so pre-stream failures surface as proper HTTP errors.
pub async fn create_streaming_response(
    state: Arc<AppState>,
    prepared: Prepared,
) -> Result<Response, GatewayError> {
    let mut next_index = 0usize;
    let mut attempts = 0u32;
    let mut backoff_spent = Duration::ZERO;

    let acquired = acquire_stream(
        &state,
        &prepared,
        &mut next_index,
        &mut attempts,
        &mut backoff_spent,
    )
    .await;
    let (attempt, stream) = match acquired {
        Ok(acquired) => acquired,
        Err(err) => {
            if let Err(refund_err) = state.wallets.refund(&prepared.reservation_id).await {
                tracing::error!("refund after failed stream start: {refund_err}");
            }
            return Err(err);
        }
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<SseEvent, Infallible>>(100);
    tokio::spawn(pump(
        state,
        prepared,
        attempt,
        stream,
        next_index,
        attempts,
        backoff_spent,
        tx,
    ));

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new())
        .into_response())
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    state: Arc<AppState>,
    prepared: Prepared,
    mut attempt: Attempt,
    mut stream: EventStream,
    mut next_index: usize,
    mut attempts: u32,
    mut backoff_spent: Duration,
    tx: Sender<Result<SseEvent, Infallible>>,
) {
    let snapshot = prepared.snapshot.clone();
    let stream_id = format!("chatcmpl-{}", prepared.request_id);
    let breaker_config = &snapshot.config.breaker;
    // Inter-event idle bound; connect and total wall-clock bounds live on
    // the provider's HTTP client.
    let idle_timeout = Duration::from_secs(snapshot.config.guardrails.stream_idle_timeout_secs);
    let mut sent_role = false;

    let outcome = 'attempt: loop {
        let counter = state.tokenizers.resolve(&attempt.tokenizer);
        let mut meter = Meter::new(counter, prepared.prompt_tokens_estimate);
        let mut guard = StreamGuard::new(&snapshot.config.guardrails);
        let started = Instant::now();

        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let item = match next {
                Err(_) => {
                    // A client that went away during the idle gap is a
                    // cancellation, not an upstream fault; nothing pushed
                    // data, so the send-failure path never saw it.
                    if tx.is_closed() {
                        break 'attempt Outcome::ClientGone {
                            usage: meter.settlement_usage(),
                        };
                    }
                    state
                        .breaker
                        .record_failure(&attempt.breaker_key, started.elapsed(), breaker_config);
                    if meter.completion_tokens() == 0 {
                        match acquire_stream(
                            &state,
                            &prepared,
                            &mut next_index,
                            &mut attempts,
                            &mut backoff_spent,
                        )
                        .await
                        {
                            Ok((next_attempt, next_stream)) => {
                                attempt = next_attempt;
                                stream = next_stream;
                                continue 'attempt;
                            }
                            Err(err) => {
                                break 'attempt Outcome::Failed {
                                    usage: meter.settlement_usage(),
                                    err,
                                }
                            }
                        }
                    }
                    break 'attempt Outcome::Failed {
                        usage: meter.settlement_usage(),
                        err: GatewayError::UpstreamTransient(
                            "upstream idle timeout".to_string(),
                        ),
                    };
                }
                Ok(item) => item,
            };

            match item {
                None => {
                    // Adapters synthesize a final event, so a bare end is
                    // unusual but still terminates cleanly.
                    state
                        .breaker
                        .record_success(&attempt.breaker_key, started.elapsed(), breaker_config);
                    break 'attempt Outcome::Complete {
                        finish: FinishReason::Stop,
                        usage: meter.settlement_usage(),
                    };
                }
                Some(Err(err)) => {
                    state
                        .breaker
                        .record_failure(&attempt.breaker_key, started.elapsed(), breaker_config);
                    if err.retryable() && meter.completion_tokens() == 0 {
                        // Nothing reached the client yet: fail over without
                        // surfacing a retry marker.
                        match acquire_stream(
                            &state,
                            &prepared,
                            &mut next_index,
                            &mut attempts,
                            &mut backoff_spent,
                        )
                        .await
                        {
                            Ok((next_attempt, next_stream)) => {
                                attempt = next_attempt;
                                stream = next_stream;
                                continue 'attempt;
                            }
                            Err(final_err) => {
                                break 'attempt Outcome::Failed {
                                    usage: meter.settlement_usage(),
                                    err: final_err,
                                }
                            }
                        }
                    }
                    break 'attempt Outcome::Failed {
                        usage: meter.settlement_usage(),
                        err: err.into(),
                    };
                }
                Some(Ok(event)) => {
                    if event.role.is_some() && !sent_role {
                        sent_role = true;
                        let frame =
                            chunk_json(&stream_id, &attempt.model, Some("assistant"), None, None);
                        if !send_data(&tx, frame).await {
                            break 'attempt Outcome::ClientGone {
                                usage: meter.settlement_usage(),
                            };
                        }
                    }

                    if let Some(text) = &event.delta_text {
                        meter.accumulate(text);

                        if let Some(trip) = guard.observe(text) {
                            let finish = match trip {
                                GuardTrip::Loop => FinishReason::ContentFilter,
                                GuardTrip::ByteBudget => FinishReason::Length,
                            };
                            tracing::warn!(
                                request_id = %prepared.request_id,
                                trip = ?trip,
                                "guardrail tripped, cancelling upstream"
                            );
                            break 'attempt Outcome::Complete {
                                finish,
                                usage: meter.settlement_usage(),
                            };
                        }

                        let frame =
                            chunk_json(&stream_id, &attempt.model, None, Some(text), None);
                        if !send_data(&tx, frame).await {
                            break 'attempt Outcome::ClientGone {
                                usage: meter.settlement_usage(),
                            };
                        }

                        if meter.completion_tokens() > prepared.effective_cap {
                            break 'attempt Outcome::Complete {
                                finish: FinishReason::Length,
                                usage: meter.settlement_usage(),
                            };
                        }
                    }

                    if event.is_final() {
                        if let Some(usage) = event.usage {
                            meter.record_provider_usage(usage);
                        }
                        state.breaker.record_success(
                            &attempt.breaker_key,
                            started.elapsed(),
                            breaker_config,
                        );
                        break 'attempt Outcome::Complete {
                            finish: event.finish_reason.unwrap_or(FinishReason::Stop),
                            usage: meter.settlement_usage(),
                        };
                    }
                }
            }
        }
    };
    // Dropping `stream` here releases the upstream connection.
    drop(stream);

    let usd_per_credit = state.config.usd_per_credit;
    match outcome {
        Outcome::Complete { finish, usage } => {
            let cost = attempt.cost(usage);
            let charged = match state
                .wallets
                .settle(&prepared.reservation_id, cost, &prepared.request_id)
                .await
            {
                Ok(charged) => charged,
                Err(err) => {
                    tracing::error!("settle after stream completion: {err}");
                    cost
                }
            };
            let remaining = state
                .wallets
                .snapshot(&prepared.leaf_wallet)
                .await
                .map(|w| w.balance)
                .unwrap_or(Credits::ZERO);

            let finish_frame =
                chunk_json(&stream_id, &attempt.model, None, None, Some(finish.as_str()));
            if send_data(&tx, finish_frame).await {
                let alfred = alfred_usage_json(charged, remaining, usd_per_credit);
                let usage_frame = usage_chunk_json(&stream_id, &attempt.model, usage, alfred);
                if send_data(&tx, usage_frame).await {
                    send_data(&tx, "[DONE]".to_string()).await;
                }
            }

            tracing::debug!(
                request_id = %prepared.request_id,
                provider = %attempt.provider,
                model = %attempt.model,
                finish = finish.as_str(),
                completion_tokens = usage.completion_tokens,
                credits_charged = %charged,
                "stream completed, reservation settled"
            );
        }
        Outcome::ClientGone { usage } => {
            let cost = attempt.cost(usage);
            let cancel_ref = format!("{}:{}", prepared.request_id, FinishReason::Cancelled.as_str());
            if let Err(err) = state
                .wallets
                .settle(&prepared.reservation_id, cost, &cancel_ref)
                .await
            {
                tracing::error!("settle after client disconnect: {err}");
            }
            tracing::info!(
                request_id = %prepared.request_id,
                completion_tokens = usage.completion_tokens,
                "client disconnected, settled partial stream"
            );
        }
        Outcome::Failed { usage, err } => {
            // Tokens streamed before the failure are always billed; a
            // failure before any content settles at zero (full refund).
            let cost = if usage.completion_tokens == 0 {
                Credits::ZERO
            } else {
                attempt.cost(usage)
            };
            let fail_ref = format!("{}:{}", prepared.request_id, err.code());
            if let Err(settle_err) = state
                .wallets
                .settle(&prepared.reservation_id, cost, &fail_ref)
                .await
            {
                tracing::error!("settle after stream failure: {settle_err}");
            }
            if send_data(&tx, error_event_json(&err)).await {
                send_data(&tx, "[DONE]".to_string()).await;
            }
            tracing::warn!(
                request_id = %prepared.request_id,
                error = %err,
                completion_tokens = usage.completion_tokens,
                "stream failed, settled partial progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_json_shape() {
        let frame = chunk_json("chatcmpl-1", "gpt-4o", None, Some("hello"), None);
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["object"], "chat.completion.chunk");
        assert_eq!(parsed["choices"][0]["delta"]["content"], "hello");
        assert!(parsed["choices"][0]["finish_reason"].is_null());

        let finish = chunk_json("chatcmpl-1", "gpt-4o", None, None, Some("length"));
        let parsed: serde_json::Value = serde_json::from_str(&finish).unwrap();
        assert_eq!(parsed["choices"][0]["finish_reason"], "length");
        assert!(parsed["choices"][0]["delta"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_usage_chunk_carries_alfred_usage() {
        let alfred = serde_json::json!({ "credits_charged": 0.4 });
        let frame = usage_chunk_json("chatcmpl-1", "gpt-4o", Usage::new(200, 300), alfred);
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["usage"]["total_tokens"], 500);
        assert_eq!(parsed["alfred_usage"]["credits_charged"], 0.4);
    }

    #[test]
    fn test_error_event_shape() {
        let err = GatewayError::UpstreamProtocol("truncated frame".to_string());
        let parsed: serde_json::Value =
            serde_json::from_str(&error_event_json(&err)).unwrap();
        assert_eq!(parsed["error"]["code"], "upstream_protocol");
    }
}
