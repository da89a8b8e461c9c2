//! End-to-end streaming proxy behavior against a scripted provider:
//! mid-stream client disconnect settles the partial count as cancelled,
//! and guardrail trips cut the stream with a synthetic finish reason.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use alfred::audit::AuditLog;
use alfred::breaker::CircuitBreaker;
use alfred::cache::SemanticCache;
use alfred::canonical::{
    CanonicalRequest, CanonicalResponse, Message, RequestMetadata, Role, StreamEvent,
};
use alfred::config::{Config, ConfigStore, GatewayConfig, Snapshot};
use alfred::credits::Credits;
use alfred::pricing::{ModelRef, PricingTable};
use alfred::providers::{
    AdapterError, AdapterRegistry, EmbeddingsRequest, EmbeddingsResponse, EventStream,
    HealthStatus, ProviderAdapter,
};
use alfred::ratelimit::RateLimiter;
use alfred::routes::chat::Prepared;
use alfred::routes::streaming::create_streaming_response;
use alfred::tokenizer::TokenizerRegistry;
use alfred::wallet::ledger::{EntryKind, Ledger};
use alfred::wallet::{ChargeScope, WalletStore};
use alfred::AppState;

/// Provider stub that replays a scripted event sequence, then hangs like a
/// stalled upstream so the proxy's own timeouts and cancellation paths run.
struct StubProvider {
    scripted: StdMutex<Option<Vec<StreamEvent>>>,
}

impl StubProvider {
    fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            scripted: StdMutex::new(Some(events)),
        }
    }
}

#[async_trait]
impl ProviderAdapter for StubProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn region(&self) -> Option<&str> {
        None
    }

    fn models(&self) -> Vec<String> {
        vec!["m1".to_string()]
    }

    async fn chat_completion(
        &self,
        _request: &CanonicalRequest,
        _model: &str,
    ) -> Result<CanonicalResponse, AdapterError> {
        Err(AdapterError::Permanent("stub is streaming-only".to_string()))
    }

    async fn chat_completion_stream(
        &self,
        _request: &CanonicalRequest,
        _model: &str,
    ) -> Result<EventStream, AdapterError> {
        let events = self
            .scripted
            .lock()
            .expect("stub script poisoned")
            .take()
            .unwrap_or_default();
        let stream =
            futures::stream::iter(events.into_iter().map(Ok)).chain(futures::stream::pending());
        Ok(Box::pin(stream))
    }

    async fn embeddings(
        &self,
        _request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, AdapterError> {
        Err(AdapterError::Permanent("stub has no embeddings".to_string()))
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            detail: None,
        }
    }
}

fn gateway_config() -> GatewayConfig {
    serde_json::from_value(serde_json::json!({
        "providers": [
            {
                "name": "mock",
                "kind": "open_ai_compatible",
                "models": [
                    { "id": "m1", "family": "frontier", "in_rate": 0.5, "out_rate": 1.0,
                      "tokenizer": "heuristic" }
                ]
            }
        ],
        "wallet": {
            "org_limit": 1000.0,
            "user_limit": 100.0
        },
        "guardrails": {
            "loop_window_chars": 2048,
            "loop_ngram_chars": 32,
            "loop_threshold": 3,
            "byte_budget": 1048576,
            "stream_idle_timeout_secs": 1
        }
    }))
    .unwrap()
}

struct Harness {
    state: Arc<AppState>,
    ledger: Arc<Ledger>,
    leaf_wallet: String,
    // tempdir backing the ConfigStore; dropped with the harness
    _dir: tempfile::TempDir,
}

async fn harness(events: Vec<StreamEvent>) -> (Harness, Prepared) {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("alfred.json");
    std::fs::write(&config_path, "{}").unwrap();

    let config = gateway_config();
    let snapshot = Arc::new(Snapshot {
        version: 1,
        pricing: PricingTable::from_config(&config),
        adapters: AdapterRegistry::from_adapters(vec![Arc::new(StubProvider::new(events))]),
        config,
    });

    let ledger = Arc::new(Ledger::in_memory());
    let wallets = Arc::new(WalletStore::new(ledger.clone()));
    let state = Arc::new(AppState {
        config: Arc::new(Config {
            port: 0,
            gateway_config_path: PathBuf::from("alfred.json"),
            journal_path: None,
            usd_per_credit: 1.0,
            reload_poll_secs: 15,
        }),
        gateway: Arc::new(ConfigStore::load(&config_path).unwrap()),
        tokenizers: Arc::new(TokenizerRegistry::bootstrap()),
        wallets: wallets.clone(),
        audit: Arc::new(AuditLog::new(ledger.clone())),
        breaker: Arc::new(CircuitBreaker::new()),
        cache: Arc::new(SemanticCache::new()),
        limiter: Arc::new(RateLimiter::new()),
    });

    let scope = ChargeScope {
        tenant_id: "acme",
        team_id: None,
        user_id: "u1",
        project_id: None,
    };
    let leaf_wallet = wallets.ensure_chain(&scope, &snapshot.config.wallet);

    // Prompt 200 tokens, max_output 1000 at 0.5/1.0 per 1K: hold 1.1 credits.
    let reservation = wallets
        .reserve(&leaf_wallet, Credits::from_decimal(1.1), Duration::from_secs(60))
        .await
        .unwrap();

    let request = CanonicalRequest {
        tenant_id: "acme".into(),
        user_id: "u1".into(),
        team_id: None,
        model_family: "frontier".into(),
        messages: vec![Message {
            role: Role::User,
            content: "stream something".into(),
        }],
        max_output_tokens: Some(1000),
        temperature: None,
        top_p: None,
        stop: None,
        stream: true,
        metadata: RequestMetadata::default(),
    };

    let prepared = Prepared {
        snapshot,
        request,
        request_id: "req-stream-1".to_string(),
        leaf_wallet: leaf_wallet.clone(),
        candidates: vec![ModelRef::new("mock", "m1")],
        reservation_id: reservation.id,
        prompt_tokens_estimate: 200,
        effective_cap: 1000,
        transfer_funded: false,
        cache_vector: None,
    };

    (
        Harness {
            state,
            ledger,
            leaf_wallet,
            _dir: dir,
        },
        prepared,
    )
}

async fn wait_for_settlement(state: &Arc<AppState>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while state.wallets.open_reservations() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "reservation was never settled"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Streaming cancel at 30%: prompt 200 tokens, max_output 1000, the client
/// disconnects after 300 output tokens. Settled cost is exactly
/// 0.5*0.2 + 1.0*0.3 = 0.40 credits, the rest of the hold returns, and the
/// journal records the settle under a cancelled ref.
#[tokio::test]
async fn client_disconnect_settles_partial_as_cancelled() {
    // 300 four-char deltas: one heuristic token each.
    let events: Vec<StreamEvent> = std::iter::once(StreamEvent::role(Role::Assistant))
        .chain((0..300).map(|_| StreamEvent::delta("abcd")))
        .collect();
    let (harness, prepared) = harness(events).await;

    let response = create_streaming_response(harness.state.clone(), prepared)
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();

    // Consume until all 300 content chunks arrived, then hang up.
    let mut transcript = String::new();
    while transcript.matches("\"content\":\"abcd\"").count() < 300 {
        let chunk = body
            .next()
            .await
            .expect("stream ended before 300 deltas")
            .expect("body error");
        transcript.push_str(&String::from_utf8_lossy(&chunk));
    }
    drop(body);

    wait_for_settlement(&harness.state).await;

    let wallet = harness
        .state
        .wallets
        .snapshot(&harness.leaf_wallet)
        .await
        .unwrap();
    assert_eq!(wallet.balance, Credits::from_decimal(99.60));
    assert_eq!(wallet.reserved, Credits::ZERO);

    let entries = harness
        .ledger
        .query(Some(&harness.leaf_wallet), None, None, usize::MAX);
    let settle = entries
        .iter()
        .find(|e| e.kind == EntryKind::Settle)
        .expect("settle entry missing");
    assert_eq!(settle.ref_id, "req-stream-1:cancelled");
    assert_eq!(settle.amount, Credits::from_decimal(0.40));
    assert!(harness.ledger.verify_all().is_ok());
}

/// Loop detection: the provider repeats a ~10-token phrase. The third
/// repetition trips the filter; the stream is cancelled with
/// finish_reason=content_filter and settles for the tokens emitted so far.
#[tokio::test]
async fn loop_detection_cancels_with_content_filter() {
    let phrase = "the same ten token phrase comes again "; // 38 chars, 10 tokens
    let events: Vec<StreamEvent> = std::iter::once(StreamEvent::role(Role::Assistant))
        .chain((0..20).map(|_| StreamEvent::delta(phrase)))
        .collect();
    let (harness, prepared) = harness(events).await;

    let response = create_streaming_response(harness.state.clone(), prepared)
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();

    let mut transcript = String::new();
    while let Some(chunk) = body.next().await {
        transcript.push_str(&String::from_utf8_lossy(&chunk.expect("body error")));
    }

    assert!(transcript.contains("\"finish_reason\":\"content_filter\""));
    assert!(transcript.contains("[DONE]"));
    // Three repetitions were metered (30 tokens); the third tripped the
    // guard before being forwarded, so the client saw two.
    assert_eq!(transcript.matches(phrase).count(), 2);
    assert!(transcript.contains("\"completion_tokens\":30"));

    wait_for_settlement(&harness.state).await;

    // 0.5*0.2 prompt + 1.0*0.03 emitted = 0.13 credits.
    let wallet = harness
        .state
        .wallets
        .snapshot(&harness.leaf_wallet)
        .await
        .unwrap();
    assert_eq!(wallet.balance, Credits::from_decimal(99.87));
    assert_eq!(wallet.reserved, Credits::ZERO);

    let entries = harness
        .ledger
        .query(Some(&harness.leaf_wallet), None, None, usize::MAX);
    let settle = entries
        .iter()
        .find(|e| e.kind == EntryKind::Settle)
        .expect("settle entry missing");
    assert_eq!(settle.ref_id, "req-stream-1");
    assert_eq!(settle.amount, Credits::from_decimal(0.13));
}

/// A client that disconnects during an idle gap (no data in flight to fail
/// a send) is still classified as cancelled, not as an upstream failure.
#[tokio::test]
async fn idle_disconnect_is_cancelled_not_upstream_error() {
    // A little content, then the upstream stalls forever.
    let events: Vec<StreamEvent> = std::iter::once(StreamEvent::role(Role::Assistant))
        .chain((0..10).map(|_| StreamEvent::delta("abcd")))
        .collect();
    let (harness, prepared) = harness(events).await;

    let response = create_streaming_response(harness.state.clone(), prepared)
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();

    let mut transcript = String::new();
    while transcript.matches("\"content\":\"abcd\"").count() < 10 {
        let chunk = body
            .next()
            .await
            .expect("stream ended before deltas")
            .expect("body error");
        transcript.push_str(&String::from_utf8_lossy(&chunk));
    }
    // Hang up while the upstream is idle.
    drop(body);

    wait_for_settlement(&harness.state).await;

    let entries = harness
        .ledger
        .query(Some(&harness.leaf_wallet), None, None, usize::MAX);
    let settle = entries
        .iter()
        .find(|e| e.kind == EntryKind::Settle)
        .expect("settle entry missing");
    assert_eq!(settle.ref_id, "req-stream-1:cancelled");
    // 0.5*0.2 prompt + 1.0*0.01 emitted = 0.11 credits.
    assert_eq!(settle.amount, Credits::from_decimal(0.11));
}
