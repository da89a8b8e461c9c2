//! Routing policy and circuit breaker behavior across config snapshots.

use std::time::Duration;

use alfred::breaker::{CircuitBreaker, CircuitState};
use alfred::canonical::{CanonicalRequest, Message, RequestMetadata, Role};
use alfred::config::{BreakerConfig, GatewayConfig, RetryConfig, Snapshot};
use alfred::credits::Credits;
use alfred::error::GatewayError;
use alfred::pricing::{ModelRef, PricingTable};
use alfred::providers::AdapterRegistry;
use alfred::router::{backoff_delay, decide, RequestFacts};

fn snapshot(rules: serde_json::Value) -> Snapshot {
    let raw = serde_json::json!({
        "providers": [
            {
                "name": "openai",
                "kind": "open_ai",
                "models": [
                    { "id": "gpt-4o", "family": "frontier", "in_rate": 2.5, "out_rate": 10.0,
                      "fallbacks": ["anthropic/claude-sonnet", "openai/gpt-4o-mini"] },
                    { "id": "gpt-4o-mini", "family": "fast", "in_rate": 0.15, "out_rate": 0.6 }
                ]
            },
            {
                "name": "anthropic",
                "kind": "anthropic",
                "region": "eu",
                "models": [
                    { "id": "claude-sonnet", "family": "frontier", "in_rate": 3.0, "out_rate": 15.0 }
                ]
            }
        ],
        "rules": rules,
    });
    let mut config: GatewayConfig = serde_json::from_value(raw).unwrap();
    config.rules.sort_by_key(|r| r.priority);
    Snapshot {
        version: 1,
        pricing: PricingTable::from_config(&config),
        adapters: AdapterRegistry::from_config(&config).unwrap(),
        config,
    }
}

fn request(family: &str) -> CanonicalRequest {
    CanonicalRequest {
        tenant_id: "acme".into(),
        user_id: "u1".into(),
        team_id: Some("eng".into()),
        model_family: family.into(),
        messages: vec![Message {
            role: Role::User,
            content: "hello".into(),
        }],
        max_output_tokens: Some(256),
        temperature: None,
        top_p: None,
        stop: None,
        stream: false,
        metadata: RequestMetadata::default(),
    }
}

fn facts<'a>(available: f64) -> RequestFacts<'a> {
    RequestFacts {
        tenant_id: "acme",
        team_id: Some("eng"),
        roles: &[],
        privacy_strict: false,
        priority_critical: false,
        residency_region: None,
        mfa_verified: false,
        available: Credits::from_decimal(available),
    }
}

#[test]
fn failover_chain_is_bounded() {
    let snapshot = snapshot(serde_json::json!([]));
    let decision = decide(&snapshot, &request("frontier"), &facts(10.0), chrono::Utc::now())
        .unwrap();

    // The candidate list is finite and deduplicated; the executor truncates
    // it to max_retries + 1 actual attempts.
    assert_eq!(decision.candidates.len(), 3);
    let retry: RetryConfig = serde_json::from_str("{}").unwrap();
    assert!(decision.candidates.len() as u32 <= retry.max_retries + 1);
}

#[test]
fn added_retry_latency_stays_under_ceiling() {
    let retry: RetryConfig = serde_json::from_value(serde_json::json!({
        "max_retries": 2,
        "backoff_base_ms": 100,
        "backoff_total_ms": 1000,
    }))
    .unwrap();

    // Worst case across the allowed retries never exceeds the ceiling.
    for _ in 0..50 {
        let mut spent = Duration::ZERO;
        for retry_index in 0..retry.max_retries {
            if let Some(delay) = backoff_delay(retry_index, spent, &retry) {
                spent += delay;
            }
        }
        assert!(spent <= Duration::from_millis(retry.backoff_total_ms));
    }
}

#[test]
fn exact_model_reference_routes_directly() {
    let snapshot = snapshot(serde_json::json!([]));
    let decision = decide(
        &snapshot,
        &request("anthropic/claude-sonnet"),
        &facts(10.0),
        chrono::Utc::now(),
    )
    .unwrap();
    assert_eq!(
        decision.candidates[0],
        ModelRef::new("anthropic", "claude-sonnet")
    );
}

#[test]
fn block_rules_refuse_with_reason() {
    let snapshot = snapshot(serde_json::json!([
        { "priority": 5,
          "conditions": [
              { "type": "tenant_is", "tenant_id": "acme" },
              { "type": "family_is", "family": "frontier" }
          ],
          "action": { "type": "block", "reason": "frontier disabled for tenant" } },
    ]));

    let err = decide(&snapshot, &request("frontier"), &facts(10.0), chrono::Utc::now())
        .unwrap_err();
    assert!(matches!(err, GatewayError::Forbidden(_)));

    // Unrelated family still routes.
    assert!(decide(&snapshot, &request("fast"), &facts(10.0), chrono::Utc::now()).is_ok());
}

#[test]
fn low_balance_reroutes_before_default() {
    let snapshot = snapshot(serde_json::json!([
        { "priority": 1,
          "conditions": [{ "type": "balance_below", "credits": 2.0 }],
          "action": { "type": "reroute_capability", "family": "fast" } },
    ]));

    let broke = decide(&snapshot, &request("frontier"), &facts(0.5), chrono::Utc::now())
        .unwrap();
    assert_eq!(broke.candidates[0], ModelRef::new("openai", "gpt-4o-mini"));

    let funded = decide(&snapshot, &request("frontier"), &facts(50.0), chrono::Utc::now())
        .unwrap();
    assert_eq!(funded.candidates[0], ModelRef::new("openai", "gpt-4o"));
}

#[test]
fn breaker_gates_providers_per_region() {
    let breaker = CircuitBreaker::new();
    let config: BreakerConfig = serde_json::from_value(serde_json::json!({
        "consecutive_failures": 2,
        "error_rate_threshold": 1.0,
        "cooldown_secs": 60,
        "window": 10,
    }))
    .unwrap();

    let eu = CircuitBreaker::key("anthropic", Some("eu"));
    let us = CircuitBreaker::key("anthropic", Some("us"));

    breaker.record_failure(&eu, Duration::from_millis(20), &config);
    breaker.record_failure(&eu, Duration::from_millis(20), &config);

    assert_eq!(breaker.state(&eu), CircuitState::Open);
    assert!(!breaker.allow(&eu, &config));
    // Same provider, other region keeps serving.
    assert!(breaker.allow(&us, &config));
}

#[test]
fn breaker_recovers_through_half_open() {
    let breaker = CircuitBreaker::new();
    let config: BreakerConfig = serde_json::from_value(serde_json::json!({
        "consecutive_failures": 2,
        "error_rate_threshold": 1.0,
        "cooldown_secs": 0,
        "half_open_successes": 2,
        "window": 10,
    }))
    .unwrap();

    let key = CircuitBreaker::key("openai", None);
    breaker.record_failure(&key, Duration::from_millis(20), &config);
    breaker.record_failure(&key, Duration::from_millis(20), &config);
    assert_eq!(breaker.state(&key), CircuitState::Open);

    // Cooldown elapsed (zero): next dispatch probes half-open.
    assert!(breaker.allow(&key, &config));
    assert_eq!(breaker.state(&key), CircuitState::HalfOpen);

    breaker.record_success(&key, Duration::from_millis(5), &config);
    breaker.record_success(&key, Duration::from_millis(5), &config);
    assert_eq!(breaker.state(&key), CircuitState::Closed);
}
