//! Alfred - Multi-Tenant AI Gateway with Credit Governance
//!
//! Sits between applications and LLM provider APIs. For every request:
//! authenticate, normalize, reserve credits against the wallet hierarchy,
//! route under policy and breaker state, stream while metering tokens,
//! settle the reservation, and append the outcome to a hash-chained journal.
//!
//! Prompts and completions are never logged. This code is open source so
//! users can verify that guarantee.

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alfred::audit::AuditLog;
use alfred::breaker::CircuitBreaker;
use alfred::cache::SemanticCache;
use alfred::config::{Config, ConfigStore};
use alfred::ratelimit::RateLimiter;
use alfred::routes;
use alfred::tokenizer::TokenizerRegistry;
use alfred::wallet::{ledger::Ledger, WalletStore};
use alfred::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alfred=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing::info!(
        "Starting Alfred on port {} (config: {})",
        config.port,
        config.gateway_config_path.display()
    );

    // Gateway document: providers, pricing, rules, wallet defaults. Swapped
    // copy-on-write on reload; in-flight requests keep their snapshot.
    let gateway = Arc::new(ConfigStore::load(&config.gateway_config_path)?);
    {
        let snapshot = gateway.current();
        tracing::info!(
            providers = snapshot.config.providers.len(),
            models = snapshot.pricing.entries().len(),
            rules = snapshot.config.rules.len(),
            api_keys = snapshot.config.api_keys.len(),
            "gateway config loaded"
        );
        if snapshot.config.providers.is_empty() {
            tracing::warn!("no providers configured; all completions will fail");
        }
    }

    // Journal: durable hash-chained append-only store when a path is set.
    let ledger = match &config.journal_path {
        Some(path) => {
            let ledger = Ledger::open(path)?;
            tracing::info!(entries = ledger.len(), "journal opened");
            Arc::new(ledger)
        }
        None => {
            tracing::warn!("ALFRED_JOURNAL_PATH not set; journal is in-memory only");
            Arc::new(Ledger::in_memory())
        }
    };

    // Tokenizers are immutable after startup.
    let tokenizers = Arc::new(TokenizerRegistry::bootstrap());

    let state = Arc::new(AppState {
        config: config.clone(),
        gateway: gateway.clone(),
        tokenizers,
        wallets: Arc::new(WalletStore::new(ledger.clone())),
        audit: Arc::new(AuditLog::new(ledger)),
        breaker: Arc::new(CircuitBreaker::new()),
        cache: Arc::new(SemanticCache::new()),
        limiter: Arc::new(RateLimiter::new()),
    });

    // Reservation janitor: expire stale holds and run cycle rollovers.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tick.tick().await;
                let now = chrono::Utc::now();
                let expired = state.wallets.expire_reservations(now).await;
                if expired > 0 {
                    tracing::info!(expired, "janitor released stale reservations");
                }
                let defaults = state.gateway.current().config.wallet.clone();
                let swept = state.wallets.rollover(now, &defaults).await;
                if swept > 0 {
                    tracing::info!(swept, "cycle rollover completed");
                }
            }
        });
    }

    // Health probes: feed the circuit breakers independently of traffic.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let probe_interval = state.gateway.current().config.breaker.probe_interval_secs;
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(probe_interval.max(1)));
            loop {
                tick.tick().await;
                let snapshot = state.gateway.current();
                let breaker_config = &snapshot.config.breaker;
                for (name, adapter) in snapshot.adapters.iter() {
                    let key = CircuitBreaker::key(name, adapter.region());
                    let started = std::time::Instant::now();
                    let status = adapter.health_check().await;
                    if status.healthy {
                        state
                            .breaker
                            .record_success(&key, started.elapsed(), breaker_config);
                    } else {
                        tracing::debug!(
                            provider = %name,
                            detail = status.detail.as_deref().unwrap_or(""),
                            "health probe failed"
                        );
                        state
                            .breaker
                            .record_failure(&key, started.elapsed(), breaker_config);
                    }
                }
            }
        });
    }

    // Config reload poll: mtime check, copy-on-write swap.
    {
        let gateway = gateway.clone();
        let poll = config.reload_poll_secs.max(1);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(poll));
            loop {
                tick.tick().await;
                if let Err(e) = gateway.reload_if_changed() {
                    tracing::error!("gateway config reload failed (keeping old snapshot): {e}");
                }
            }
        });
    }

    // Build router
    let app = Router::new()
        // Health check (no auth required)
        .route("/health", get(routes::health::health_check))
        .route("/ready", get(routes::health::readiness_check))
        // OpenAI-compatible ingress + governance surface
        .nest("/v1", routes::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Alfred listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
