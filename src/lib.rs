//! Alfred: multi-tenant AI gateway with hierarchical credit governance.
//!
//! Request lifecycle: resolve the caller, normalize to the canonical
//! schema, consult the semantic cache, pick a provider under policy and
//! breaker state, reserve credits, stream the response while metering
//! tokens in flight, settle the reservation, and append the outcome to the
//! hash-chained journal.
//!
//! Prompts and completions are never logged or persisted outside the
//! optional response cache; strict privacy mode keeps them out of that too.

pub mod audit;
pub mod auth;
pub mod breaker;
pub mod cache;
pub mod canonical;
pub mod config;
pub mod credits;
pub mod error;
pub mod guardrails;
pub mod metering;
pub mod pricing;
pub mod providers;
pub mod ratelimit;
pub mod router;
pub mod routes;
pub mod tokenizer;
pub mod wallet;

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::breaker::CircuitBreaker;
use crate::cache::SemanticCache;
use crate::config::{Config, ConfigStore};
use crate::ratelimit::RateLimiter;
use crate::tokenizer::TokenizerRegistry;
use crate::wallet::WalletStore;

/// Shared application state
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<ConfigStore>,
    pub tokenizers: Arc<TokenizerRegistry>,
    pub wallets: Arc<WalletStore>,
    pub audit: Arc<AuditLog>,
    pub breaker: Arc<CircuitBreaker>,
    pub cache: Arc<SemanticCache>,
    pub limiter: Arc<RateLimiter>,
}
