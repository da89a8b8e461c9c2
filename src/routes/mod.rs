//! Route handlers for the gateway API surface.
//!
//! - `/v1/chat/completions`, `/v1/embeddings`, `/v1/models`: the
//!   OpenAI-compatible ingress, with credit reservation and settlement
//! - `/v1/wallet/*`, `/v1/audit`, `/v1/cache/*`: the governance surface
//! - `/health`, `/ready`: probes
//!
//! Budget is reserved before provider calls and settled after completion.
//! Handlers map errors to the JSON envelope exactly once via `GatewayError`.

pub mod audit;
pub mod cache;
pub mod chat;
pub mod health;
pub mod streaming;
pub mod wallet;

use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

use crate::AppState;

/// All /v1 routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/completions", post(chat::chat_completions))
        .route("/completions", post(chat::chat_completions))
        .route("/embeddings", post(chat::embeddings))
        .route("/models", get(chat::list_models))
        .route("/wallet/transfer", post(wallet::transfer))
        .route("/wallet/balance", get(wallet::balance))
        .route("/audit", get(audit::query))
        .route("/cache/:namespace", delete(cache::invalidate))
}
