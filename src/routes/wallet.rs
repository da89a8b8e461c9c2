//! Wallet governance endpoints: transfers and balance snapshots.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::AuthenticatedRequest;
use crate::credits::Credits;
use crate::error::GatewayError;
use crate::wallet::{ChargeScope, WalletStore};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    /// Recipient wallet id, or a bare user id within the caller's tenant
    pub to: String,
    pub amount_credits: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /v1/wallet/transfer
///
/// Moves credits from the caller's wallet to another wallet in the same
/// tenant. Produces a linked debit/credit pair in the journal.
pub async fn transfer(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedRequest,
    Json(request): Json<TransferRequest>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let snapshot = state.gateway.current();
    state
        .limiter
        .try_acquire(&auth.tenant_id, "wallet", &snapshot.config.rate_limit)?;

    let amount = Credits::from_decimal(request.amount_credits);
    if amount <= Credits::ZERO {
        return Err(GatewayError::TransferLimit(
            "amount_credits must be positive".to_string(),
        ));
    }

    let scope = ChargeScope {
        tenant_id: &auth.tenant_id,
        team_id: auth.team_id.as_deref(),
        user_id: &auth.user_id,
        project_id: None,
    };
    let from = state.wallets.ensure_chain(&scope, &snapshot.config.wallet);

    // Bare user ids resolve within the caller's tenant; anything with a
    // kind prefix is taken as a full wallet id.
    let to = if request.to.contains(':') {
        request.to.clone()
    } else {
        WalletStore::user_wallet_id(&auth.tenant_id, &request.to)
    };
    if WalletStore::wallet_tenant(&to) != Some(auth.tenant_id.as_str()) {
        return Err(GatewayError::Forbidden(
            "transfers cannot cross tenant boundaries".to_string(),
        ));
    }

    let transfer_id = state
        .wallets
        .transfer(&from, &to, amount, &snapshot.config.wallet)
        .await
        .map_err(GatewayError::from)?;

    tracing::info!(
        tenant_id = %auth.tenant_id,
        from = %from,
        to = %to,
        reason = request.reason.as_deref().unwrap_or(""),
        "wallet transfer accepted"
    );

    Ok(Json(serde_json::json!({
        "transfer_id": transfer_id,
        "from": from,
        "to": to,
        "amount_credits": amount.to_decimal(),
    })))
}

/// GET /v1/wallet/balance
///
/// Full chain snapshot for the caller's wallet, leaf first.
pub async fn balance(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedRequest,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let snapshot = state.gateway.current();
    let scope = ChargeScope {
        tenant_id: &auth.tenant_id,
        team_id: auth.team_id.as_deref(),
        user_id: &auth.user_id,
        project_id: auth.project_id.as_deref(),
    };
    let leaf = state.wallets.ensure_chain(&scope, &snapshot.config.wallet);

    let chain = state
        .wallets
        .chain_snapshot(&leaf)
        .await
        .map_err(GatewayError::from)?;

    let usd_per_credit = state.config.usd_per_credit;
    let wallets: Vec<serde_json::Value> = chain
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "kind": w.kind.as_str(),
                "limit_credits": w.limit.to_decimal(),
                "balance_credits": w.balance.to_decimal(),
                "reserved_credits": w.reserved.to_decimal(),
                "available_credits": w.available.to_decimal(),
                "balance_usd": w.balance.to_usd(usd_per_credit),
                "cycle_start": w.cycle_start,
                "cycle_end": w.cycle_end,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "wallet_id": leaf,
        "chain": wallets,
    })))
}
