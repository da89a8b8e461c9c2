//! Audit journal read surface.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::AuthenticatedRequest;
use crate::error::GatewayError;
use crate::wallet::WalletStore;
use crate::AppState;

const DEFAULT_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub wallet_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// "jsonl" streams the raw journal lines for bulk export
    #[serde(default)]
    pub format: Option<String>,
    /// Run full-chain verification and include the result
    #[serde(default)]
    pub verify: Option<bool>,
}

/// GET /v1/audit
///
/// Read-only journal queries, scoped to the caller's tenant: only wallet
/// ids belonging to the tenant are visible.
pub async fn query(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedRequest,
    Query(params): Query<AuditQuery>,
) -> Result<Response, GatewayError> {
    if let Some(wallet_id) = &params.wallet_id {
        if WalletStore::wallet_tenant(wallet_id) != Some(auth.tenant_id.as_str()) {
            return Err(GatewayError::Forbidden(
                "audit queries cannot cross tenant boundaries".to_string(),
            ));
        }
    }

    if params.format.as_deref() == Some("jsonl") {
        // Bulk export of the full journal, admin-roles only.
        if !auth.roles.iter().any(|r| r == "admin") {
            return Err(GatewayError::Forbidden(
                "journal export requires the admin role".to_string(),
            ));
        }
        return Ok(state.audit.export_jsonl().into_response());
    }

    let entries = state.audit.query(
        params.wallet_id.as_deref(),
        params.since,
        params.until,
        params.limit.unwrap_or(DEFAULT_LIMIT),
    );

    // Without an explicit wallet filter, show only this tenant's entries.
    let entries: Vec<_> = entries
        .into_iter()
        .filter(|e| {
            params.wallet_id.is_some()
                || WalletStore::wallet_tenant(&e.wallet_id) == Some(auth.tenant_id.as_str())
        })
        .collect();

    let mut body = serde_json::json!({
        "entries": entries,
        "count": entries.len(),
    });
    if params.verify.unwrap_or(false) {
        body["chain_valid"] = match state.audit.verify() {
            Ok(()) => serde_json::json!(true),
            Err(seq) => serde_json::json!({ "valid": false, "first_bad_seq": seq }),
        };
    }
    Ok(Json(body).into_response())
}
