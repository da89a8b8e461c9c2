//! Cache invalidation surface.

use axum::extract::{Path, State};
use axum::Json;
use std::sync::Arc;

use crate::auth::AuthenticatedRequest;
use crate::error::GatewayError;
use crate::wallet::WalletStore;
use crate::AppState;

/// DELETE /v1/cache/{namespace}
///
/// Flush the caller tenant's semantic cache for one namespace. The flush is
/// audited against the tenant's org wallet.
pub async fn invalidate(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedRequest,
    Path(namespace): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let removed = state.cache.invalidate(&auth.tenant_id, &namespace);
    state.audit.record_cache_invalidation(
        &WalletStore::org_wallet_id(&auth.tenant_id),
        &namespace,
        removed,
    );

    tracing::info!(
        tenant_id = %auth.tenant_id,
        namespace = %namespace,
        removed,
        "cache namespace invalidated"
    );

    Ok(Json(serde_json::json!({
        "namespace": namespace,
        "removed": removed,
    })))
}
