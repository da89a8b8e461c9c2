//! Credential and tenant resolution.
//!
//! Maps the inbound bearer token to its tenant, user, team, roles and
//! privacy posture via an axum extractor. Token comparison is constant-time
//! across the whole key table so lookup behavior leaks nothing about which
//! prefix matched. Keys are never logged.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;

use crate::canonical::{Priority, PrivacyMode};
use crate::error::GatewayError;
use crate::AppState;

pub const PRIVACY_MODE_HEADER: &str = "x-privacy-mode";
pub const PROJECT_ID_HEADER: &str = "x-project-id";
pub const PRIORITY_HEADER: &str = "x-priority";
pub const MFA_VERIFIED_HEADER: &str = "x-mfa-verified";

/// Resolved caller identity attached to every handled request.
#[derive(Debug, Clone)]
pub struct AuthenticatedRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub team_id: Option<String>,
    pub roles: Vec<String>,
    pub privacy_mode: PrivacyMode,
    pub project_id: Option<String>,
    pub priority: Priority,
    pub mfa_verified: bool,
}

impl AuthenticatedRequest {
    pub fn privacy_strict(&self) -> bool {
        self.privacy_mode == PrivacyMode::Strict
    }
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedRequest {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = header(parts, "authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(GatewayError::Unauthorized)?;

        let snapshot = state.gateway.current();

        // Scan the whole table; every candidate costs one comparison.
        let mut matched = None;
        for key in &snapshot.config.api_keys {
            if constant_time_eq(token.as_bytes(), key.token.as_bytes()) {
                matched = Some(key);
            }
        }
        let key = matched.ok_or(GatewayError::Unauthorized)?;

        // Strict privacy can be forced per-request but never weakened below
        // what the key itself mandates.
        let privacy_mode = if key.privacy_strict
            || header(parts, PRIVACY_MODE_HEADER) == Some("strict")
        {
            PrivacyMode::Strict
        } else {
            PrivacyMode::Standard
        };

        let priority = match header(parts, PRIORITY_HEADER) {
            Some("critical") => Priority::Critical,
            _ => Priority::Normal,
        };

        Ok(AuthenticatedRequest {
            tenant_id: key.tenant_id.clone(),
            user_id: key.user_id.clone(),
            team_id: key.team_id.clone(),
            roles: key.roles.clone(),
            privacy_mode,
            project_id: header(parts, PROJECT_ID_HEADER).map(str::to_string),
            priority,
            mfa_verified: header(parts, MFA_VERIFIED_HEADER) == Some("true"),
        })
    }
}
