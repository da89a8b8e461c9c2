//! Gateway error taxonomy.
//!
//! Adapter and wallet errors bubble up typed; the HTTP edge maps each error
//! to the JSON envelope exactly once, here. Upstream credentials never appear
//! in surfaced details.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::credits::Credits;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid credential")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("wallet cannot cover reservation")]
    BudgetExhausted {
        shortfall: Credits,
        available: Credits,
    },

    #[error("transfer rejected: {0}")]
    TransferLimit(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("upstream rejected the request: {0}")]
    UpstreamPermanent(String),

    #[error("upstream protocol violation: {0}")]
    UpstreamProtocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled by client")]
    Cancelled,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::BudgetExhausted { .. } => "budget_exhausted",
            GatewayError::TransferLimit(_) => "transfer_limit",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::UpstreamTransient(_) => "upstream_transient",
            GatewayError::UpstreamPermanent(_) => "upstream_permanent",
            GatewayError::UpstreamProtocol(_) => "upstream_protocol",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Cancelled => "cancelled",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BudgetExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::TransferLimit(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamTransient(_)
            | GatewayError::UpstreamPermanent(_)
            | GatewayError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            // Client already went away; 499 matches common proxy convention.
            GatewayError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            GatewayError::BudgetExhausted {
                shortfall,
                available,
            } => serde_json::json!({
                "shortfall": shortfall.to_decimal(),
                "available": available.to_decimal(),
                "suggestion": "request a credit transfer or wait for the next cycle",
            }),
            GatewayError::RateLimited { retry_after_secs } => serde_json::json!({
                "retry_after_secs": retry_after_secs,
            }),
            _ => serde_json::Value::Null,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": self.details(),
            }
        });

        let mut response = (status, Json(body)).into_response();
        if let GatewayError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::BudgetExhausted {
                shortfall: Credits::from_decimal(0.2),
                available: Credits::from_decimal(0.1),
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::UpstreamTransient("503".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayError::Cancelled.status().as_u16(), 499);
    }

    #[test]
    fn test_budget_details_carry_shortfall() {
        let err = GatewayError::BudgetExhausted {
            shortfall: Credits::from_decimal(0.2),
            available: Credits::from_decimal(0.1),
        };
        let details = err.details();
        assert_eq!(details["shortfall"], 0.2);
        assert_eq!(details["available"], 0.1);
    }
}
