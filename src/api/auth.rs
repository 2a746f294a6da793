// =============================================================================
// Admin Authentication — bearer check against the runtime config
// =============================================================================
//
// The expected token comes from `RuntimeConfig::admin_token` (populated from
// `ARGUS_ADMIN_TOKEN` at startup), not from a per-request env read: the
// config is the single place operators look for tunables, and the API
// context already carries it. An unconfigured token means the authenticated
// surface is off entirely (503); a bad or absent header is 401/403.
//
// Token comparison is timing-independent: the xor-fold touches every byte
// of both values whenever the lengths line up.
// =============================================================================

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};
use tracing::warn;

use crate::api::rest::ApiContext;

/// Marker extractor: its presence in a handler signature makes that route
/// require a valid admin token.
pub struct AdminAuth;

/// Why a request was rejected, mapped to a status + message pair.
enum AuthFailure {
    NotConfigured,
    MissingHeader,
    WrongToken,
}

impl AuthFailure {
    fn response(self) -> (StatusCode, axum::Json<serde_json::Value>) {
        let (status, message) = match self {
            Self::NotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                "admin token not configured on this instance",
            ),
            Self::MissingHeader => (StatusCode::UNAUTHORIZED, "bearer token required"),
            Self::WrongToken => (StatusCode::FORBIDDEN, "admin token rejected"),
        };
        (status, axum::Json(serde_json::json!({"error": message})))
    }
}

/// Pull the bearer token out of the Authorization header, if any.
fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Timing-independent equality: once the lengths match, every byte pair is
/// folded regardless of where the first mismatch sits.
fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn check(parts: &Parts, expected: Option<&str>) -> Result<(), AuthFailure> {
    let Some(expected) = expected else {
        warn!("authenticated request rejected — ARGUS_ADMIN_TOKEN unset");
        return Err(AuthFailure::NotConfigured);
    };
    let Some(presented) = bearer_token(parts) else {
        return Err(AuthFailure::MissingHeader);
    };
    if !tokens_match(presented, expected) {
        warn!("admin token rejected");
        return Err(AuthFailure::WrongToken);
    }
    Ok(())
}

#[async_trait]
impl FromRequestParts<Arc<ApiContext>> for AdminAuth {
    type Rejection = (StatusCode, axum::Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &Arc<ApiContext>,
    ) -> Result<Self, Self::Rejection> {
        check(parts, ctx.state.config.admin_token.as_deref())
            .map(|()| AdminAuth)
            .map_err(AuthFailure::response)
    }
}
