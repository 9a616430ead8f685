use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::handlers::AppState;
use crate::error::AppError;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Gate for operator endpoints
///
/// SECURITY: fails closed. With no token configured every admin request is
/// refused; tokens are compared as SHA-256 digests so the check does not
/// short-circuit on the first differing byte of the secret.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        warn!("🚫 Admin request refused: no ADMIN_TOKEN configured");
        return Err(AppError::Authorization("admin endpoints are disabled".into()).into_response());
    };

    if !token_matches(req.headers(), expected) {
        warn!("🚫 Admin request refused: bad or missing {}", ADMIN_TOKEN_HEADER);
        return Err(AppError::Authorization("invalid admin token".into()).into_response());
    }

    Ok(next.run(req).await)
}

fn token_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(presented) = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}
