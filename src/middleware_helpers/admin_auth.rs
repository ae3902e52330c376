use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{errors::ServiceError, AppState};

/// Rejects requests that do not carry `Authorization: Bearer <admin_api_token>`.
///
/// With no token configured every admin request is refused.
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let expected = state
        .config
        .admin_api_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ServiceError::Unauthorized("admin access is disabled".to_string()))?;

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            Ok(next.run(request).await)
        }
        _ => {
            warn!(uri = %request.uri(), "rejected admin request with missing or invalid token");
            Err(ServiceError::Unauthorized(
                "missing or invalid admin token".to_string(),
            ))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
