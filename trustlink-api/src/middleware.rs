use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::ApiState;

pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Reject requests without the configured admin token.
/// With no token configured the admin surface is closed.
pub async fn require_admin(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = state
        .admin_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !token_matches(provided, expected) {
        warn!("Rejected admin request to {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

/// Compare tokens in constant time.
///
/// Both sides are reduced to an HMAC tag keyed with the expected token, so
/// neither the content nor the length of the provided token affects timing.
fn token_matches(provided: &str, expected: &str) -> bool {
    let tag = |value: &str| {
        Hmac::<Sha256>::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };

    match (tag(provided), tag(expected)) {
        (Ok(provided), Ok(expected)) => provided
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches() {
        assert!(token_matches("admin-token", "admin-token"));
        assert!(!token_matches("admin-tokem", "admin-token"));
        assert!(!token_matches("admin", "admin-token"));
        assert!(!token_matches("admin-token-and-more", "admin-token"));
        assert!(!token_matches("", "admin-token"));
    }
}
