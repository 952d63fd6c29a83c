// =============================================================================
// Bearer Token Authentication - Axum extractor
// =============================================================================
//
// The expected token comes from `SENTINEL_ADMIN_TOKEN`, read per request so a
// rotated token takes effect without a restart. An unset token rejects every
// authenticated request.
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

pub const ADMIN_TOKEN_ENV: &str = "SENTINEL_ADMIN_TOKEN";

/// Compare in constant time with respect to the contents.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn expected_token() -> Option<String> {
    std::env::var(ADMIN_TOKEN_ENV)
        .ok()
        .filter(|t| !t.is_empty())
}

/// Validated `Authorization: Bearer <token>` header.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

/// Check a presented header value against `expected`.
fn check_header(header: Option<&str>, expected: &str) -> Result<String, AuthRejection> {
    let token = header
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthRejection {
            status: StatusCode::UNAUTHORIZED,
            message: "Missing or invalid authorization token",
        })?;

    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        warn!("invalid admin token presented");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "Invalid authorization token",
        });
    }
    Ok(token.to_string())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(expected) = expected_token() else {
            warn!("{ADMIN_TOKEN_ENV} is not set, rejecting authenticated request");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        };

        let header = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        check_header(header, &expected).map(AuthBearer)
    }
}

/// Query-parameter variant for the WebSocket upgrade.
pub fn validate_token(token: &str) -> bool {
    expected_token().is_some_and(|expected| constant_time_eq(token.as_bytes(), expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_cases() {
        assert!(constant_time_eq(b"sentinel", b"sentinel"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"sentinel", b"sentinex"));
        assert!(!constant_time_eq(b"short", b"longer_token"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn header_checks() {
        assert_eq!(check_header(Some("Bearer s3cret"), "s3cret").ok().as_deref(), Some("s3cret"));

        let missing = check_header(None, "s3cret").err().unwrap();
        assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

        let wrong_scheme = check_header(Some("Basic s3cret"), "s3cret").err().unwrap();
        assert_eq!(wrong_scheme.status, StatusCode::UNAUTHORIZED);

        let wrong = check_header(Some("Bearer nope"), "s3cret").err().unwrap();
        assert_eq!(wrong.status, StatusCode::FORBIDDEN);
    }
}
