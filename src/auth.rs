//! Admin authentication for the REST surface.
//!
//! `/api/*` routes (other than the health probe) expect the pre-shared
//! admin key as `Authorization: Bearer <key>`. The WebSocket paths are not
//! gated here — devices present their per-device secret and clients a
//! session token, both as query parameters, because the browser WebSocket
//! API cannot attach headers to the upgrade request.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Request extension carrying the configured admin key. Installed as a
/// router layer in `main` so this middleware needs no handle on `AppState`.
#[derive(Clone)]
pub struct AdminKey(pub String);

/// Middleware gating the admin REST routes.
///
/// Responds `401` when no Bearer token is presented, `403` when one is
/// presented but does not match, and `500` when the [`AdminKey`] layer is
/// missing from the router.
pub async fn require_admin_key(request: Request, next: Next) -> Response {
    let Some(expected) = request.extensions().get::<AdminKey>().cloned() else {
        return deny(StatusCode::INTERNAL_SERVER_ERROR, "Admin key not configured");
    };

    let presented = bearer_token(&request).map(ToString::to_string);
    match presented {
        Some(key) if secrets_match(expected.0.as_bytes(), key.as_bytes()) => {
            next.run(request).await
        }
        Some(_) => deny(StatusCode::FORBIDDEN, "Admin key rejected"),
        None => deny(StatusCode::UNAUTHORIZED, "Admin key required"),
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header, if any.
fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn deny(status: StatusCode, message: &'static str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

/// Branch-free comparison of a presented secret against the expected one.
///
/// The scan covers the longer of the two inputs in full, with mismatched
/// padding past the shorter one, so the time taken reveals neither where a
/// mismatch begins nor which side ran out first. The length check at the
/// end decides the cases the padding cannot.
pub fn secrets_match(expected: &[u8], presented: &[u8]) -> bool {
    let mut mismatch = 0u8;
    for i in 0..expected.len().max(presented.len()) {
        let e = expected.get(i).copied().unwrap_or(0x00);
        let p = presented.get(i).copied().unwrap_or(0xaa);
        mismatch |= e ^ p;
    }
    mismatch == 0 && expected.len() == presented.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match(b"cafe-key", b"cafe-key"));
        assert!(secrets_match(b"", b""));
        assert!(!secrets_match(b"cafe-key", b"cafe-kez"));
        assert!(!secrets_match(b"cafe-key", b"cafe-ke"));
        assert!(!secrets_match(b"cafe-key", b"cafe-keyy"));
        assert!(!secrets_match(b"cafe-key", b""));
        assert!(!secrets_match(b"", b"cafe-key"));
    }

    #[test]
    fn test_secrets_match_is_not_fooled_by_padding() {
        // A longer input whose tail happens to equal the pad byte still
        // fails on the length check.
        assert!(!secrets_match(b"key\xaa", b"key"));
        assert!(!secrets_match(b"key", b"key\x00"));
    }

    fn request_with_auth(value: Option<&str>) -> Request {
        let builder = axum::http::Request::builder().uri("/api/stats");
        let builder = match value {
            Some(v) => builder.header(header::AUTHORIZATION, v),
            None => builder,
        };
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_token_extraction() {
        let request = request_with_auth(Some("Bearer kaffe"));
        assert_eq!(bearer_token(&request), Some("kaffe"));

        let request = request_with_auth(Some("Basic kaffe"));
        assert_eq!(bearer_token(&request), None);

        let request = request_with_auth(None);
        assert_eq!(bearer_token(&request), None);
    }
}
