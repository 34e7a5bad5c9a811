use axum::http::HeaderMap;

/// Header carrying a client-chosen retry token for non-idempotent commands.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// The request's idempotency key, if one was sent.
pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
