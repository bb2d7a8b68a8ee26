// =============================================================================
// Echo-bridge token authentication
// =============================================================================
//
// The desktop shell passes the shared secret from `PRISM_ECHO_TOKEN` on
// every request, either as an `X-Echo-Bridge-Token` header or as a Bearer
// token. Comparison runs in constant time to avoid timing side-channels.
// The token is read per request so rotation needs no restart.
// =============================================================================

use axum::http::HeaderMap;
use tracing::warn;

const TOKEN_ENV: &str = "PRISM_ECHO_TOKEN";
const DEV_FALLBACK_TOKEN: &str = "dev-echo-bridge-secret";

/// Compare two byte slices in constant time. Every byte is examined even
/// after a mismatch is found.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn expected_token() -> String {
    std::env::var(TOKEN_ENV).unwrap_or_else(|_| DEV_FALLBACK_TOKEN.to_string())
}

/// Validate a bare token string (used for SSE query-param auth where the
/// browser cannot set headers).
pub fn validate_token(token: &str) -> bool {
    constant_time_eq(token.as_bytes(), expected_token().as_bytes())
}

/// Extract and validate the token from request headers.
pub fn validate_headers(headers: &HeaderMap) -> bool {
    if let Some(token) = headers.get("X-Echo-Bridge-Token").and_then(|v| v.to_str().ok()) {
        if validate_token(token) {
            return true;
        }
    }
    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if validate_token(token) {
                return true;
            }
        }
    }
    warn!("echo-bridge request with missing or invalid token");
    false
}
