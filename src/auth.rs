use axum::http::{HeaderMap, StatusCode};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// Key from `x-api-key`, falling back to `Authorization: Bearer`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    let from_header = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    from_header.or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

/// Checks the caller's key against the configured one. No configured key disables the check.
pub fn check_api_key(headers: &HeaderMap, expected: Option<&str>) -> AppResult<()> {
    let Some(expected) = expected.filter(|k| !k.is_empty()) else {
        return Ok(());
    };
    let Some(provided) = extract_api_key(headers) else {
        return Err(AppError::invalid_request("empty api key").with_status(StatusCode::UNAUTHORIZED));
    };
    // Compare digests so the comparison time does not depend on the key prefix.
    if Sha256::digest(provided.as_bytes()) != Sha256::digest(expected.as_bytes()) {
        tracing::debug!("rejected request with invalid api key");
        return Err(AppError::invalid_request("invalid api key").with_status(StatusCode::UNAUTHORIZED));
    }
    Ok(())
}
