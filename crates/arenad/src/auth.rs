//! Shared-secret check on the callback routes.

use std::sync::Arc;

use arena_core::WEBHOOK_SECRET_HEADER;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::ApiError;
use crate::AppState;

fn fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Whether `presented` matches `expected`.
///
/// Both sides are hashed first so the comparison runs over equal-length
/// digests whatever the caller sent.
pub fn secret_matches(expected: &str, presented: Option<&str>) -> bool {
    match presented {
        Some(presented) => fingerprint(expected) == fingerprint(presented),
        None => false,
    }
}

/// Rejects callbacks without the configured `x-webhook-secret`.
/// With no secret configured every request passes.
pub async fn require_webhook_secret(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.webhook_secret.as_deref() {
        let presented = request
            .headers()
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|h| h.to_str().ok());
        if !secret_matches(expected, presented) {
            warn!(path = %request.uri().path(), "rejected callback with bad webhook secret");
            return Err(ApiError::unauthorized());
        }
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_matches() {
        assert!(secret_matches("s3cret", Some("s3cret")));
        assert!(!secret_matches("s3cret", Some("s3cret ")));
        assert!(!secret_matches("s3cret", Some("")));
        assert!(!secret_matches("s3cret", None));
    }
}
