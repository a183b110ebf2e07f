use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::state::AppState;

/// Axum middleware that requires a valid `X-Api-Key` header.
///
/// Returns 401 for missing or incorrect keys. Applied to the task and session
/// routes; health endpoints stay open for probe traffic.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if key == state.api_key.as_str() => next.run(request).await,
        _ => ApiError::unauthorized("Invalid API key").into_response(),
    }
}
