use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gpuq_pipeline::AdmissionError;
use serde_json::json;

/// HTTP-mapped error. Body is always `{ "detail": ... }`.
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, detail: msg.into() }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::UNAUTHORIZED, detail: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, detail: msg.into() }
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_IMPLEMENTED, detail: msg.into() }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::SERVICE_UNAVAILABLE, detail: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, detail: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "detail": self.detail }));
        (self.status, body).into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        match &e {
            AdmissionError::UnknownTemplate(_) | AdmissionError::UnknownSession(_) => {
                ApiError::not_found(e.to_string())
            }
            AdmissionError::ModelMismatch { .. } => ApiError::bad_request(e.to_string()),
            AdmissionError::QueueFull(_)
            | AdmissionError::NoDevice(_)
            | AdmissionError::ModelUnavailable(_) => ApiError::unavailable(e.to_string()),
            AdmissionError::Internal(_) => ApiError::internal(e.to_string()),
        }
    }
}
