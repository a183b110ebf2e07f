use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container create failed: {0}")]
    CreateFailed(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("engine API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engine response decode failed: {0}")]
    Decode(String),
}
