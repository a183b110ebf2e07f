use gpuq_domain::ModelId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model {0} is not cached and auto-fetch is disabled")]
    NotCached(ModelId),

    #[error("fetching model {model} failed: file service returned HTTP {status}")]
    FetchFailed { model: ModelId, status: u16 },

    #[error("fetching model failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal model cache error: {0}")]
    Internal(String),
}
