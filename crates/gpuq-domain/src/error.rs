use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid capability class: {0}")]
    InvalidCapabilityClass(String),

    #[error("invalid task mode: {0}")]
    InvalidTaskMode(String),

    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid timeout: {0}s (allowed {1}..={2})")]
    InvalidTimeout(u64, u64, u64),
}
