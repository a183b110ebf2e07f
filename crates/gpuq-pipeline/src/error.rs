use gpuq_config::ConfigError;
use gpuq_domain::{CapabilityClass, ModelId, SessionId};
use thiserror::Error;

/// Pre-stream failures. These surface as HTTP errors; once the event stream
/// is open, failures become `task_finish` events instead.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("task definition not found: {0}")]
    UnknownTemplate(String),

    #[error("session {0} not found")]
    UnknownSession(SessionId),

    #[error("session {session} runs model {session_model}, but the task requires {required}")]
    ModelMismatch {
        session: SessionId,
        session_model: ModelId,
        required: String,
    },

    #[error("session {0} queue is full")]
    QueueFull(SessionId),

    #[error("no available device with class={0}")]
    NoDevice(CapabilityClass),

    #[error("model {0} not available and fetch failed")]
    ModelUnavailable(ModelId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ConfigError> for AdmissionError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::UnknownTemplate(name) | ConfigError::MissingAction(name) => {
                AdmissionError::UnknownTemplate(name)
            }
            other => AdmissionError::Internal(other.to_string()),
        }
    }
}
