use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("telemetry probe unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("telemetry read failed for device {device}: {message}")]
    ProbeRead { device: u32, message: String },
}
