use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use gpuq_domain::{CapabilityClass, ContainerId, DeviceId, ModelId, SessionId, TaskId};
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Follow-mode log lines from one container: UTF-8 decoded, newline-trimmed,
/// covering both stdout and stderr. The sequence is finite (the sender side
/// is dropped when the container exits) and not restartable: a consumer that
/// drops the receiver loses its position.
pub type LogLines = mpsc::Receiver<String>;

/// Memory/CPU caps applied to every container, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ContainerLimits {
    pub memory_bytes: i64,
    pub cpu_quota: i64,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self { memory_bytes: 16 * 1024 * 1024 * 1024, cpu_quota: 100_000 }
    }
}

/// Launch request for an ephemeral task container. Created with auto-remove
/// on exit and labeled with the task id and capability class.
#[derive(Debug, Clone)]
pub struct OneoffSpec {
    pub task_id: TaskId,
    pub device_id: DeviceId,
    pub class: CapabilityClass,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    /// host path → container path, mounted read-write.
    pub mounts: HashMap<PathBuf, String>,
}

/// Launch request for a long-lived session container. Not auto-removed; the
/// session registry owns its destruction. The model directory is mounted
/// read-only at `/models`.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub model_id: ModelId,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub model_host_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub status: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub exit_code: Option<i64>,
}

/// Abstraction over the container engine daemon.
///
/// Contracts: both create calls hand the container exactly one device by
/// numeric id plus the configured memory/CPU caps. Unknown container ids on
/// `stop`/`remove`/`status` are warnings, not errors: cleanup must never
/// block on a missing target.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn create_oneoff(&self, spec: &OneoffSpec) -> Result<ContainerId, EngineError>;

    async fn create_session(&self, spec: &SessionSpec) -> Result<ContainerId, EngineError>;

    /// Run a command inside a running container and return its combined output.
    async fn exec(&self, id: &ContainerId, command: &[String]) -> Result<String, EngineError>;

    /// Attach to the container's log output. See [`LogLines`] for the
    /// sequence contract.
    async fn stream_logs(&self, id: &ContainerId, follow: bool) -> Result<LogLines, EngineError>;

    /// Graceful stop with the given grace period before the engine kills.
    async fn stop(&self, id: &ContainerId, grace_seconds: u64) -> Result<(), EngineError>;

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), EngineError>;

    /// None when the engine no longer knows the container.
    async fn status(&self, id: &ContainerId) -> Result<Option<ContainerStatus>, EngineError>;
}
