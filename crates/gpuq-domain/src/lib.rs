pub mod error;
pub mod event;
pub mod types;

pub use error::DomainError;
pub use event::{
    parse_log_line, ConnectionStatus, FinishStatus, StreamEvent, WorkerPhase,
};
pub use types::{
    CapabilityClass, ContainerId, Device, DeviceId, ModelId, Session, SessionId,
    SessionSnapshot, SessionState, Task, TaskId, TaskMode, TaskState,
};
