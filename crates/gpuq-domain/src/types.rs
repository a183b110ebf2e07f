use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        TaskId(s.into())
    }

    pub fn generate() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 chars, used for container names and log context.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self {
        SessionId(s.into())
    }

    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(s: impl Into<String>) -> Self {
        ModelId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(s: impl Into<String>) -> Self {
        ContainerId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric accelerator device index as exposed by the engine (`--gpus device=N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Coarse device partition. Tasks are only routed to devices of the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityClass {
    Low,
    High,
}

impl std::fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityClass::Low => write!(f, "low"),
            CapabilityClass::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Oneoff,
    Session,
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskMode::Oneoff => write!(f, "oneoff"),
            TaskMode::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Session lifecycle.
///
/// Transitions:
///   Initializing → Waiting → Working → Waiting → … → Killed
/// `Killed` is terminal; `kill()` is valid from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Waiting,
    Working,
    Killed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Initializing => write!(f, "initializing"),
            SessionState::Waiting => write!(f, "waiting"),
            SessionState::Working => write!(f, "working"),
            SessionState::Killed => write!(f, "killed"),
        }
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

/// One accelerator device in the pool.
///
/// Ownership invariant: `available == holder.is_none()`. The only mutators are
/// [`Device::allocate_to`] and [`Device::release`], which preserve it; telemetry
/// refresh touches the metric fields only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub class: CapabilityClass,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub temperature_c: f32,
    pub utilization_pct: f32,
    pub available: bool,
    /// Task or session id currently holding this device.
    pub holder: Option<String>,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, class: CapabilityClass, memory_total_mb: u64) -> Self {
        Self {
            id,
            name: name.into(),
            class,
            memory_total_mb,
            memory_used_mb: 0,
            temperature_c: 0.0,
            utilization_pct: 0.0,
            available: true,
            holder: None,
        }
    }

    /// Claim the device for `holder`. Returns false if already held.
    pub fn allocate_to(&mut self, holder: impl Into<String>) -> bool {
        if !self.available {
            return false;
        }
        self.available = false;
        self.holder = Some(holder.into());
        true
    }

    /// Free the device, returning the previous holder (None if it was free).
    pub fn release(&mut self) -> Option<String> {
        self.available = true;
        self.holder.take()
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

/// A single submission, one-off or bound to a session.
/// Exclusively owned by the pipeline run that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Template name this task was resolved from.
    pub name: String,
    pub mode: TaskMode,
    pub class: CapabilityClass,
    pub timeout_seconds: u64,
    pub metadata: HashMap<String, serde_json::Value>,
    pub model_id: Option<ModelId>,
    pub session_id: Option<SessionId>,
    pub container_id: Option<ContainerId>,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: impl Into<String>,
        mode: TaskMode,
        class: CapabilityClass,
        timeout_seconds: u64,
        metadata: HashMap<String, serde_json::Value>,
        model_id: Option<ModelId>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            name: name.into(),
            mode,
            class,
            timeout_seconds,
            metadata,
            model_id,
            session_id,
            container_id: None,
            state: TaskState::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Whole seconds since `started_at`, up to `completed_at` or now.
    /// None if the task never started.
    pub fn elapsed_seconds(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_seconds())
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Metadata for a long-lived worker container bound to one device and one
/// model. The FIFO request queue lives next to this in the session registry —
/// this struct is the clonable view of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub container_id: ContainerId,
    pub device_id: DeviceId,
    pub model_id: ModelId,
    pub class: CapabilityClass,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
    pub current_task_id: Option<TaskId>,
}

impl Session {
    /// The id is generated before container creation so the container can be
    /// labeled with it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: SessionId,
        container_id: ContainerId,
        device_id: DeviceId,
        model_id: ModelId,
        class: CapabilityClass,
        idle_timeout_seconds: u64,
        max_lifetime_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            container_id,
            device_id,
            model_id,
            class,
            state: SessionState::Initializing,
            created_at: now,
            last_activity: now,
            idle_timeout_seconds,
            max_lifetime_seconds,
            current_task_id: None,
        }
    }

    pub fn mark_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Idle check applies to `Waiting` sessions only: a working session is
    /// never idle, and an initializing one hasn't had a chance to be.
    pub fn idle_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Waiting
            && (now - self.last_activity).num_seconds() > self.idle_timeout_seconds as i64
    }

    pub fn lifetime_exceeded(&self, now: DateTime<Utc>) -> bool {
        (now - self.created_at).num_seconds() > self.max_lifetime_seconds as i64
    }
}

/// API-facing view of a session, including the queue depth the registry tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub session: Session,
    pub queue_size: usize,
}
