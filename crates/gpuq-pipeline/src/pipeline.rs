use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use gpuq_config::{Overrides, TaskAction};
use gpuq_domain::{
    parse_log_line, ConnectionStatus, DeviceId, FinishStatus, Session, SessionId, SessionState,
    StreamEvent, Task, TaskMode, TaskState, WorkerPhase,
};
use gpuq_engine::{OneoffSpec, SessionSpec};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::spawn_dispatcher;
use crate::error::AdmissionError;
use crate::services::Services;

/// Timeout is re-checked on every log line and on this tick between lines, so
/// a silent worker cannot outlive its budget.
const TIMEOUT_TICK: Duration = Duration::from_secs(1);

/// Container path the model directory is mounted at.
const MODEL_MOUNT_PATH: &str = "/models";

/// A validated submission, before template resolution.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_name: String,
    pub overrides: Overrides,
    pub session_id: Option<SessionId>,
    pub create_session: bool,
}

#[derive(Debug, Clone)]
enum Launch {
    Oneoff { device_id: DeviceId },
    /// Task already sits in the queue of an existing session.
    SessionEnqueued { session: Session },
    /// A fresh session container must be created on this device.
    SessionNew { device_id: DeviceId },
}

/// How a stream ended. Exactly one of these becomes the stream's single
/// `task_finish` frame.
enum Terminal {
    /// Container exited; no explicit finish event from the worker.
    Completed { elapsed: i64 },
    /// The worker's own `task_finish` event.
    WorkerFinish(StreamEvent),
    Timeout { elapsed: i64 },
    Failed(String),
    Cancelled(&'static str),
    /// Client dropped the stream; the cancelled frame is sent best-effort.
    ClientGone,
}

/// Entry point for one submission: admission first (errors map to HTTP),
/// then a [`PreparedTask`] that owns the streamed execution and its cleanup.
pub struct TaskPipeline {
    services: Services,
}

impl TaskPipeline {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Admission: resolve the template, stage the model, secure a device or a
    /// session queue slot. On success no stream has been opened yet and all
    /// held resources are recorded in the returned task.
    pub async fn prepare(&self, req: SubmitRequest) -> Result<PreparedTask, AdmissionError> {
        let resolved = self.services.catalog.resolve(&req.task_name, &req.overrides)?;
        let def = resolved.definition;

        let mut task = Task::create(
            def.name.clone(),
            def.mode,
            def.class,
            def.timeout_seconds,
            def.metadata,
            def.model_id.clone(),
            req.session_id.clone(),
        );
        info!(
            task_id = %task.id,
            task = %task.name,
            mode = %task.mode,
            class = %task.class,
            "admitting task"
        );

        // Stage the model if the template anchors one. Nothing is held yet,
        // so a fetch failure is a clean admission refusal.
        let model_host_path = match &resolved.model_path {
            Some(entry) => match self.services.models.ensure(&entry.model_id).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(task_id = %task.id, model_id = %entry.model_id, error = %e, "model staging failed");
                    return Err(AdmissionError::ModelUnavailable(entry.model_id.clone()));
                }
            },
            None => None,
        };

        let launch = match (&req.session_id, task.mode) {
            (Some(session_id), _) => self.admit_to_session(session_id, &mut task).await?,
            (None, TaskMode::Session) => self.admit_session_mode(&req, &mut task).await?,
            (None, TaskMode::Oneoff) => {
                let device_id = self
                    .services
                    .devices
                    .allocate(task.class, task.id.as_str())
                    .await
                    .ok_or(AdmissionError::NoDevice(task.class))?;
                Launch::Oneoff { device_id }
            }
        };

        Ok(PreparedTask {
            services: self.services.clone(),
            task,
            action: resolved.action,
            model_host_path,
            launch,
        })
    }

    /// Explicit session id: the session must exist, run the same model, and
    /// have queue room.
    async fn admit_to_session(
        &self,
        session_id: &SessionId,
        task: &mut Task,
    ) -> Result<Launch, AdmissionError> {
        let session = self
            .services
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| AdmissionError::UnknownSession(session_id.clone()))?;

        if task.model_id.as_ref() != Some(&session.model_id) {
            return Err(AdmissionError::ModelMismatch {
                session: session_id.clone(),
                session_model: session.model_id.clone(),
                required: task
                    .model_id
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "no model".to_string()),
            });
        }

        task.session_id = Some(session_id.clone());
        if !self.services.sessions.enqueue(session_id, task.clone()).await {
            return Err(AdmissionError::QueueFull(session_id.clone()));
        }
        Ok(Launch::SessionEnqueued { session })
    }

    /// Session-mode task without an explicit id: reuse an idle session with
    /// the same model when allowed, otherwise claim a device for a new one.
    /// A full queue on the reuse candidate falls through to a fresh session.
    async fn admit_session_mode(
        &self,
        req: &SubmitRequest,
        task: &mut Task,
    ) -> Result<Launch, AdmissionError> {
        let Some(model_id) = task.model_id.clone() else {
            return Err(AdmissionError::Internal(format!(
                "session template '{}' names no model",
                task.name
            )));
        };

        if !req.create_session {
            if let Some(session) = self.services.sessions.find_idle_with_model(&model_id).await {
                task.session_id = Some(session.id.clone());
                if self.services.sessions.enqueue(&session.id, task.clone()).await {
                    return Ok(Launch::SessionEnqueued { session });
                }
                warn!(session_id = %session.id, "idle session queue filled up, creating a new session");
                task.session_id = None;
            }
        }

        let device_id = self
            .services
            .devices
            .allocate(task.class, task.id.as_str())
            .await
            .ok_or(AdmissionError::NoDevice(task.class))?;
        Ok(Launch::SessionNew { device_id })
    }
}

/// One admitted submission, from stream open to cleanup. The finally path
/// (unregister, device release for one-offs, best-effort stop) runs on every
/// exit, including client disconnect.
pub struct PreparedTask {
    services: Services,
    task: Task,
    action: TaskAction,
    model_host_path: Option<PathBuf>,
    launch: Launch,
}

impl std::fmt::Debug for PreparedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTask")
            .field("task", &self.task)
            .field("action", &self.action)
            .field("model_host_path", &self.model_host_path)
            .field("launch", &self.launch)
            .finish()
    }
}

impl PreparedTask {
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Run the stream phase, emitting events into `tx`. Exactly one
    /// `task_finish` is produced on every path that reaches here.
    pub async fn run(mut self, tx: mpsc::Sender<StreamEvent>) {
        let terminal = self.execute(&tx).await;

        self.task.completed_at = Some(Utc::now());
        self.task.state = match &terminal {
            Terminal::Completed { .. } => TaskState::Completed,
            Terminal::WorkerFinish(StreamEvent::TaskFinish {
                status: FinishStatus::Completed,
                ..
            }) => TaskState::Completed,
            _ => TaskState::Failed,
        };

        let event = match &terminal {
            Terminal::Completed { elapsed } => {
                info!(task_id = %self.task.id, elapsed, "task completed");
                StreamEvent::task_finish(FinishStatus::Completed, Some(*elapsed), None)
            }
            Terminal::WorkerFinish(ev) => ev.clone(),
            Terminal::Timeout { elapsed } => {
                warn!(task_id = %self.task.id, elapsed, "task exceeded timeout");
                StreamEvent::task_finish(
                    FinishStatus::Timeout,
                    Some(*elapsed),
                    Some("Task timeout exceeded".to_string()),
                )
            }
            Terminal::Failed(msg) => {
                warn!(task_id = %self.task.id, error = %msg, "task failed");
                StreamEvent::task_finish(
                    FinishStatus::Failed,
                    self.task.elapsed_seconds(),
                    Some(msg.clone()),
                )
            }
            Terminal::Cancelled(reason) => {
                info!(task_id = %self.task.id, reason, "task cancelled");
                StreamEvent::task_finish(
                    FinishStatus::Cancelled,
                    None,
                    Some("Task cancelled".to_string()),
                )
            }
            Terminal::ClientGone => {
                info!(task_id = %self.task.id, "client disconnected mid-stream");
                StreamEvent::task_finish(
                    FinishStatus::Cancelled,
                    None,
                    Some("Task cancelled".to_string()),
                )
            }
        };
        // May not reach a disconnected client; the frame is still the record.
        let _ = tx.send(event).await;

        self.cleanup(&terminal).await;
    }

    async fn execute(&mut self, tx: &mpsc::Sender<StreamEvent>) -> Terminal {
        match self.launch.clone() {
            Launch::Oneoff { device_id } => self.run_oneoff(device_id, tx).await,
            Launch::SessionEnqueued { session } => {
                let ev = StreamEvent::connection(
                    ConnectionStatus::SessionReady,
                    Some(session.device_id.as_u32()),
                    Some(session.id.to_string()),
                );
                if tx.send(ev).await.is_err() {
                    return Terminal::ClientGone;
                }
                self.begin_running(Some(&session)).await;
                self.watch_session(session, tx).await
            }
            Launch::SessionNew { device_id } => self.run_session_new(device_id, tx).await,
        }
    }

    async fn run_oneoff(&mut self, device_id: DeviceId, tx: &mpsc::Sender<StreamEvent>) -> Terminal {
        let ev = StreamEvent::connection(ConnectionStatus::Allocated, Some(device_id.as_u32()), None);
        if tx.send(ev).await.is_err() {
            return Terminal::ClientGone;
        }

        let mut env = self.action.env.clone();
        merge_metadata_env(&mut env, &self.task.metadata);
        let mut mounts = HashMap::new();
        if let Some(path) = &self.model_host_path {
            mounts.insert(path.clone(), MODEL_MOUNT_PATH.to_string());
            env.insert("MODEL_PATH".to_string(), MODEL_MOUNT_PATH.to_string());
        }

        let spec = OneoffSpec {
            task_id: self.task.id.clone(),
            device_id,
            class: self.task.class,
            image: self.action.image.clone(),
            command: self.action.command.clone(),
            env,
            mounts,
        };
        let container = match self.services.engine.create_oneoff(&spec).await {
            Ok(c) => c,
            Err(e) => return Terminal::Failed(format!("container creation failed: {}", e)),
        };

        self.task.container_id = Some(container.clone());
        self.begin_running(None).await;

        let ev = StreamEvent::worker(WorkerPhase::Created, Some(container.to_string()));
        if tx.send(ev).await.is_err() {
            return Terminal::ClientGone;
        }

        self.watch_oneoff(&container, tx).await
    }

    async fn run_session_new(
        &mut self,
        device_id: DeviceId,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Terminal {
        let ev = StreamEvent::connection(ConnectionStatus::Allocated, Some(device_id.as_u32()), None);
        if tx.send(ev).await.is_err() {
            return Terminal::ClientGone;
        }

        // Both checked at admission for session-mode tasks.
        let (Some(model_id), Some(model_path)) =
            (self.task.model_id.clone(), self.model_host_path.clone())
        else {
            return Terminal::Failed("session task without a staged model".to_string());
        };

        let session_id = SessionId::generate();
        let mut env = self.action.env.clone();
        merge_metadata_env(&mut env, &self.task.metadata);

        let spec = SessionSpec {
            session_id: session_id.clone(),
            device_id,
            model_id: model_id.clone(),
            image: self.action.image.clone(),
            command: self.action.command.clone(),
            env,
            model_host_path: model_path,
        };
        let container = match self.services.engine.create_session(&spec).await {
            Ok(c) => c,
            Err(e) => return Terminal::Failed(format!("session container creation failed: {}", e)),
        };

        let session = self
            .services
            .sessions
            .create(session_id.clone(), container.clone(), device_id, model_id, self.task.class)
            .await;
        self.task.session_id = Some(session_id.clone());
        self.task.container_id = Some(container);
        spawn_dispatcher(self.services.clone(), session_id.clone());

        if !self.services.sessions.enqueue(&session_id, self.task.clone()).await {
            // Fresh queue refusing a task means the session is unusable; kill
            // reclaims the container and the device.
            self.services.sessions.kill(&session_id, "error").await;
            return Terminal::Failed("failed to enqueue first task on a fresh session".to_string());
        }

        self.begin_running(Some(&session)).await;
        self.watch_session(session, tx).await
    }

    /// Step 6: stamp running state and register with the running-task map.
    async fn begin_running(&mut self, session: Option<&Session>) {
        self.task.state = TaskState::Running;
        self.task.started_at = Some(Utc::now());
        if let Some(session) = session {
            self.task.container_id = Some(session.container_id.clone());
        }
        self.services
            .tasks
            .register(
                self.task.id.clone(),
                self.task.container_id.clone(),
                self.task.session_id.clone(),
            )
            .await;
    }

    /// One-off stream: forward parsed events until the container exits, the
    /// worker emits its own finish, or the timeout trips.
    async fn watch_oneoff(
        &mut self,
        container: &gpuq_domain::ContainerId,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Terminal {
        let mut logs = match self.services.engine.stream_logs(container, true).await {
            Ok(rx) => rx,
            Err(e) => return Terminal::Failed(format!("log stream failed: {}", e)),
        };
        let started = tokio::time::Instant::now();
        let budget = self.task.timeout_seconds;

        loop {
            // A dropped receiver is the client hanging up; don't wait for the
            // next send to find out.
            if tx.is_closed() {
                return Terminal::ClientGone;
            }

            let elapsed = started.elapsed().as_secs();
            if elapsed > budget {
                if let Err(e) = self
                    .services
                    .engine
                    .stop(container, self.services.settings.container_stop_grace_secs)
                    .await
                {
                    warn!(task_id = %self.task.id, error = %e, "stop after timeout failed");
                }
                return Terminal::Timeout { elapsed: elapsed as i64 };
            }

            match tokio::time::timeout(TIMEOUT_TICK, logs.recv()).await {
                Ok(Some(line)) => {
                    if let Some(event) = parse_log_line(&line) {
                        if matches!(event, StreamEvent::TaskFinish { .. }) {
                            return Terminal::WorkerFinish(event);
                        }
                        if tx.send(event).await.is_err() {
                            return Terminal::ClientGone;
                        }
                    }
                }
                Ok(None) => {
                    return Terminal::Completed { elapsed: started.elapsed().as_secs() as i64 }
                }
                Err(_) => {} // tick; re-check the timeout
            }
        }
    }

    /// Session stream: the terminal is the worker's `task_finish` for *our*
    /// task (the session container outlives any one task). A finish seen
    /// while another task is current belongs to that task's stream and is
    /// dropped here. Session disappearance means our queued task was dropped.
    async fn watch_session(&mut self, session: Session, tx: &mpsc::Sender<StreamEvent>) -> Terminal {
        let session_id = session.id.clone();
        let container = session.container_id.clone();

        let mut logs = match self.services.engine.stream_logs(&container, true).await {
            Ok(rx) => rx,
            Err(e) => return Terminal::Failed(format!("log stream failed: {}", e)),
        };
        let started = tokio::time::Instant::now();
        let budget = self.task.timeout_seconds;

        loop {
            if tx.is_closed() {
                return Terminal::ClientGone;
            }
            if self.services.sessions.get(&session_id).await.is_none() {
                return Terminal::Cancelled("session killed");
            }

            let elapsed = started.elapsed().as_secs();
            if elapsed > budget {
                if let Err(e) = self
                    .services
                    .engine
                    .stop(&container, self.services.settings.container_stop_grace_secs)
                    .await
                {
                    warn!(task_id = %self.task.id, error = %e, "stop after timeout failed");
                }
                // The shared container is gone; reclaim the session promptly
                // instead of leaving the sweeper to find the corpse.
                self.services.sessions.kill(&session_id, "task_timeout").await;
                return Terminal::Timeout { elapsed: elapsed as i64 };
            }

            match tokio::time::timeout(TIMEOUT_TICK, logs.recv()).await {
                Ok(Some(line)) => {
                    if let Some(event) = parse_log_line(&line) {
                        self.note_worker_event(&session_id).await;

                        if matches!(event, StreamEvent::TaskFinish { .. }) {
                            let current = self
                                .services
                                .sessions
                                .get(&session_id)
                                .await
                                .and_then(|s| s.current_task_id);
                            if current.as_ref() == Some(&self.task.id) {
                                self.services.sessions.finish_task(&session_id).await;
                                return Terminal::WorkerFinish(event);
                            }
                            debug!(task_id = %self.task.id, "dropping another task's finish event");
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            return Terminal::ClientGone;
                        }
                    }
                }
                Ok(None) => {
                    if self.services.sessions.get(&session_id).await.is_none() {
                        return Terminal::Cancelled("session killed");
                    }
                    self.services.sessions.kill(&session_id, "container_exit").await;
                    return Terminal::Failed("session container exited unexpectedly".to_string());
                }
                Err(_) => {}
            }
        }
    }

    /// First event from a fresh session container is the worker's readiness
    /// signal: initializing → waiting.
    async fn note_worker_event(&self, session_id: &SessionId) {
        if let Some(session) = self.services.sessions.get(session_id).await {
            if session.state == SessionState::Initializing {
                self.services
                    .sessions
                    .set_state(session_id, SessionState::Waiting)
                    .await;
            }
        }
    }

    /// The finally path. Runs on every exit, including client disconnect.
    async fn cleanup(&self, terminal: &Terminal) {
        self.services.tasks.unregister(&self.task.id).await;

        match &self.launch {
            Launch::Oneoff { device_id } => {
                if let Some(container) = &self.task.container_id {
                    // Anything but a clean exit may have left the container
                    // running; stop is idempotent and swallows missing ids.
                    let exited = matches!(
                        terminal,
                        Terminal::Completed { .. } | Terminal::WorkerFinish(_)
                    );
                    if !exited {
                        if let Err(e) = self
                            .services
                            .engine
                            .stop(container, self.services.settings.container_stop_grace_secs)
                            .await
                        {
                            warn!(task_id = %self.task.id, error = %e, "cleanup stop failed");
                        }
                    }
                }
                self.services.devices.release(*device_id).await;
            }
            Launch::SessionNew { device_id } if self.task.session_id.is_none() => {
                // The session never materialized (container create failed or
                // the client vanished first); the device is still ours.
                self.services.devices.release(*device_id).await;
            }
            Launch::SessionEnqueued { .. } | Launch::SessionNew { .. } => {
                // The session keeps its device. If the session is still
                // working on our task (client cancel mid-task), release it
                // back to waiting so the dispatcher isn't wedged.
                if let Some(session_id) = &self.task.session_id {
                    if let Some(session) = self.services.sessions.get(session_id).await {
                        if session.current_task_id.as_ref() == Some(&self.task.id) {
                            self.services.sessions.finish_task(session_id).await;
                        }
                    }
                }
            }
        }

        debug!(task_id = %self.task.id, "task cleanup complete");
    }
}

/// Task metadata is exported to the worker as METADATA_* environment
/// variables; strings unquoted, everything else as JSON.
fn merge_metadata_env(env: &mut HashMap<String, String>, metadata: &HashMap<String, serde_json::Value>) {
    for (key, value) in metadata {
        let rendered = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        env.insert(format!("METADATA_{}", key.to_uppercase()), rendered);
    }
}
