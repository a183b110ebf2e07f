use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gpuq_domain::ContainerId;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use crate::engine::{
    ContainerEngine, ContainerStatus, LogLines, OneoffSpec, SessionSpec,
};
use crate::error::EngineError;

const LOG_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Script {
    lines: Vec<String>,
    /// A hanging container emits its lines and then stays running until
    /// stopped; a non-hanging one exits as soon as its lines are out.
    hang: bool,
}

#[derive(Debug)]
struct MockContainer {
    labels: HashMap<String, String>,
    env: HashMap<String, String>,
    auto_remove: bool,
    /// Every line this container ever produced.
    history: Vec<String>,
    /// Present while the container is running; dropping it ends live streams.
    live: Option<broadcast::Sender<String>>,
    stopped: bool,
    removed: bool,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<ContainerId, MockContainer>,
    exec_calls: Vec<(ContainerId, Vec<String>)>,
    scripts: HashMap<String, Script>,
    counter: u64,
    fail_next_create: bool,
}

/// In-memory engine that simulates containers for tests and probe-less dev.
///
/// Log output is scripted per image: a created container starts with its
/// script as history, and either exits immediately or hangs (keeps running)
/// depending on the script. Tests drive live output with [`MockEngine::push_log`]
/// and end a container with [`MockEngine::finish`]. A removed container's
/// recorded history is still served by `stream_logs`, modeling a real stream
/// that was attached before the container exited.
#[derive(Clone, Default)]
pub struct MockEngine {
    inner: Arc<Mutex<Inner>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a finite container: emits `lines`, then exits.
    pub async fn script_image(&self, image: impl Into<String>, lines: Vec<String>) {
        let mut inner = self.inner.lock().await;
        inner.scripts.insert(image.into(), Script { lines, hang: false });
    }

    /// Script a long-running container: emits `lines`, then stays up.
    pub async fn script_image_hanging(&self, image: impl Into<String>, lines: Vec<String>) {
        let mut inner = self.inner.lock().await;
        inner.scripts.insert(image.into(), Script { lines, hang: true });
    }

    /// Make the next create call fail, as an unknown image would.
    pub async fn fail_next_create(&self) {
        self.inner.lock().await.fail_next_create = true;
    }

    /// Emit a live log line from a running container.
    pub async fn push_log(&self, id: &ContainerId, line: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        if let Some(c) = inner.containers.get_mut(id) {
            let line = line.into();
            c.history.push(line.clone());
            if let Some(tx) = &c.live {
                let _ = tx.send(line);
            }
        }
    }

    /// Simulate the container exiting on its own.
    pub async fn finish(&self, id: &ContainerId) {
        let mut inner = self.inner.lock().await;
        if let Some(c) = inner.containers.get_mut(id) {
            c.live = None;
            if c.auto_remove {
                c.removed = true;
            }
        }
    }

    pub async fn was_stopped(&self, id: &ContainerId) -> bool {
        self.inner.lock().await.containers.get(id).is_some_and(|c| c.stopped)
    }

    pub async fn was_removed(&self, id: &ContainerId) -> bool {
        self.inner.lock().await.containers.get(id).is_some_and(|c| c.removed)
    }

    /// Containers (not yet removed) carrying the given label value.
    pub async fn labeled(&self, key: &str, value: &str) -> Vec<ContainerId> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .iter()
            .filter(|(_, c)| !c.removed && c.labels.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn exec_calls(&self) -> Vec<(ContainerId, Vec<String>)> {
        self.inner.lock().await.exec_calls.clone()
    }

    pub async fn env_of(&self, id: &ContainerId) -> Option<HashMap<String, String>> {
        self.inner.lock().await.containers.get(id).map(|c| c.env.clone())
    }

    /// Most recently created container, removed or not. Ids are sequential.
    pub async fn last_created(&self) -> Option<ContainerId> {
        let inner = self.inner.lock().await;
        (inner.counter > 0).then(|| ContainerId::new(format!("mock-{:08x}", inner.counter)))
    }

    async fn create(
        &self,
        labels: HashMap<String, String>,
        env: HashMap<String, String>,
        image: &str,
        auto_remove: bool,
    ) -> Result<ContainerId, EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_next_create {
            inner.fail_next_create = false;
            return Err(EngineError::CreateFailed(format!("No such image: {}", image)));
        }

        inner.counter += 1;
        let id = ContainerId::new(format!("mock-{:08x}", inner.counter));
        let script = inner.scripts.get(image).cloned().unwrap_or(Script {
            lines: Vec::new(),
            hang: false,
        });

        let live = if script.hang {
            Some(broadcast::channel(LOG_CHANNEL_CAPACITY).0)
        } else {
            None
        };
        let removed = !script.hang && auto_remove;

        inner.containers.insert(
            id.clone(),
            MockContainer {
                labels,
                env,
                auto_remove,
                history: script.lines,
                live,
                stopped: false,
                removed,
            },
        );
        debug!(container_id = %id, image, "mock container created");
        Ok(id)
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_oneoff(&self, spec: &OneoffSpec) -> Result<ContainerId, EngineError> {
        let labels = HashMap::from([
            ("gpuq.task_id".to_string(), spec.task_id.to_string()),
            ("gpuq.class".to_string(), spec.class.to_string()),
            ("gpuq.device_id".to_string(), spec.device_id.to_string()),
            ("gpuq.kind".to_string(), "oneoff".to_string()),
        ]);
        let mut env = spec.env.clone();
        env.insert("TASK_ID".to_string(), spec.task_id.to_string());
        self.create(labels, env, &spec.image, true).await
    }

    async fn create_session(&self, spec: &SessionSpec) -> Result<ContainerId, EngineError> {
        let labels = HashMap::from([
            ("gpuq.session_id".to_string(), spec.session_id.to_string()),
            ("gpuq.model_id".to_string(), spec.model_id.to_string()),
            ("gpuq.device_id".to_string(), spec.device_id.to_string()),
            ("gpuq.kind".to_string(), "session".to_string()),
        ]);
        let mut env = spec.env.clone();
        env.insert("SESSION_ID".to_string(), spec.session_id.to_string());
        env.insert("MODEL_PATH".to_string(), "/models".to_string());
        self.create(labels, env, &spec.image, false).await
    }

    async fn exec(&self, id: &ContainerId, command: &[String]) -> Result<String, EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.containers.get(id) {
            Some(c) if !c.removed => {
                inner.exec_calls.push((id.clone(), command.to_vec()));
                Ok(String::new())
            }
            _ => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn stream_logs(&self, id: &ContainerId, _follow: bool) -> Result<LogLines, EngineError> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);

        // History snapshot and live subscription happen under one lock, so a
        // concurrently pushed line lands in exactly one of the two.
        let inner = self.inner.lock().await;
        let Some(c) = inner.containers.get(id) else {
            warn!(container_id = %id, "log stream requested for unknown mock container");
            return Ok(rx);
        };
        let history = c.history.clone();
        let live = c.live.as_ref().map(|s| s.subscribe());
        drop(inner);

        tokio::spawn(async move {
            for line in history {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            if let Some(mut sub) = live {
                loop {
                    match sub.recv().await {
                        Ok(line) => {
                            if tx.send(line).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn stop(&self, id: &ContainerId, _grace_seconds: u64) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.stopped = true;
                c.live = None;
                if c.auto_remove {
                    c.removed = true;
                }
                Ok(())
            }
            None => {
                warn!(container_id = %id, "stop requested for unknown mock container");
                Ok(())
            }
        }
    }

    async fn remove(&self, id: &ContainerId, _force: bool) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.removed = true;
                c.live = None;
                Ok(())
            }
            None => {
                warn!(container_id = %id, "remove requested for unknown mock container");
                Ok(())
            }
        }
    }

    async fn status(&self, id: &ContainerId) -> Result<Option<ContainerStatus>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.containers.get(id).filter(|c| !c.removed).map(|c| ContainerStatus {
            id: id.clone(),
            status: if c.live.is_some() { "running" } else { "exited" }.to_string(),
            started_at: None,
            finished_at: None,
            exit_code: if c.live.is_some() { None } else { Some(0) },
        }))
    }
}
