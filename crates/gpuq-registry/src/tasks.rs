use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gpuq_domain::{ContainerId, SessionId, TaskId};
use gpuq_engine::ContainerEngine;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Operational record of one in-flight task.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub container_id: Option<ContainerId>,
    pub session_id: Option<SessionId>,
    pub started_at: DateTime<Utc>,
}

/// The global running-task map: operational visibility plus forced shutdown.
pub struct TaskManager {
    running: Mutex<HashMap<TaskId, RunningTask>>,
    engine: Arc<dyn ContainerEngine>,
    stop_grace_secs: u64,
}

impl TaskManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, stop_grace_secs: u64) -> Self {
        Self { running: Mutex::new(HashMap::new()), engine, stop_grace_secs }
    }

    pub async fn register(
        &self,
        task_id: TaskId,
        container_id: Option<ContainerId>,
        session_id: Option<SessionId>,
    ) {
        let mut running = self.running.lock().await;
        running.insert(
            task_id.clone(),
            RunningTask { task_id: task_id.clone(), container_id, session_id, started_at: Utc::now() },
        );
        info!(task_id = %task_id, total = running.len(), "registered running task");
    }

    pub async fn unregister(&self, task_id: &TaskId) {
        let mut running = self.running.lock().await;
        running.remove(task_id);
        info!(task_id = %task_id, remaining = running.len(), "unregistered task");
    }

    pub async fn running(&self) -> Vec<RunningTask> {
        self.running.lock().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Forced shutdown: stop the task's container with the configured grace.
    /// The owning pipeline observes the log stream ending and cleans up.
    pub async fn shutdown_task(&self, task_id: &TaskId) {
        let container = {
            let running = self.running.lock().await;
            match running.get(task_id) {
                Some(t) => t.container_id.clone(),
                None => {
                    warn!(task_id = %task_id, "cannot shut down unknown task");
                    return;
                }
            }
        };

        warn!(task_id = %task_id, "force shutting down task");
        if let Some(container) = container {
            if let Err(e) = self.engine.stop(&container, self.stop_grace_secs).await {
                warn!(task_id = %task_id, error = %e, "container stop failed during shutdown");
            }
        }
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<TaskId> = self.running.lock().await.keys().cloned().collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "shutting down running tasks");
        }
        for id in ids {
            self.shutdown_task(&id).await;
        }
    }
}
