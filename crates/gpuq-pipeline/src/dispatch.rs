use std::time::Duration;

use gpuq_domain::{SessionId, SessionState, Task};
use serde_json::json;
use tracing::{debug, warn};

use crate::services::Services;

/// How often the dispatcher re-checks the queue and the session's liveness.
const POLL: Duration = Duration::from_secs(1);

/// Path inside the session container where task payloads are delivered.
/// The payload shape and this path are a worker contract; the core only
/// guarantees that each dequeued task is delivered exactly once.
const TASK_INPUT_PATH: &str = "/tmp/task_input.json";

/// Spawn the per-session dispatcher: dequeues tasks in FIFO order, hands each
/// one to the worker via `exec`, and waits for the task's terminal event
/// before the next dequeue. Exits when the session disappears from the
/// registry (kill, sweeper, shutdown).
pub fn spawn_dispatcher(services: Services, session_id: SessionId) {
    tokio::spawn(run_dispatcher(services, session_id));
}

pub async fn run_dispatcher(services: Services, session_id: SessionId) {
    debug!(session_id = %session_id, "dispatcher started");

    loop {
        let Some(session) = services.sessions.get(&session_id).await else {
            break;
        };

        if session.state == SessionState::Working {
            // Wait for the in-flight task to finish; the poll timeout covers
            // a completion signal racing past between the lookup and here.
            if let Some(done) = services.sessions.completion_handle(&session_id).await {
                let _ = tokio::time::timeout(POLL, done.notified()).await;
            }
            continue;
        }

        let Some(task) = services.sessions.dequeue(&session_id, POLL).await else {
            continue;
        };

        services.sessions.begin_task(&session_id, &task.id).await;
        deliver(&services, &session_id, &task).await;
        await_completion(&services, &session_id, &task).await;
    }

    debug!(session_id = %session_id, "dispatcher exited");
}

/// Wait for the delivered task's terminal event. If no watcher ever reports
/// completion (its client vanished before the worker started), force the
/// session back to waiting after the task's own timeout budget so the queue
/// keeps draining.
async fn await_completion(services: &Services, session_id: &SessionId, task: &Task) {
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(task.timeout_seconds) + 2 * POLL;

    loop {
        let Some(session) = services.sessions.get(session_id).await else {
            return;
        };
        if session.current_task_id.as_ref() != Some(&task.id) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            warn!(
                session_id = %session_id,
                task_id = %task.id,
                "no completion observed within the task budget, releasing the session"
            );
            services.sessions.finish_task(session_id).await;
            return;
        }
        if let Some(done) = services.sessions.completion_handle(session_id).await {
            let _ = tokio::time::timeout(POLL, done.notified()).await;
        }
    }
}

async fn deliver(services: &Services, session_id: &SessionId, task: &Task) {
    let Some(session) = services.sessions.get(session_id).await else {
        return;
    };

    let payload = json!({
        "task_id": task.id,
        "task_name": task.name,
        "model_id": task.model_id,
        "metadata": task.metadata,
    });
    let command = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo '{}' > {}", payload, TASK_INPUT_PATH),
    ];

    match services.engine.exec(&session.container_id, &command).await {
        Ok(_) => debug!(
            session_id = %session_id,
            task_id = %task.id,
            "task delivered to worker"
        ),
        // Missing container: the session is on its way out; the watching
        // pipeline will surface the cancellation.
        Err(e) => warn!(
            session_id = %session_id,
            task_id = %task.id,
            error = %e,
            "task delivery failed"
        ),
    }
}
