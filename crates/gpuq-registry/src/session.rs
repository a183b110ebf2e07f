use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gpuq_domain::{
    CapabilityClass, ContainerId, DeviceId, ModelId, Session, SessionId, SessionSnapshot,
    SessionState, Task, TaskId,
};
use gpuq_engine::ContainerEngine;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::device::DeviceRegistry;

#[derive(Debug, Clone)]
pub struct SessionRegistryConfig {
    pub queue_capacity: usize,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub sweep_interval_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for SessionRegistryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            idle_timeout_secs: 300,
            max_lifetime_secs: 3600,
            sweep_interval_secs: 30,
            stop_grace_secs: 10,
        }
    }
}

struct SessionEntry {
    session: Session,
    queue_tx: mpsc::Sender<Task>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    /// Signalled when the session's current task reaches a terminal event,
    /// so the dispatcher can hand the worker its next queue entry.
    task_done: Arc<Notify>,
}

impl SessionEntry {
    fn queue_size(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    fn queue_full(&self) -> bool {
        self.queue_tx.capacity() == 0
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot { session: self.session.clone(), queue_size: self.queue_size() }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<SessionId, SessionEntry>,
    /// Insertion order, for the deterministic reuse scan.
    order: Vec<SessionId>,
}

/// Owns the set of live sessions and their bounded FIFO request queues.
///
/// The map is guarded by one mutex, never held across an engine or device
/// call: `kill` removes the entry under the lock, then tears down the
/// container and releases the device lock-free.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    engine: Arc<dyn ContainerEngine>,
    devices: Arc<DeviceRegistry>,
    config: SessionRegistryConfig,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        devices: Arc<DeviceRegistry>,
        config: SessionRegistryConfig,
    ) -> Self {
        Self { inner: Mutex::new(Inner::default()), engine, devices, config }
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }

    pub async fn create(
        &self,
        id: SessionId,
        container_id: ContainerId,
        device_id: DeviceId,
        model_id: ModelId,
        class: CapabilityClass,
    ) -> Session {
        let session = Session::create(
            id,
            container_id,
            device_id,
            model_id.clone(),
            class,
            self.config.idle_timeout_secs,
            self.config.max_lifetime_secs,
        );
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);

        let mut inner = self.inner.lock().await;
        inner.order.push(session.id.clone());
        inner.entries.insert(
            session.id.clone(),
            SessionEntry {
                session: session.clone(),
                queue_tx,
                queue_rx: Arc::new(Mutex::new(queue_rx)),
                task_done: Arc::new(Notify::new()),
            },
        );

        info!(
            session_id = %session.id,
            device_id = %device_id,
            model_id = %model_id,
            "created session"
        );
        session
    }

    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        self.inner.lock().await.entries.get(id).map(|e| e.session.clone())
    }

    /// First `waiting` session with the model whose queue has room, in
    /// insertion order.
    pub async fn find_idle_with_model(&self, model_id: &ModelId) -> Option<Session> {
        let inner = self.inner.lock().await;
        for id in &inner.order {
            if let Some(entry) = inner.entries.get(id) {
                if entry.session.state == SessionState::Waiting
                    && entry.session.model_id == *model_id
                    && !entry.queue_full()
                {
                    info!(session_id = %id, model_id = %model_id, "found idle session for reuse");
                    return Some(entry.session.clone());
                }
            }
        }
        None
    }

    /// FIFO enqueue. False when the session is unknown or the queue is full;
    /// there is no spill buffer.
    pub async fn enqueue(&self, id: &SessionId, task: Task) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(id) else {
            warn!(session_id = %id, "enqueue to unknown session");
            return false;
        };

        match entry.queue_tx.try_send(task) {
            Ok(()) => {
                entry.session.mark_activity();
                debug!(session_id = %id, queue_size = entry.queue_size(), "task enqueued");
                true
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(session_id = %id, task_id = %task.id, "session queue is full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(session_id = %id, "enqueue to closed session queue");
                false
            }
        }
    }

    /// Next queue entry, or None on timeout / killed session.
    pub async fn dequeue(&self, id: &SessionId, timeout: Duration) -> Option<Task> {
        let rx = {
            let inner = self.inner.lock().await;
            inner.entries.get(id)?.queue_rx.clone()
        };
        match tokio::time::timeout(timeout, async { rx.lock().await.recv().await }).await {
            Ok(Some(task)) => {
                debug!(session_id = %id, task_id = %task.id, "task dequeued");
                Some(task)
            }
            _ => None,
        }
    }

    pub async fn mark_activity(&self, id: &SessionId) {
        if let Some(entry) = self.inner.lock().await.entries.get_mut(id) {
            entry.session.mark_activity();
        }
    }

    /// State transition. `Killed` is terminal: once there, transitions are
    /// ignored (the entry is about to disappear anyway).
    pub async fn set_state(&self, id: &SessionId, state: SessionState) {
        if let Some(entry) = self.inner.lock().await.entries.get_mut(id) {
            if entry.session.state == SessionState::Killed {
                warn!(session_id = %id, "ignoring transition out of killed");
                return;
            }
            let old = entry.session.state;
            entry.session.state = state;
            info!(session_id = %id, from = %old, to = %state, "session state");
        }
    }

    /// Dequeue-side transition: the worker starts on `task_id`.
    pub async fn begin_task(&self, id: &SessionId, task_id: &TaskId) {
        if let Some(entry) = self.inner.lock().await.entries.get_mut(id) {
            entry.session.state = SessionState::Working;
            entry.session.current_task_id = Some(task_id.clone());
            entry.session.mark_activity();
            info!(session_id = %id, task_id = %task_id, "session working");
        }
    }

    /// Completion-side transition: back to waiting, wake the dispatcher.
    pub async fn finish_task(&self, id: &SessionId) {
        if let Some(entry) = self.inner.lock().await.entries.get_mut(id) {
            if entry.session.state != SessionState::Killed {
                entry.session.state = SessionState::Waiting;
            }
            entry.session.current_task_id = None;
            entry.session.mark_activity();
            entry.task_done.notify_one();
        }
    }

    /// Handle the dispatcher waits on between deliveries.
    pub async fn completion_handle(&self, id: &SessionId) -> Option<Arc<Notify>> {
        self.inner.lock().await.entries.get(id).map(|e| e.task_done.clone())
    }

    /// Kill and fully reclaim a session: mark killed, tear down the container
    /// (best effort — the engine swallows missing ids), release the device,
    /// drop the registry entry. Queued tasks are dropped with it; the
    /// pipelines watching them surface `task_finish{cancelled}`.
    pub async fn kill(&self, id: &SessionId, reason: &str) {
        let entry = {
            let mut inner = self.inner.lock().await;
            inner.order.retain(|sid| sid != id);
            inner.entries.remove(id)
        };

        let Some(mut entry) = entry else {
            warn!(session_id = %id, "kill of unknown session");
            return;
        };

        entry.session.state = SessionState::Killed;
        info!(session_id = %id, reason, "killing session");

        if let Err(e) = self
            .engine
            .stop(&entry.session.container_id, self.config.stop_grace_secs)
            .await
        {
            warn!(session_id = %id, error = %e, "session container stop failed");
        }
        if let Err(e) = self.engine.remove(&entry.session.container_id, true).await {
            warn!(session_id = %id, error = %e, "session container remove failed");
        }

        self.devices.release(entry.session.device_id).await;
        // Wake a dispatcher blocked on task completion so it can observe the kill.
        entry.task_done.notify_waiters();

        info!(session_id = %id, "session killed and resources released");
    }

    pub async fn all(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).map(SessionEntry::snapshot))
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Kill everything, e.g. at shutdown.
    pub async fn kill_all(&self, reason: &str) {
        let ids: Vec<SessionId> = self.inner.lock().await.order.clone();
        for id in ids {
            self.kill(&id, reason).await;
        }
    }

    /// One sweep pass at the given instant. Lifetime wins over idleness; the
    /// target list is copied out before any kill so the device registry is
    /// never touched under the session lock.
    pub async fn sweep_at(&self, now: DateTime<Utc>) {
        let targets: Vec<(SessionId, &'static str)> = {
            let inner = self.inner.lock().await;
            inner
                .order
                .iter()
                .filter_map(|id| {
                    let entry = inner.entries.get(id)?;
                    if entry.session.lifetime_exceeded(now) {
                        Some((id.clone(), "max_lifetime"))
                    } else if entry.session.idle_exceeded(now) {
                        Some((id.clone(), "idle_timeout"))
                    } else {
                        None
                    }
                })
                .collect()
        };

        if !targets.is_empty() {
            info!(count = targets.len(), "sweeper expiring sessions");
        }
        for (id, reason) in targets {
            self.kill(&id, reason).await;
        }
    }
}

/// Background idle/max-lifetime enforcement. Runs until the task is dropped.
pub async fn run_sweeper(registry: Arc<SessionRegistry>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "starting session sweeper");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        registry.sweep_at(Utc::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuq_domain::{Device, TaskMode};
    use gpuq_engine::MockEngine;

    fn task() -> Task {
        Task::create(
            "chat",
            TaskMode::Session,
            CapabilityClass::Low,
            60,
            HashMap::new(),
            Some(ModelId::new("demo")),
            None,
        )
    }

    async fn registry_with(
        queue_capacity: usize,
    ) -> (Arc<SessionRegistry>, Arc<MockEngine>, Arc<DeviceRegistry>) {
        let engine = Arc::new(MockEngine::new());
        let devices = Arc::new(DeviceRegistry::new(vec![Device::new(
            DeviceId(0),
            "GPU 0",
            CapabilityClass::Low,
            8192,
        )]));
        let registry = Arc::new(SessionRegistry::new(
            engine.clone(),
            devices.clone(),
            SessionRegistryConfig { queue_capacity, ..Default::default() },
        ));
        (registry, engine, devices)
    }

    #[tokio::test]
    async fn enqueue_succeeds_below_capacity_and_fails_at_it() {
        let (registry, _, _) = registry_with(5).await;
        let session = registry
            .create(SessionId::generate(), ContainerId::new("c1"), DeviceId(0), ModelId::new("demo"), CapabilityClass::Low)
            .await;

        for _ in 0..5 {
            assert!(registry.enqueue(&session.id, task()).await);
        }
        assert!(!registry.enqueue(&session.id, task()).await);

        let snap = &registry.all().await[0];
        assert_eq!(snap.queue_size, 5);
    }

    #[tokio::test]
    async fn dequeue_preserves_fifo_order() {
        let (registry, _, _) = registry_with(5).await;
        let session = registry
            .create(SessionId::generate(), ContainerId::new("c1"), DeviceId(0), ModelId::new("demo"), CapabilityClass::Low)
            .await;

        let (a, b) = (task(), task());
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        registry.enqueue(&session.id, a).await;
        registry.enqueue(&session.id, b).await;

        let first = registry.dequeue(&session.id, Duration::from_millis(50)).await.unwrap();
        let second = registry.dequeue(&session.id, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.id, a_id);
        assert_eq!(second.id, b_id);
        assert!(registry.dequeue(&session.id, Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn reuse_lookup_wants_waiting_state_and_matching_model() {
        let (registry, _, _) = registry_with(5).await;
        let s1 = registry
            .create(SessionId::generate(), ContainerId::new("c1"), DeviceId(0), ModelId::new("demo"), CapabilityClass::Low)
            .await;

        // Initializing sessions are not reusable.
        assert!(registry.find_idle_with_model(&ModelId::new("demo")).await.is_none());

        registry.set_state(&s1.id, SessionState::Waiting).await;
        let found = registry.find_idle_with_model(&ModelId::new("demo")).await.unwrap();
        assert_eq!(found.id, s1.id);

        assert!(registry.find_idle_with_model(&ModelId::new("other")).await.is_none());
    }

    #[tokio::test]
    async fn reuse_lookup_skips_full_queues() {
        let (registry, _, _) = registry_with(1).await;
        let s1 = registry
            .create(SessionId::generate(), ContainerId::new("c1"), DeviceId(0), ModelId::new("demo"), CapabilityClass::Low)
            .await;
        registry.set_state(&s1.id, SessionState::Waiting).await;
        registry.enqueue(&s1.id, task()).await;

        assert!(registry.find_idle_with_model(&ModelId::new("demo")).await.is_none());
    }

    #[tokio::test]
    async fn working_and_waiting_track_current_task() {
        let (registry, _, _) = registry_with(5).await;
        let s = registry
            .create(SessionId::generate(), ContainerId::new("c1"), DeviceId(0), ModelId::new("demo"), CapabilityClass::Low)
            .await;
        let t = task();

        registry.begin_task(&s.id, &t.id).await;
        let got = registry.get(&s.id).await.unwrap();
        assert_eq!(got.state, SessionState::Working);
        assert_eq!(got.current_task_id, Some(t.id.clone()));

        registry.finish_task(&s.id).await;
        let got = registry.get(&s.id).await.unwrap();
        assert_eq!(got.state, SessionState::Waiting);
        assert_eq!(got.current_task_id, None);
    }

    #[tokio::test]
    async fn kill_releases_device_and_removes_container() {
        let (registry, engine, devices) = registry_with(5).await;
        let device_id = devices.allocate(CapabilityClass::Low, "s").await.unwrap();
        let session = registry
            .create(SessionId::generate(), ContainerId::new("c1"), device_id, ModelId::new("demo"), CapabilityClass::Low)
            .await;

        registry.kill(&session.id, "manual").await;

        assert!(registry.get(&session.id).await.is_none());
        assert_eq!(devices.available_count().await, 1);
        // Unknown container id: the engine swallowed stop/remove, no panic.
        assert!(!engine.was_removed(&ContainerId::new("c1")).await);

        // Killing twice is a warning, not an error.
        registry.kill(&session.id, "manual").await;
    }

    #[tokio::test]
    async fn kill_stops_and_removes_a_live_container() {
        let (registry, engine, devices) = registry_with(5).await;
        engine.script_image_hanging("img", vec![]).await;
        let container = engine
            .create_session(&gpuq_engine::SessionSpec {
                session_id: SessionId::new("s1"),
                device_id: DeviceId(0),
                model_id: ModelId::new("demo"),
                image: "img".to_string(),
                command: vec![],
                env: HashMap::new(),
                model_host_path: "/tmp/demo".into(),
            })
            .await
            .unwrap();
        let device_id = devices.allocate(CapabilityClass::Low, "s").await.unwrap();
        let session = registry
            .create(SessionId::generate(), container.clone(), device_id, ModelId::new("demo"), CapabilityClass::Low)
            .await;

        registry.kill(&session.id, "idle_timeout").await;

        assert!(engine.was_stopped(&container).await);
        assert!(engine.was_removed(&container).await);
        assert_eq!(devices.available_count().await, 1);
    }

    #[tokio::test]
    async fn sweeper_kills_idle_and_max_lifetime_sessions() {
        let (registry, _, devices) = registry_with(5).await;
        let device_id = devices.allocate(CapabilityClass::Low, "s").await.unwrap();
        let session = registry
            .create(SessionId::generate(), ContainerId::new("c1"), device_id, ModelId::new("demo"), CapabilityClass::Low)
            .await;
        registry.set_state(&session.id, SessionState::Waiting).await;

        // Not yet expired.
        registry.sweep_at(session.created_at + chrono::Duration::seconds(10)).await;
        assert_eq!(registry.count().await, 1);

        // Past the idle timeout (default 300 s).
        registry.sweep_at(session.created_at + chrono::Duration::seconds(301)).await;
        assert_eq!(registry.count().await, 0);
        assert_eq!(devices.available_count().await, 1);
    }

    #[tokio::test]
    async fn sweeper_prefers_max_lifetime_reason() {
        let (registry, _, _) = registry_with(5).await;
        let session = registry
            .create(SessionId::generate(), ContainerId::new("c1"), DeviceId(0), ModelId::new("demo"), CapabilityClass::Low)
            .await;
        // Working sessions are immune to idleness but not to max lifetime.
        let t = task();
        registry.begin_task(&session.id, &t.id).await;

        registry.sweep_at(session.created_at + chrono::Duration::seconds(3601)).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn killed_session_drops_queued_tasks() {
        let (registry, _, _) = registry_with(5).await;
        let session = registry
            .create(SessionId::generate(), ContainerId::new("c1"), DeviceId(0), ModelId::new("demo"), CapabilityClass::Low)
            .await;
        registry.enqueue(&session.id, task()).await;
        registry.kill(&session.id, "manual").await;

        assert!(registry.dequeue(&session.id, Duration::from_millis(10)).await.is_none());
        assert!(!registry.enqueue(&session.id, task()).await);
    }
}
