use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gpuq_config::{Overrides, Settings, TemplateCatalog};
use gpuq_domain::{
    CapabilityClass, ConnectionStatus, Device, DeviceId, FinishStatus, ModelId, SessionId,
    SessionState, StreamEvent, WorkerPhase,
};
use gpuq_engine::MockEngine;
use gpuq_model::{ModelCache, ModelCacheConfig};
use gpuq_pipeline::{AdmissionError, Services, SubmitRequest, TaskPipeline};
use gpuq_registry::{DeviceRegistry, SessionRegistry, SessionRegistryConfig, TaskManager};
use tokio::sync::mpsc;

const LOADING_IMAGE: &str = "gpuq/loading-worker:latest";
const CHAT_IMAGE: &str = "gpuq/chat-worker:latest";

struct Harness {
    services: Services,
    engine: Arc<MockEngine>,
    _cache_dir: tempfile::TempDir,
}

/// Services bundle over the mock engine, the fixture catalog, and a cache dir
/// pre-seeded with every fixture model (no HTTP in these tests).
async fn harness(queue_capacity: usize, seed_models: bool) -> Harness {
    let engine = Arc::new(MockEngine::new());
    let devices = Arc::new(DeviceRegistry::new(vec![
        Device::new(DeviceId(0), "GPU 0", CapabilityClass::Low, 8192),
        Device::new(DeviceId(1), "GPU 1", CapabilityClass::High, 24576),
    ]));
    let sessions = Arc::new(SessionRegistry::new(
        engine.clone(),
        devices.clone(),
        SessionRegistryConfig { queue_capacity, ..Default::default() },
    ));
    let tasks = Arc::new(TaskManager::new(engine.clone(), 10));

    let cache_dir = tempfile::tempdir().unwrap();
    if seed_models {
        std::fs::write(cache_dir.path().join("demo"), b"demo-model").unwrap();
        std::fs::write(cache_dir.path().join("llama-3-8b"), b"chat-model").unwrap();
    }
    let models = Arc::new(ModelCache::new(ModelCacheConfig {
        cache_dir: cache_dir.path().to_path_buf(),
        auto_fetch: false,
        file_service_url: "http://unused".to_string(),
        file_service_key: String::new(),
    }));
    models.scan().await.unwrap();

    let catalog = Arc::new(TemplateCatalog::new(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures"),
    ));

    let services = Services {
        devices,
        sessions,
        tasks,
        engine: engine.clone(),
        models,
        catalog,
        settings: Arc::new(Settings::default()),
    };
    Harness { services, engine, _cache_dir: cache_dir }
}

fn submit(task_name: &str) -> SubmitRequest {
    SubmitRequest {
        task_name: task_name.to_string(),
        overrides: Overrides::default(),
        session_id: None,
        create_session: false,
    }
}

fn worker_line(status: &str, message: &str) -> String {
    format!(r#"{{"event": "worker", "status": "{status}", "message": "{message}"}}"#)
}

fn loading_script() -> Vec<String> {
    vec![
        worker_line("initializing", "Initializing GPU..."),
        worker_line("loading", "Loading model demo into GPU memory..."),
        r#"{"event": "text_delta", "delta": "Loading progress: 20%\n"}"#.to_string(),
        r#"{"event": "text_delta", "delta": "Loading progress: 100%\n"}"#.to_string(),
        worker_line("ready", "Model loaded successfully"),
        r#"{"event": "text", "content": "Model demo computation complete!"}"#.to_string(),
        worker_line("cleaning_up", "Unloading model from GPU..."),
    ]
}

/// Run a prepared task and collect the full event stream.
async fn collect(
    prepared: gpuq_pipeline::PreparedTask,
) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(32);
    let handle = tokio::spawn(prepared.run(tx));
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    handle.await.unwrap();
    events
}

fn finish_count(events: &[StreamEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, StreamEvent::TaskFinish { .. }))
        .count()
}

#[tokio::test]
async fn s1_oneoff_happy_path() {
    let h = harness(5, true).await;
    h.engine.script_image(LOADING_IMAGE, loading_script()).await;

    let pipeline = TaskPipeline::new(h.services.clone());
    let prepared = pipeline.prepare(submit("loading-test")).await.unwrap();
    let task_id = prepared.task().id.clone();

    let events = collect(prepared).await;

    let tags: Vec<&str> = events.iter().map(|e| e.tag()).collect();
    assert_eq!(
        tags,
        vec![
            "connection",
            "worker", // created
            "worker", // initializing
            "worker", // loading
            "text_delta",
            "text_delta",
            "worker", // ready
            "text",
            "worker", // cleaning_up
            "task_finish",
        ]
    );

    assert_eq!(
        events[0],
        StreamEvent::connection(ConnectionStatus::Allocated, Some(0), None)
    );
    assert!(matches!(
        &events[1],
        StreamEvent::Worker { status: WorkerPhase::Created, container_id: Some(_), .. }
    ));
    match events.last().unwrap() {
        StreamEvent::TaskFinish { status, elapsed_seconds, .. } => {
            assert_eq!(*status, FinishStatus::Completed);
            assert!(elapsed_seconds.is_some());
        }
        other => panic!("expected task_finish, got {other:?}"),
    }
    assert_eq!(finish_count(&events), 1);

    // Device 0 is free again, no container carries the task label, nothing is
    // left in the running-task map.
    assert_eq!(h.services.devices.available_count().await, 2);
    assert!(h.engine.labeled("gpuq.task_id", task_id.as_str()).await.is_empty());
    assert_eq!(h.services.tasks.count().await, 0);
}

#[tokio::test]
async fn unknown_template_is_admission_failure() {
    let h = harness(5, true).await;
    let pipeline = TaskPipeline::new(h.services.clone());
    let err = pipeline.prepare(submit("no-such-task")).await.unwrap_err();
    assert!(matches!(err, AdmissionError::UnknownTemplate(_)));
    assert_eq!(h.services.devices.available_count().await, 2);
}

#[tokio::test]
async fn s2_no_matching_device_is_admission_failure() {
    let h = harness(5, true).await;
    // Occupy the only high-class device.
    h.services.devices.allocate(CapabilityClass::High, "elsewhere").await.unwrap();

    let pipeline = TaskPipeline::new(h.services.clone());
    let mut req = submit("loading-test");
    req.overrides.class = Some(CapabilityClass::High);

    let err = pipeline.prepare(req).await.unwrap_err();
    assert!(matches!(err, AdmissionError::NoDevice(CapabilityClass::High)));

    // No device state changed: low still free, high still held.
    let snap = h.services.devices.snapshot().await;
    assert!(snap[0].available);
    assert!(!snap[1].available);
}

#[tokio::test]
async fn missing_model_is_admission_failure() {
    let h = harness(5, false).await; // nothing staged, auto-fetch off
    let pipeline = TaskPipeline::new(h.services.clone());
    let err = pipeline.prepare(submit("loading-test")).await.unwrap_err();
    assert!(matches!(err, AdmissionError::ModelUnavailable(_)));
    assert_eq!(h.services.devices.available_count().await, 2);
}

#[tokio::test]
async fn container_create_failure_emits_failed_and_releases_device() {
    let h = harness(5, true).await;
    h.engine.fail_next_create().await;

    let pipeline = TaskPipeline::new(h.services.clone());
    let prepared = pipeline.prepare(submit("loading-test")).await.unwrap();
    let events = collect(prepared).await;

    assert_eq!(events[0].tag(), "connection");
    match events.last().unwrap() {
        StreamEvent::TaskFinish { status, error, .. } => {
            assert_eq!(*status, FinishStatus::Failed);
            assert!(error.as_deref().unwrap().contains("container creation failed"));
        }
        other => panic!("expected task_finish, got {other:?}"),
    }
    assert_eq!(finish_count(&events), 1);
    assert_eq!(h.services.devices.available_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_stops_container_and_emits_timeout_finish() {
    let h = harness(5, true).await;
    // Worker that produces nothing and never exits.
    h.engine.script_image_hanging(LOADING_IMAGE, vec![]).await;

    let pipeline = TaskPipeline::new(h.services.clone());
    let mut req = submit("loading-test");
    req.overrides.timeout_seconds = Some(10);
    let prepared = pipeline.prepare(req).await.unwrap();

    let events = collect(prepared).await;

    let container_id = match &events[1] {
        StreamEvent::Worker { container_id: Some(id), .. } => {
            gpuq_domain::ContainerId::new(id.clone())
        }
        other => panic!("expected worker created, got {other:?}"),
    };

    match events.last().unwrap() {
        StreamEvent::TaskFinish { status, elapsed_seconds, error } => {
            assert_eq!(*status, FinishStatus::Timeout);
            assert!(elapsed_seconds.unwrap() >= 11);
            assert_eq!(error.as_deref(), Some("Task timeout exceeded"));
        }
        other => panic!("expected task_finish, got {other:?}"),
    }
    assert_eq!(finish_count(&events), 1);
    assert!(h.engine.was_stopped(&container_id).await);
    assert_eq!(h.services.devices.available_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn s6_client_disconnect_runs_the_finally_path() {
    let h = harness(5, true).await;
    h.engine.script_image_hanging(LOADING_IMAGE, vec![]).await;

    let pipeline = TaskPipeline::new(h.services.clone());
    let prepared = pipeline.prepare(submit("loading-test")).await.unwrap();
    let task_id = prepared.task().id.clone();

    let (tx, mut rx) = mpsc::channel(32);
    let handle = tokio::spawn(prepared.run(tx));

    // connection + worker created, then the client goes away.
    let first = rx.recv().await.unwrap();
    assert_eq!(first.tag(), "connection");
    let second = rx.recv().await.unwrap();
    let container_id = match &second {
        StreamEvent::Worker { container_id: Some(id), .. } => {
            gpuq_domain::ContainerId::new(id.clone())
        }
        other => panic!("expected worker created, got {other:?}"),
    };
    drop(rx);

    handle.await.unwrap();

    assert!(h.engine.was_stopped(&container_id).await);
    assert_eq!(h.services.devices.available_count().await, 2);
    assert_eq!(h.services.tasks.count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn s3_session_is_created_then_reused() {
    let h = harness(5, true).await;
    h.engine
        .script_image_hanging(CHAT_IMAGE, vec![worker_line("initializing", "warming up")])
        .await;

    let pipeline = TaskPipeline::new(h.services.clone());

    // First submission: creates the session.
    let prepared = pipeline.prepare(submit("chat")).await.unwrap();
    let (tx, mut rx) = mpsc::channel(32);
    let run1 = tokio::spawn(prepared.run(tx));

    assert_eq!(rx.recv().await.unwrap().tag(), "connection"); // allocated

    // Wait for the dispatcher to deliver the task to the worker.
    while h.engine.exec_calls().await.is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let session_container = h.engine.exec_calls().await[0].0.clone();

    // Worker reports the task done.
    h.engine
        .push_log(
            &session_container,
            r#"{"type": "task_finish", "data": {"status": "completed", "elapsed_seconds": 3}}"#,
        )
        .await;

    let mut events1 = Vec::new();
    while let Some(ev) = rx.recv().await {
        events1.push(ev);
    }
    run1.await.unwrap();

    assert_eq!(finish_count(&events1), 1);
    match events1.last().unwrap() {
        StreamEvent::TaskFinish { status, elapsed_seconds, .. } => {
            assert_eq!(*status, FinishStatus::Completed);
            assert_eq!(*elapsed_seconds, Some(3));
        }
        other => panic!("expected task_finish, got {other:?}"),
    }

    // One session exists, back to waiting with an empty queue.
    let sessions = h.services.sessions.all().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session.state, SessionState::Waiting);
    assert_eq!(sessions[0].queue_size, 0);
    let session_id = sessions[0].session.id.clone();

    // Second submission with the same model and no session id reuses it.
    let prepared = pipeline.prepare(submit("chat")).await.unwrap();
    let (tx, mut rx) = mpsc::channel(32);
    let run2 = tokio::spawn(prepared.run(tx));

    match rx.recv().await.unwrap() {
        StreamEvent::Connection { status, session_id: sid, .. } => {
            assert_eq!(status, ConnectionStatus::SessionReady);
            assert_eq!(sid.as_deref(), Some(session_id.as_str()));
        }
        other => panic!("expected connection, got {other:?}"),
    }

    while h.engine.exec_calls().await.len() < 2 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    h.engine
        .push_log(
            &session_container,
            r#"{"type": "task_finish", "data": {"status": "completed", "elapsed_seconds": 1}}"#,
        )
        .await;

    let mut events2 = Vec::new();
    while let Some(ev) = rx.recv().await {
        events2.push(ev);
    }
    run2.await.unwrap();

    assert_eq!(finish_count(&events2), 1);
    // Still exactly one session, queue drained, no second device taken.
    assert_eq!(h.services.sessions.count().await, 1);
    assert_eq!(h.services.sessions.all().await[0].queue_size, 0);
    assert_eq!(h.services.devices.available_count().await, 1);
}

#[tokio::test]
async fn s4_enqueue_to_explicit_session_fails_when_full() {
    let h = harness(2, true).await;
    let pipeline = TaskPipeline::new(h.services.clone());

    // An existing idle chat session.
    let session = h
        .services
        .sessions
        .create(
            SessionId::generate(),
            gpuq_domain::ContainerId::new("c-session"),
            DeviceId(1),
            ModelId::new("llama-3-8b"),
            CapabilityClass::High,
        )
        .await;
    h.services.sessions.set_state(&session.id, SessionState::Waiting).await;

    let with_session = || {
        let mut req = submit("chat");
        req.session_id = Some(session.id.clone());
        req
    };

    // Capacity 2: two admissions fill the queue, the third bounces.
    pipeline.prepare(with_session()).await.unwrap();
    pipeline.prepare(with_session()).await.unwrap();
    let err = pipeline.prepare(with_session()).await.unwrap_err();
    assert!(matches!(err, AdmissionError::QueueFull(_)));

    // The failed admission didn't disturb the queue.
    assert_eq!(h.services.sessions.all().await[0].queue_size, 2);
}

#[tokio::test]
async fn explicit_session_with_wrong_model_is_rejected() {
    let h = harness(5, true).await;
    let pipeline = TaskPipeline::new(h.services.clone());

    let session = h
        .services
        .sessions
        .create(
            SessionId::generate(),
            gpuq_domain::ContainerId::new("c-session"),
            DeviceId(0),
            ModelId::new("demo"),
            CapabilityClass::Low,
        )
        .await;
    h.services.sessions.set_state(&session.id, SessionState::Waiting).await;

    // "chat" requires llama-3-8b, the session runs demo.
    let mut req = submit("chat");
    req.session_id = Some(session.id.clone());
    let err = pipeline.prepare(req).await.unwrap_err();
    assert!(matches!(err, AdmissionError::ModelMismatch { .. }));
}

#[tokio::test]
async fn unknown_session_id_is_rejected() {
    let h = harness(5, true).await;
    let pipeline = TaskPipeline::new(h.services.clone());

    let mut req = submit("chat");
    req.session_id = Some(SessionId::new("ghost"));
    let err = pipeline.prepare(req).await.unwrap_err();
    assert!(matches!(err, AdmissionError::UnknownSession(_)));
}

#[tokio::test]
async fn metadata_overrides_reach_the_container_env() {
    let h = harness(5, true).await;
    h.engine.script_image(LOADING_IMAGE, vec![]).await;

    let pipeline = TaskPipeline::new(h.services.clone());
    let mut req = submit("loading-test");
    req.overrides.metadata =
        HashMap::from([("run_label".to_string(), serde_json::json!("smoke-7"))]);
    let prepared = pipeline.prepare(req).await.unwrap();
    let task_id = prepared.task().id.to_string();

    let _ = collect(prepared).await;

    assert!(h.engine.labeled("gpuq.task_id", &task_id).await.is_empty()); // auto-removed

    // The mock retains the record after auto-remove; check what the worker saw.
    let container = h.engine.last_created().await.unwrap();
    let env = h.engine.env_of(&container).await.unwrap();
    assert_eq!(env.get("METADATA_RUN_LABEL").map(String::as_str), Some("smoke-7"));
    assert_eq!(env.get("METADATA_WARMUP").map(String::as_str), Some("true")); // fixture default
    assert_eq!(env.get("MODEL_PATH").map(String::as_str), Some("/models"));
    assert_eq!(env.get("TASK_ID").map(String::as_str), Some(task_id.as_str()));
}
