use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use gpuq_config::{parse_capability_class, Overrides};
use gpuq_domain::SessionId;
use gpuq_pipeline::{SubmitRequest, TaskPipeline};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Events buffered between the pipeline and a slow client.
const STREAM_BUFFER: usize = 32;

// ── Root ──────────────────────────────────────────────────────────────────────

pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "gpuq",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

// ── Task submission ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PredefinedTaskBody {
    pub task_name: String,
    /// Capability class override: "low" or "high".
    pub task_difficulty: Option<String>,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub create_session: bool,
}

pub async fn submit_predefined(
    State(state): State<AppState>,
    Json(body): Json<PredefinedTaskBody>,
) -> Result<impl IntoResponse, ApiError> {
    let settings = &state.services.settings;

    let class = body
        .task_difficulty
        .as_deref()
        .map(parse_capability_class)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    if let Some(timeout) = body.timeout_seconds {
        if timeout < settings.min_task_timeout_secs || timeout > settings.max_task_timeout_secs {
            return Err(ApiError::bad_request(format!(
                "timeout_seconds must be within {}..={}",
                settings.min_task_timeout_secs, settings.max_task_timeout_secs
            )));
        }
    }

    info!(task = %body.task_name, session_id = ?body.session_id, "task submission");

    let request = SubmitRequest {
        task_name: body.task_name,
        overrides: Overrides {
            class,
            timeout_seconds: body.timeout_seconds,
            metadata: body.metadata,
        },
        session_id: body.session_id.map(SessionId::new),
        create_session: body.create_session,
    };

    // Admission failures surface as HTTP errors; from here on everything is
    // a stream event.
    let prepared = TaskPipeline::new(state.services.clone()).prepare(request).await?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(prepared.run(tx));

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<SseEvent, Infallible>(
            SseEvent::default()
                .event(event.tag())
                .data(event.payload().to_string()),
        )
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn submit_custom() -> ApiError {
    ApiError::not_implemented("custom tasks are not implemented; use a predefined task template")
}

// ── Sessions ──────────────────────────────────────────────────────────────────

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.services.sessions.all().await;
    Json(json!({
        "total": sessions.len(),
        "sessions": sessions,
    }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::new(&id);
    let sessions = state.services.sessions.all().await;
    let snapshot = sessions
        .into_iter()
        .find(|s| s.session.id == session_id)
        .ok_or_else(|| ApiError::not_found(format!("session {} not found", id)))?;
    Ok(Json(json!(snapshot)))
}

pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::new(&id);
    state
        .services
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("session {} not found", id)))?;

    state.services.sessions.kill(&session_id, "manual").await;
    Ok(Json(json!({
        "success": true,
        "session_id": id,
        "message": "Session killed successfully",
    })))
}

pub async fn keepalive_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::new(&id);
    state
        .services
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("session {} not found", id)))?;

    state.services.sessions.mark_activity(&session_id).await;
    let session = state
        .services
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("session {} not found", id)))?;

    Ok(Json(json!({
        "success": true,
        "session_id": id,
        "message": "Session keepalive updated",
        "last_activity": session.last_activity,
    })))
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let devices = state.services.devices.snapshot().await;
    let sessions = state.services.sessions.all().await;
    let running = state.services.tasks.count().await;

    let status = if devices.is_empty() {
        "unhealthy"
    } else if devices.iter().all(|d| !d.available) {
        "degraded"
    } else {
        "healthy"
    };

    let gpus: Vec<Value> = devices
        .iter()
        .map(|d| {
            json!({
                "device_id": d.id,
                "name": d.name,
                "class": d.class,
                "is_available": d.available,
                "memory_used_mb": d.memory_used_mb,
                "memory_total_mb": d.memory_total_mb,
                "temperature_c": d.temperature_c,
                "utilization_pct": d.utilization_pct,
                "current_holder": d.holder,
            })
        })
        .collect();

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "gpus": gpus,
        "active_sessions": sessions.len(),
        "running_tasks": running,
    }))
}

pub async fn health_resources(State(state): State<AppState>) -> Json<Value> {
    let devices = state.services.devices.snapshot().await;
    let sessions = state.services.sessions.all().await;
    let running = state.services.tasks.running().await;

    let gpu_allocation: Vec<Value> = devices
        .iter()
        .map(|d| {
            let memory_pct = if d.memory_total_mb > 0 {
                (d.memory_used_mb as f64 / d.memory_total_mb as f64 * 100.0 * 100.0).round() / 100.0
            } else {
                0.0
            };
            json!({
                "device_id": d.id,
                "name": d.name,
                "class": d.class,
                "is_available": d.available,
                "current_holder": d.holder,
                "memory": {
                    "used_mb": d.memory_used_mb,
                    "total_mb": d.memory_total_mb,
                    "utilization_pct": memory_pct,
                },
                "gpu_utilization_pct": d.utilization_pct,
                "temperature_c": d.temperature_c,
            })
        })
        .collect();

    let session_details: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "session_id": s.session.id,
                "state": s.session.state,
                "device_id": s.session.device_id,
                "model_id": s.session.model_id,
                "current_task_id": s.session.current_task_id,
                "created_at": s.session.created_at,
                "last_activity": s.session.last_activity,
                "queue_size": s.queue_size,
            })
        })
        .collect();

    let by_class = |class: gpuq_domain::CapabilityClass| {
        devices.iter().filter(|d| d.class == class).count()
    };

    Json(json!({
        "timestamp": chrono::Utc::now(),
        "resource_allocation": {
            "gpus": gpu_allocation,
            "running_tasks": {
                "count": running.len(),
                "task_ids": running.iter().map(|t| t.task_id.clone()).collect::<Vec<_>>(),
            },
            "sessions": {
                "count": sessions.len(),
                "working": sessions.iter().filter(|s| s.session.state == gpuq_domain::SessionState::Working).count(),
                "waiting": sessions.iter().filter(|s| s.session.state == gpuq_domain::SessionState::Waiting).count(),
                "details": session_details,
            },
        },
        "capacity": {
            "total_devices": devices.len(),
            "available_devices": devices.iter().filter(|d| d.available).count(),
            "devices_by_class": {
                "low": by_class(gpuq_domain::CapabilityClass::Low),
                "high": by_class(gpuq_domain::CapabilityClass::High),
            },
        },
    }))
}
