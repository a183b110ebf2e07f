mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gpuq_config::TemplateCatalog;
use gpuq_domain::Device;
use gpuq_engine::{ContainerEngine, ContainerLimits, DockerEngine, MockEngine};
use gpuq_model::{ModelCache, ModelCacheConfig};
use gpuq_pipeline::Services;
use gpuq_registry::{
    run_sweeper, run_telemetry, DeviceRegistry, MockProbe, SessionRegistry,
    SessionRegistryConfig, TaskManager, TelemetryProbe,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    let settings = Arc::new(args.to_settings()?);

    // Template catalog must be coherent before we accept a single task.
    let catalog = Arc::new(TemplateCatalog::new(settings.template_dir.clone()));
    catalog
        .validate()
        .with_context(|| format!("template catalog at {} is invalid", settings.template_dir.display()))?;
    info!(dir = %settings.template_dir.display(), "template catalog validated");

    let models = Arc::new(ModelCache::new(ModelCacheConfig {
        cache_dir: settings.model_cache_dir.clone(),
        auto_fetch: settings.auto_fetch_models,
        file_service_url: settings.file_service_url.clone(),
        file_service_key: settings.file_service_key.clone(),
    }));
    let cached = models
        .scan()
        .await
        .with_context(|| format!("cannot prepare model cache at {}", settings.model_cache_dir.display()))?;
    info!(cached, dir = %settings.model_cache_dir.display(), "model cache ready");

    let engine: Arc<dyn ContainerEngine> = if args.mock_engine {
        warn!("running with the in-memory mock engine; no real containers will start");
        Arc::new(MockEngine::new())
    } else {
        let engine = DockerEngine::new(
            settings.engine_url.clone(),
            ContainerLimits {
                memory_bytes: settings.container_memory_bytes,
                cpu_quota: settings.container_cpu_quota,
            },
        );
        engine
            .ping()
            .await
            .with_context(|| format!("container engine at {} is unreachable", settings.engine_url))?;
        info!(url = %settings.engine_url, "container engine connected");
        Arc::new(engine)
    };

    // Device pool: describe each configured device through the probe; if the
    // probe can't see any of them, fall back to a single mock device so the
    // rest of the system still runs end-to-end.
    let probe: Arc<dyn TelemetryProbe> = Arc::new(MockProbe);
    let mut pool: Vec<Device> = Vec::new();
    for &id in &settings.device_ids {
        match probe.describe(id).await {
            Ok(desc) => pool.push(Device::new(id, desc.name, settings.class_for(id), desc.memory_total_mb)),
            Err(e) => warn!(device_id = %id, error = %e, "device probe failed, skipping"),
        }
    }
    let devices = if pool.is_empty() {
        warn!("no devices visible to the probe; creating one mock device");
        Arc::new(DeviceRegistry::with_mock_device())
    } else {
        Arc::new(DeviceRegistry::new(pool))
    };
    for device in devices.snapshot().await {
        info!(
            device_id = %device.id,
            name = %device.name,
            class = %device.class,
            memory_mb = device.memory_total_mb,
            "device registered"
        );
    }

    let sessions = Arc::new(SessionRegistry::new(
        engine.clone(),
        devices.clone(),
        SessionRegistryConfig {
            queue_capacity: settings.session_queue_size,
            idle_timeout_secs: settings.session_idle_timeout_secs,
            max_lifetime_secs: settings.session_max_lifetime_secs,
            sweep_interval_secs: settings.session_sweep_interval_secs,
            stop_grace_secs: settings.container_stop_grace_secs,
        },
    ));
    let tasks = Arc::new(TaskManager::new(engine.clone(), settings.container_stop_grace_secs));

    let services = Services {
        devices: devices.clone(),
        sessions: sessions.clone(),
        tasks: tasks.clone(),
        engine,
        models,
        catalog,
        settings: settings.clone(),
    };

    let telemetry = tokio::spawn(run_telemetry(
        devices,
        probe,
        Duration::from_secs(settings.telemetry_interval_secs),
    ));
    let sweeper = tokio::spawn(run_sweeper(
        sessions.clone(),
        Duration::from_secs(settings.session_sweep_interval_secs),
    ));

    let app = gpuq_api::build_app(services, Arc::new(args.api_key.clone()));
    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(addr = %addr, "gpuq API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Shutdown: stop in-flight tasks, then kill every session so devices and
    // containers are reclaimed before exit.
    info!("shutting down");
    telemetry.abort();
    sweeper.abort();
    tasks.shutdown_all().await;
    sessions.kill_all("shutdown").await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
