use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use gpuq_config::{parse_device_classes, Settings};
use gpuq_domain::DeviceId;

/// gpuq — multi-tenant GPU task execution service.
///
/// Every flag can also be set through its GPUQ_* environment variable.
#[derive(Debug, Parser)]
#[command(name = "gpuqd", version, about)]
pub struct Args {
    #[arg(long, env = "GPUQ_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "GPUQ_PORT", default_value_t = 8001)]
    pub port: u16,

    /// Shared-secret key required on task and session routes.
    #[arg(long, env = "GPUQ_API_KEY")]
    pub api_key: String,

    /// Comma-separated device ids managed by this instance, in allocation order.
    #[arg(long, env = "GPUQ_DEVICE_IDS", default_value = "0")]
    pub device_ids: String,

    /// Device capability classes, e.g. "0:low,1:high". Unmapped ids are low.
    #[arg(long, env = "GPUQ_DEVICE_CLASSES", default_value = "0:low")]
    pub device_classes: String,

    #[arg(long, env = "GPUQ_TELEMETRY_INTERVAL_SECS", default_value_t = 5)]
    pub telemetry_interval_secs: u64,

    #[arg(long, env = "GPUQ_SESSION_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub session_idle_timeout_secs: u64,

    #[arg(long, env = "GPUQ_SESSION_MAX_LIFETIME_SECS", default_value_t = 3600)]
    pub session_max_lifetime_secs: u64,

    #[arg(long, env = "GPUQ_SESSION_QUEUE_SIZE", default_value_t = 5)]
    pub session_queue_size: usize,

    #[arg(long, env = "GPUQ_SESSION_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub session_sweep_interval_secs: u64,

    #[arg(long, env = "GPUQ_DEFAULT_TASK_TIMEOUT_SECS", default_value_t = 300)]
    pub default_task_timeout_secs: u64,

    #[arg(long, env = "GPUQ_MIN_TASK_TIMEOUT_SECS", default_value_t = 10)]
    pub min_task_timeout_secs: u64,

    #[arg(long, env = "GPUQ_MAX_TASK_TIMEOUT_SECS", default_value_t = 1800)]
    pub max_task_timeout_secs: u64,

    /// Memory cap per task container, in bytes.
    #[arg(long, env = "GPUQ_CONTAINER_MEMORY_BYTES", default_value_t = 16 * 1024 * 1024 * 1024)]
    pub container_memory_bytes: i64,

    #[arg(long, env = "GPUQ_CONTAINER_CPU_QUOTA", default_value_t = 100_000)]
    pub container_cpu_quota: i64,

    #[arg(long, env = "GPUQ_CONTAINER_STOP_GRACE_SECS", default_value_t = 10)]
    pub container_stop_grace_secs: u64,

    /// Container engine HTTP endpoint.
    #[arg(long, env = "GPUQ_ENGINE_URL", default_value = "http://localhost:2375")]
    pub engine_url: String,

    /// Use the in-memory mock engine instead of a real container engine.
    #[arg(long, env = "GPUQ_MOCK_ENGINE", default_value_t = false)]
    pub mock_engine: bool,

    /// Model staging directory; the only state that survives restarts.
    #[arg(long, env = "GPUQ_MODEL_CACHE_DIR", default_value = "/var/lib/gpuq/models")]
    pub model_cache_dir: PathBuf,

    #[arg(long, env = "GPUQ_AUTO_FETCH_MODELS", default_value_t = true)]
    pub auto_fetch_models: bool,

    #[arg(long, env = "GPUQ_FILE_SERVICE_URL", default_value = "http://localhost:8000")]
    pub file_service_url: String,

    #[arg(long, env = "GPUQ_FILE_SERVICE_KEY", default_value = "")]
    pub file_service_key: String,

    /// Task template directory (task_definitions.yml, task_actions.yml,
    /// model_paths.yml).
    #[arg(long, env = "GPUQ_TEMPLATE_DIR", default_value = "/etc/gpuq/templates")]
    pub template_dir: PathBuf,

    /// Comma-separated CORS origins; empty disables cross-origin access.
    #[arg(long, env = "GPUQ_CORS_ORIGINS", default_value = "")]
    pub cors_origins: String,
}

impl Args {
    pub fn to_settings(&self) -> Result<Settings> {
        let device_ids = self
            .device_ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u32>()
                    .map(DeviceId)
                    .with_context(|| format!("invalid device id '{s}' in GPUQ_DEVICE_IDS"))
            })
            .collect::<Result<Vec<_>>>()?;

        let device_classes =
            parse_device_classes(&self.device_classes).context("invalid GPUQ_DEVICE_CLASSES")?;

        let cors_origins: Vec<String> = self
            .cors_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Settings {
            device_ids,
            device_classes,
            telemetry_interval_secs: self.telemetry_interval_secs,
            session_idle_timeout_secs: self.session_idle_timeout_secs,
            session_max_lifetime_secs: self.session_max_lifetime_secs,
            session_queue_size: self.session_queue_size,
            session_sweep_interval_secs: self.session_sweep_interval_secs,
            default_task_timeout_secs: self.default_task_timeout_secs,
            min_task_timeout_secs: self.min_task_timeout_secs,
            max_task_timeout_secs: self.max_task_timeout_secs,
            container_memory_bytes: self.container_memory_bytes,
            container_cpu_quota: self.container_cpu_quota,
            container_stop_grace_secs: self.container_stop_grace_secs,
            engine_url: self.engine_url.clone(),
            model_cache_dir: self.model_cache_dir.clone(),
            auto_fetch_models: self.auto_fetch_models,
            file_service_url: self.file_service_url.clone(),
            file_service_key: self.file_service_key.clone(),
            template_dir: self.template_dir.clone(),
            api_key: self.api_key.clone(),
            cors_origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuq_domain::CapabilityClass;

    fn base_args() -> Vec<&'static str> {
        vec!["gpuqd", "--api-key", "k"]
    }

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(base_args());
        let settings = args.to_settings().unwrap();
        assert_eq!(settings.device_ids, vec![DeviceId(0)]);
        assert_eq!(settings.session_queue_size, 5);
        assert_eq!(settings.max_task_timeout_secs, 1800);
    }

    #[test]
    fn device_lists_parse() {
        let mut argv = base_args();
        argv.extend(["--device-ids", "0, 1", "--device-classes", "0:low,1:high"]);
        let settings = Args::parse_from(argv).to_settings().unwrap();
        assert_eq!(settings.device_ids, vec![DeviceId(0), DeviceId(1)]);
        assert_eq!(settings.class_for(DeviceId(1)), CapabilityClass::High);
    }

    #[test]
    fn bad_device_id_is_an_error() {
        let mut argv = base_args();
        argv.extend(["--device-ids", "zero"]);
        assert!(Args::parse_from(argv).to_settings().is_err());
    }
}
