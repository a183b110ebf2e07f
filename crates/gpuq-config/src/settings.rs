use std::collections::HashMap;
use std::path::PathBuf;

use gpuq_domain::{CapabilityClass, DeviceId};

use crate::error::ConfigError;

/// Service-wide knobs, filled from the environment by the binary and handed
/// down to every subsystem as a plain value. Only `model_cache_dir` names
/// state that survives a restart.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Devices managed by this instance, in allocation-scan order.
    pub device_ids: Vec<DeviceId>,
    /// Capability class per device; absent ids default to `low`.
    pub device_classes: HashMap<DeviceId, CapabilityClass>,
    pub telemetry_interval_secs: u64,

    pub session_idle_timeout_secs: u64,
    pub session_max_lifetime_secs: u64,
    pub session_queue_size: usize,
    pub session_sweep_interval_secs: u64,

    pub default_task_timeout_secs: u64,
    pub min_task_timeout_secs: u64,
    pub max_task_timeout_secs: u64,

    pub container_memory_bytes: i64,
    pub container_cpu_quota: i64,
    pub container_stop_grace_secs: u64,

    /// Container engine HTTP endpoint.
    pub engine_url: String,

    pub model_cache_dir: PathBuf,
    pub auto_fetch_models: bool,
    pub file_service_url: String,
    pub file_service_key: String,

    pub template_dir: PathBuf,
    pub api_key: String,
    pub cors_origins: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_ids: vec![DeviceId(0)],
            device_classes: HashMap::from([(DeviceId(0), CapabilityClass::Low)]),
            telemetry_interval_secs: 5,
            session_idle_timeout_secs: 300,
            session_max_lifetime_secs: 3600,
            session_queue_size: 5,
            session_sweep_interval_secs: 30,
            default_task_timeout_secs: 300,
            min_task_timeout_secs: 10,
            max_task_timeout_secs: 1800,
            container_memory_bytes: 16 * 1024 * 1024 * 1024,
            container_cpu_quota: 100_000,
            container_stop_grace_secs: 10,
            engine_url: "http://localhost:2375".to_string(),
            model_cache_dir: PathBuf::from("/var/lib/gpuq/models"),
            auto_fetch_models: true,
            file_service_url: "http://localhost:8000".to_string(),
            file_service_key: String::new(),
            template_dir: PathBuf::from("/etc/gpuq/templates"),
            api_key: String::new(),
            cors_origins: Vec::new(),
        }
    }
}

/// Parse a `"0:low,1:high"` style device class map.
pub fn parse_device_classes(
    s: &str,
) -> Result<HashMap<DeviceId, CapabilityClass>, ConfigError> {
    let mut out = HashMap::new();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, class) = pair.split_once(':').ok_or_else(|| ConfigError::InvalidValue {
            key: "device_classes".to_string(),
            message: format!("expected '<id>:<class>', got '{}'", pair),
        })?;
        let id: u32 = id.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: "device_classes".to_string(),
            message: format!("non-numeric device id '{}'", id),
        })?;
        out.insert(DeviceId(id), parse_capability_class(class.trim())?);
    }
    Ok(out)
}

pub fn parse_capability_class(s: &str) -> Result<CapabilityClass, ConfigError> {
    match s {
        "low" => Ok(CapabilityClass::Low),
        "high" => Ok(CapabilityClass::High),
        other => Err(ConfigError::InvalidValue {
            key: "capability_class".to_string(),
            message: format!("unknown capability class '{}'", other),
        }),
    }
}

impl Settings {
    /// Class for a device, defaulting unmapped ids to `low`.
    pub fn class_for(&self, id: DeviceId) -> CapabilityClass {
        self.device_classes.get(&id).copied().unwrap_or(CapabilityClass::Low)
    }
}
