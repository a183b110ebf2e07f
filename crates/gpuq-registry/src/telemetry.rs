use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpuq_domain::DeviceId;
use tracing::{debug, info, warn};

use crate::device::DeviceRegistry;
use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    pub memory_used_mb: u64,
    pub temperature_c: f32,
    pub utilization_pct: f32,
}

/// Static facts about a device, read once at startup.
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub name: String,
    pub memory_total_mb: u64,
}

/// Pluggable device telemetry. The production probe wraps the vendor
/// management library; tests and probe-less hosts use [`MockProbe`].
#[async_trait]
pub trait TelemetryProbe: Send + Sync + 'static {
    /// Name and total memory, used to build the registry at startup.
    async fn describe(&self, id: DeviceId) -> Result<DeviceDesc, RegistryError>;

    /// Current metrics for one device.
    async fn read(&self, id: DeviceId) -> Result<TelemetryReading, RegistryError>;
}

/// Fixed-value probe for tests and development hosts without accelerators.
#[derive(Debug, Default, Clone)]
pub struct MockProbe;

#[async_trait]
impl TelemetryProbe for MockProbe {
    async fn describe(&self, _id: DeviceId) -> Result<DeviceDesc, RegistryError> {
        Ok(DeviceDesc { name: "Mock GPU".to_string(), memory_total_mb: 8192 })
    }

    async fn read(&self, _id: DeviceId) -> Result<TelemetryReading, RegistryError> {
        Ok(TelemetryReading { memory_used_mb: 0, temperature_c: 35.0, utilization_pct: 0.0 })
    }
}

/// Background metric refresh. A failed read updates nothing and logs a
/// warning; it never flips availability. Runs until the task is dropped.
pub async fn run_telemetry(
    registry: Arc<DeviceRegistry>,
    probe: Arc<dyn TelemetryProbe>,
    interval: Duration,
) {
    info!(interval_secs = interval.as_secs(), "starting device telemetry loop");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick

    loop {
        ticker.tick().await;
        let ids: Vec<DeviceId> = registry.snapshot().await.iter().map(|d| d.id).collect();
        for id in ids {
            match probe.read(id).await {
                Ok(reading) => {
                    debug!(device_id = %id, used_mb = reading.memory_used_mb, "telemetry refreshed");
                    registry.apply_telemetry(id, reading).await;
                }
                Err(e) => warn!(device_id = %id, error = %e, "telemetry read failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuq_domain::{CapabilityClass, Device};

    struct FlakyProbe;

    #[async_trait]
    impl TelemetryProbe for FlakyProbe {
        async fn describe(&self, _id: DeviceId) -> Result<DeviceDesc, RegistryError> {
            Err(RegistryError::ProbeUnavailable("no library".to_string()))
        }

        async fn read(&self, id: DeviceId) -> Result<TelemetryReading, RegistryError> {
            if id == DeviceId(0) {
                Ok(TelemetryReading { memory_used_mb: 100, temperature_c: 50.0, utilization_pct: 10.0 })
            } else {
                Err(RegistryError::ProbeRead { device: id.as_u32(), message: "nvml error".to_string() })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reads_change_nothing() {
        let registry = Arc::new(DeviceRegistry::new(vec![
            Device::new(DeviceId(0), "GPU 0", CapabilityClass::Low, 8192),
            Device::new(DeviceId(1), "GPU 1", CapabilityClass::Low, 8192),
        ]));

        let loop_task = tokio::spawn(run_telemetry(
            registry.clone(),
            Arc::new(FlakyProbe),
            Duration::from_secs(5),
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        loop_task.abort();

        let snap = registry.snapshot().await;
        assert_eq!(snap[0].memory_used_mb, 100);
        // Device 1's read failed: untouched, still available.
        assert_eq!(snap[1].memory_used_mb, 0);
        assert!(snap[1].available);
    }
}
