use gpuq_domain::{CapabilityClass, Device, DeviceId};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::telemetry::TelemetryReading;

/// The fixed pool of accelerator devices.
///
/// All ownership mutations are serialized by one mutex. Allocation scans in
/// registry (insertion) order and takes the first available device of the
/// requested class: deterministic, not load-weighted. Devices are created at
/// startup and never destroyed.
pub struct DeviceRegistry {
    devices: Mutex<Vec<Device>>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices: Mutex::new(devices) }
    }

    /// Fallback pool used when no telemetry probe is available at startup, so
    /// the rest of the system still runs end-to-end.
    pub fn with_mock_device() -> Self {
        Self::new(vec![Device::new(
            DeviceId(0),
            "Mock GPU (probe not available)",
            CapabilityClass::Low,
            8192,
        )])
    }

    /// First available device of the class, atomically claimed for `holder`.
    pub async fn allocate(&self, class: CapabilityClass, holder: &str) -> Option<DeviceId> {
        let mut devices = self.devices.lock().await;
        for device in devices.iter_mut() {
            if device.class == class && device.available {
                device.allocate_to(holder);
                info!(device_id = %device.id, %class, holder, "allocated device");
                return Some(device.id);
            }
        }
        warn!(%class, holder, "no available device for class");
        None
    }

    /// Idempotent: releasing a free or unknown device is a logged no-op.
    pub async fn release(&self, id: DeviceId) {
        let mut devices = self.devices.lock().await;
        match devices.iter_mut().find(|d| d.id == id) {
            Some(device) => match device.release() {
                Some(holder) => info!(device_id = %id, holder, "released device"),
                None => warn!(device_id = %id, "release of an already-free device"),
            },
            None => warn!(device_id = %id, "release of unknown device"),
        }
    }

    pub async fn snapshot(&self) -> Vec<Device> {
        self.devices.lock().await.clone()
    }

    /// Telemetry refresh: metric fields only, never ownership.
    pub async fn apply_telemetry(&self, id: DeviceId, reading: TelemetryReading) {
        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.iter_mut().find(|d| d.id == id) {
            device.memory_used_mb = reading.memory_used_mb;
            device.temperature_c = reading.temperature_c;
            device.utilization_pct = reading.utilization_pct;
        }
    }

    pub async fn len(&self) -> usize {
        self.devices.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.lock().await.is_empty()
    }

    pub async fn available_count(&self) -> usize {
        self.devices.lock().await.iter().filter(|d| d.available).count()
    }
}
