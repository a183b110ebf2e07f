pub mod device;
pub mod error;
pub mod session;
pub mod tasks;
pub mod telemetry;

pub use device::DeviceRegistry;
pub use error::RegistryError;
pub use session::{run_sweeper, SessionRegistry, SessionRegistryConfig};
pub use tasks::{RunningTask, TaskManager};
pub use telemetry::{run_telemetry, DeviceDesc, MockProbe, TelemetryProbe, TelemetryReading};
