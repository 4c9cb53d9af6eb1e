//! Accelerator orchestrator: telemetry polling and device selection.

pub mod device;
pub mod error;
pub mod orchestrator;
pub mod telemetry;

pub use device::{Capacity, DeviceInfo, DeviceSummary, Thresholds};
pub use error::TelemetryError;
pub use orchestrator::{choose_device, AcceleratorOrchestrator};
pub use telemetry::{parse_smi_output, NvidiaSmi, StaticTelemetry, TelemetrySource};
