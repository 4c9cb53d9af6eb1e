//! Device telemetry snapshots and the availability rule.

use serde::{Deserialize, Serialize};

/// One accelerator as reported by the latest telemetry poll.
///
/// Memory figures are in MiB, utilization and temperature as reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    /// Percent, 0-100.
    pub utilization: u32,
    /// Degrees Celsius.
    #[serde(default)]
    pub temperature: u32,
}

impl DeviceInfo {
    /// Fraction of memory in use, 0.0 when the total is unknown.
    pub fn memory_utilization(&self) -> f64 {
        if self.memory_total == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_total as f64
        }
    }

    pub fn is_available(&self, thresholds: &Thresholds) -> bool {
        f64::from(self.utilization) < thresholds.max_utilization
            && self.memory_utilization() < thresholds.max_memory_utilization
    }
}

/// Load limits above which a device is considered busy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Percent.
    pub max_utilization: f64,
    /// Fraction, 0.0-1.0.
    pub max_memory_utilization: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_utilization: 90.0,
            max_memory_utilization: 0.85,
        }
    }
}

/// Per-device line of a capacity report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub index: u32,
    pub name: String,
    pub memory_free_mb: u64,
    pub utilization: u32,
    pub temperature: u32,
    pub available: bool,
}

/// Aggregate over every known device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub device_count: usize,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub free_memory_mb: u64,
    pub memory_utilization: f64,
    pub avg_utilization: f64,
    pub devices: Vec<DeviceSummary>,
}

impl Capacity {
    pub fn from_devices(devices: &[DeviceInfo], thresholds: &Thresholds) -> Self {
        let total_memory_mb: u64 = devices.iter().map(|d| d.memory_total).sum();
        let used_memory_mb: u64 = devices.iter().map(|d| d.memory_used).sum();
        let free_memory_mb: u64 = devices.iter().map(|d| d.memory_free).sum();
        let avg_utilization = if devices.is_empty() {
            0.0
        } else {
            devices.iter().map(|d| f64::from(d.utilization)).sum::<f64>() / devices.len() as f64
        };
        let memory_utilization = if total_memory_mb == 0 {
            0.0
        } else {
            used_memory_mb as f64 / total_memory_mb as f64
        };

        Self {
            device_count: devices.len(),
            total_memory_mb,
            used_memory_mb,
            free_memory_mb,
            memory_utilization,
            avg_utilization,
            devices: devices
                .iter()
                .map(|d| DeviceSummary {
                    index: d.index,
                    name: d.name.clone(),
                    memory_free_mb: d.memory_free,
                    utilization: d.utilization,
                    temperature: d.temperature,
                    available: d.is_available(thresholds),
                })
                .collect(),
        }
    }
}
