//! Cached telemetry and least-loaded device selection.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::device::{Capacity, DeviceInfo, Thresholds};
use super::telemetry::{NvidiaSmi, StaticTelemetry, TelemetrySource};
use crate::config::AcceleratorConfig;

#[derive(Default)]
struct Snapshot {
    devices: Vec<DeviceInfo>,
    polled_at: Option<Instant>,
}

/// Shared view of the accelerator set.
///
/// Selection is a hint: no device is reserved, and concurrent jobs may be
/// pointed at the same device.
pub struct AcceleratorOrchestrator {
    source: Arc<dyn TelemetrySource>,
    poll_interval: Duration,
    thresholds: Thresholds,
    snapshot: Mutex<Snapshot>,
}

impl AcceleratorOrchestrator {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        poll_interval: Duration,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            source,
            poll_interval,
            thresholds,
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    /// Builds the orchestrator described by the `accelerator` config section.
    ///
    /// Configured static devices take precedence over the telemetry command.
    pub fn from_config(config: &AcceleratorConfig) -> Self {
        let source: Arc<dyn TelemetrySource> = match &config.static_devices {
            Some(devices) => Arc::new(StaticTelemetry::new(devices.clone())),
            None => Arc::new(NvidiaSmi::new(
                config.command.clone(),
                Duration::from_secs(config.command_timeout_secs),
            )),
        };
        Self::new(
            source,
            Duration::from_secs(config.poll_interval_secs),
            Thresholds {
                max_utilization: config.max_utilization,
                max_memory_utilization: config.max_memory_utilization,
            },
        )
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Returns the device snapshot, polling when it is older than the poll
    /// interval or when `force` is set.
    ///
    /// Never fails: a failed poll logs a warning and keeps the previous
    /// snapshot (empty before the first success). The poll time is stamped
    /// either way, so an outage is retried once per interval.
    pub async fn get_status(&self, force: bool) -> Vec<DeviceInfo> {
        let mut snapshot = self.snapshot.lock().await;
        let fresh = snapshot
            .polled_at
            .is_some_and(|at| at.elapsed() < self.poll_interval);
        if fresh && !force {
            return snapshot.devices.clone();
        }

        match self.source.poll().await {
            Ok(devices) => {
                log::debug!(
                    "Telemetry from {}: {} device(s)",
                    self.source.describe(),
                    devices.len()
                );
                snapshot.devices = devices;
            }
            Err(e) => {
                log::warn!(
                    "Telemetry poll failed, keeping {} cached device(s): {}",
                    snapshot.devices.len(),
                    e
                );
            }
        }
        snapshot.polled_at = Some(Instant::now());
        snapshot.devices.clone()
    }

    /// Index of the device the next job should target.
    pub async fn select_device(&self) -> u32 {
        let devices = self.get_status(false).await;
        choose_device(&devices, &self.thresholds)
    }

    pub async fn get_total_capacity(&self) -> Capacity {
        let devices = self.get_status(false).await;
        Capacity::from_devices(&devices, &self.thresholds)
    }
}

/// Picks the available device with the most free memory (ties: lowest
/// utilization, then lowest index). With no device available, falls back
/// to the lowest `(memory_utilization, utilization)`. With no devices at
/// all, returns 0.
pub fn choose_device(devices: &[DeviceInfo], thresholds: &Thresholds) -> u32 {
    let best = devices
        .iter()
        .filter(|d| d.is_available(thresholds))
        .min_by_key(|d| (Reverse(d.memory_free), d.utilization, d.index));
    if let Some(device) = best {
        return device.index;
    }

    devices
        .iter()
        .min_by(|a, b| {
            a.memory_utilization()
                .total_cmp(&b.memory_utilization())
                .then(a.utilization.cmp(&b.utilization))
                .then(a.index.cmp(&b.index))
        })
        .map(|d| d.index)
        .unwrap_or(0)
}
