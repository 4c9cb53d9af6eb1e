//! Telemetry sources.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::device::DeviceInfo;
use super::TelemetryError;

pub const SMI_QUERY: &str =
    "--query-gpu=index,name,memory.total,memory.used,memory.free,utilization.gpu,temperature.gpu";
pub const SMI_FORMAT: &str = "--format=csv,noheader,nounits";

/// Something that can report the current device set.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn poll(&self) -> Result<Vec<DeviceInfo>, TelemetryError>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// Queries `nvidia-smi` (or a compatible program) and parses its CSV output.
pub struct NvidiaSmi {
    program: String,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TelemetrySource for NvidiaSmi {
    async fn poll(&self) -> Result<Vec<DeviceInfo>, TelemetryError> {
        let run = Command::new(&self.program)
            .arg(SMI_QUERY)
            .arg(SMI_FORMAT)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| TelemetryError::Timeout {
                program: self.program.clone(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| TelemetryError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(TelemetryError::Exit {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_smi_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn describe(&self) -> String {
        self.program.clone()
    }
}

/// Parses `index, name, total, used, free, util, temp` lines.
///
/// Malformed lines are skipped with a warning. Fields reported as `[N/A]`
/// read as zero.
pub fn parse_smi_output(stdout: &str) -> Vec<DeviceInfo> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let device = parse_smi_line(line);
            if device.is_none() {
                log::warn!("Skipping malformed telemetry line: {}", line);
            }
            device
        })
        .collect()
}

fn parse_smi_line(line: &str) -> Option<DeviceInfo> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 7 {
        return None;
    }
    // Product names may themselves contain commas; the five numeric
    // columns are always the last ones.
    let tail = &parts[parts.len() - 5..];
    let name = parts[1..parts.len() - 5].join(", ");

    Some(DeviceInfo {
        index: parts[0].parse().ok()?,
        name,
        memory_total: number(tail[0])?,
        memory_used: number(tail[1])?,
        memory_free: number(tail[2])?,
        utilization: u32::try_from(number(tail[3])?).ok()?,
        temperature: u32::try_from(number(tail[4])?).ok()?,
    })
}

fn number(field: &str) -> Option<u64> {
    if field.contains("N/A") {
        return Some(0);
    }
    field.parse().ok()
}

/// A fixed device list, for hosts without accelerators and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetry {
    devices: Vec<DeviceInfo>,
}

impl StaticTelemetry {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetry {
    async fn poll(&self) -> Result<Vec<DeviceInfo>, TelemetryError> {
        Ok(self.devices.clone())
    }

    fn describe(&self) -> String {
        format!("static ({} device(s))", self.devices.len())
    }
}
