//! Accelerator detection.
//!
//! Detection never fails: a missing or broken query tool yields the CPU
//! profile. The resulting [`ExecutionProfile`] is built once at startup and
//! handed to every stage; external processes receive it as environment
//! variables through [`ExecutionProfile::env_vars`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::CapabilityConfig;

pub const ENV_DEVICE: &str = "PIPELINE_DEVICE";
pub const ENV_GPU_AVAILABLE: &str = "PIPELINE_GPU_AVAILABLE";
pub const ENV_DOWNLOAD_WEIGHTS: &str = "PIPELINE_DOWNLOAD_WEIGHTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTag {
    Cpu,
    #[serde(rename = "cuda")]
    Accelerator,
}

impl DeviceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceTag::Cpu => "cpu",
            DeviceTag::Accelerator => "cuda",
        }
    }
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub accelerator_available: bool,
    pub accelerator_count: u32,
    pub device: DeviceTag,
    /// Model weights are only fetched automatically on accelerated hosts
    pub auto_fetch_weights: bool,
    pub accelerator_name: Option<String>,
    pub accelerator_memory_gib: Option<f64>,
}

impl ExecutionProfile {
    pub fn cpu() -> Self {
        Self {
            accelerator_available: false,
            accelerator_count: 0,
            device: DeviceTag::Cpu,
            auto_fetch_weights: false,
            accelerator_name: None,
            accelerator_memory_gib: None,
        }
    }

    pub fn accelerated(count: u32) -> Self {
        Self {
            accelerator_available: true,
            accelerator_count: count,
            device: DeviceTag::Accelerator,
            auto_fetch_weights: true,
            accelerator_name: None,
            accelerator_memory_gib: None,
        }
    }

    /// Environment handed to external stages so they make the same device choice.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            (ENV_DEVICE.to_string(), self.device.to_string()),
            (
                ENV_GPU_AVAILABLE.to_string(),
                self.accelerator_available.to_string(),
            ),
            (
                ENV_DOWNLOAD_WEIGHTS.to_string(),
                self.auto_fetch_weights.to_string(),
            ),
        ]
    }

    /// 0 when accelerated, 1 for degraded (CPU) mode.
    pub fn exit_code(&self) -> i32 {
        if self.accelerator_available { 0 } else { 1 }
    }
}

pub struct CapabilityDetector {
    config: CapabilityConfig,
}

impl CapabilityDetector {
    pub fn new(config: CapabilityConfig) -> Self {
        Self { config }
    }

    pub async fn detect(&self) -> ExecutionProfile {
        let count = match self.query(&["-L"]).await {
            Some(stdout) => parse_device_list(&stdout),
            None => 0,
        };

        if count == 0 {
            info!("No accelerator detected, running in CPU-only mode");
            return ExecutionProfile::cpu();
        }

        let mut profile = ExecutionProfile::accelerated(count);

        // Details are best-effort; availability stands even if this fails.
        match self
            .query(&[
                "--query-gpu=name,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .await
            .and_then(|stdout| parse_device_details(&stdout))
        {
            Some((name, memory_gib)) => {
                profile.accelerator_name = Some(name);
                profile.accelerator_memory_gib = memory_gib;
            }
            None => warn!("Accelerator present but its details could not be queried"),
        }

        info!(
            "Detected {} accelerator(s): {} ({})",
            profile.accelerator_count,
            profile.accelerator_name.as_deref().unwrap_or("unknown"),
            profile
                .accelerator_memory_gib
                .map(|gib| format!("{:.1} GiB", gib))
                .unwrap_or_else(|| "unknown memory".to_string())
        );

        profile
    }

    async fn query(&self, args: &[&str]) -> Option<String> {
        debug!("Querying accelerators: {} {:?}", self.config.query_tool, args);

        let output = match Command::new(&self.config.query_tool).args(args).output().await {
            Ok(output) => output,
            Err(e) => {
                debug!("Accelerator query tool unavailable: {}", e);
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                "Accelerator query exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Counts `GPU <n>: ...` lines of a device listing.
fn parse_device_list(stdout: &str) -> u32 {
    stdout
        .lines()
        .filter(|line| line.trim_start().starts_with("GPU "))
        .count() as u32
}

/// Parses the first `name, memory_mib` row of a CSV device query.
fn parse_device_details(stdout: &str) -> Option<(String, Option<f64>)> {
    let line = stdout.lines().find(|line| !line.trim().is_empty())?;
    let mut fields = line.split(',').map(str::trim);

    let name = fields.next().filter(|name| !name.is_empty())?.to_string();
    let memory_gib = fields
        .next()
        .and_then(|mib| mib.parse::<f64>().ok())
        .map(|mib| mib / 1024.0);

    Some((name, memory_gib))
}
