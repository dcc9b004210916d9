//! Configuration structs for devices, partitioning and the multiply engine.
//!
//! Every struct has a `Default` and can be deserialized from JSON with missing
//! fields falling back to the defaults.

use crate::device::DeviceClass;
use crate::error::Result;
use serde::Deserialize;
use std::path::Path;

/// Controls how index ranges are split into device bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Band sizes are rounded up to a multiple of this value (1 disables rounding).
    pub alignment: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self { alignment: 16 }
    }
}

impl PartitionConfig {
    pub fn with_alignment(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }
}

/// Parameters of a host-thread device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CpuDeviceConfig {
    /// Name reported in `DeviceInfo`.
    pub name: String,
    /// Device class; `Accelerator` makes matrices use the hybrid format.
    pub class: DeviceClass,
    /// Number of parallel execution units a kernel launch is split over.
    pub compute_units: usize,
    /// Work items per execution unit.
    pub group_size: usize,
}

impl Default for CpuDeviceConfig {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            class: DeviceClass::Cpu,
            compute_units: 4,
            group_size: 1,
        }
    }
}

impl CpuDeviceConfig {
    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = compute_units.max(1);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

/// Parameters of a wgpu device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GpuDeviceConfig {
    /// Workgroups dispatched per multiply kernel.
    pub compute_units: usize,
    /// Requested workgroup size, clamped to the adapter limit.
    pub workgroup_size: u32,
    /// Request `SHADER_F64` so `f64` kernels can be built.
    pub request_f64: bool,
}

impl Default for GpuDeviceConfig {
    fn default() -> Self {
        Self {
            compute_units: 64,
            workgroup_size: 64,
            request_f64: true,
        }
    }
}

/// Options for `SpMat` construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpMatConfig {
    /// Check row pointers and column indices before building device data.
    pub validate_input: bool,
}

impl Default for SpMatConfig {
    fn default() -> Self {
        Self {
            validate_input: true,
        }
    }
}

impl SpMatConfig {
    pub fn unchecked() -> Self {
        Self {
            validate_input: false,
        }
    }
}

/// Top-level configuration as read by the demo binary.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub partition: PartitionConfig,
    pub cpu_devices: Vec<CpuDeviceConfig>,
    pub gpu: GpuDeviceConfig,
    pub use_gpu: bool,
    pub spmat: SpMatConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
