//! Device Resolution
//!
//! Execution contexts are only meaningful inside the process that created
//! them. Workers therefore receive a [`Target`] and resolve their own context
//! through a [`DeviceResolver`] after the fork. The resolved context type is
//! not required to be `Send`.

use crate::task::Target;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Resolves a target descriptor to an execution context in the current process.
pub trait DeviceResolver: Send + Sync + 'static {
    /// Context handed to measurement functions
    type Context;

    /// Acquire the context for `target`. Called once per task, inside the worker.
    fn resolve(&self, target: &Target) -> anyhow::Result<Self::Context>;
}

/// Device families a target kind maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// NVIDIA CUDA
    Cuda,
    /// OpenCL device
    OpenCl,
    /// Vulkan device
    Vulkan,
    /// Apple Metal
    Metal,
    /// AMD ROCm
    Rocm,
}

impl DeviceKind {
    /// Map a target kind to a device family
    pub fn from_target_kind(kind: &str) -> Option<Self> {
        match kind {
            "llvm" | "c" | "cpu" | "stackvm" => Some(DeviceKind::Cpu),
            "cuda" | "nvptx" => Some(DeviceKind::Cuda),
            "opencl" => Some(DeviceKind::OpenCl),
            "vulkan" => Some(DeviceKind::Vulkan),
            "metal" => Some(DeviceKind::Metal),
            "rocm" => Some(DeviceKind::Rocm),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::OpenCl => "opencl",
            DeviceKind::Vulkan => "vulkan",
            DeviceKind::Metal => "metal",
            DeviceKind::Rocm => "rocm",
        };
        f.write_str(name)
    }
}

/// Errors raised while resolving a target
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// The target names a device family this resolver does not know
    #[error("unknown target kind '{kind}' in target '{target}'")]
    UnknownTarget {
        /// Leading token of the target string
        kind: String,
        /// Full target string
        target: String,
    },

    /// The family is known but the host has no device at that index
    #[error(
        "cannot get context from local devices; \
         no suitable {kind} device {index} for target '{target}'"
    )]
    NoSuchDevice {
        /// Requested device family
        kind: DeviceKind,
        /// Requested device index
        index: u32,
        /// Full target string
        target: String,
    },

    /// `-device_id` is not a non-negative integer
    #[error("invalid device_id '{value}' in target '{target}'")]
    InvalidDeviceId {
        /// Raw option value
        value: String,
        /// Full target string
        target: String,
    },
}

/// A context resolved in, and owned by, one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceContext {
    /// Device family
    pub kind: DeviceKind,
    /// Device index within the family
    pub index: u32,
    /// Pid of the process that resolved this context
    pub owner_pid: u32,
}

/// Default resolver: exposes the host CPU only.
///
/// CPU-class targets resolve to device 0 unless `-device_id=N` selects another
/// logical CPU. Accelerator targets are recognized but reported as missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDevices;

impl HostDevices {
    fn cpu_count() -> u32 {
        std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(1)
    }

    fn lookup(&self, target: &Target) -> Result<DeviceContext, DeviceError> {
        let kind =
            DeviceKind::from_target_kind(target.kind()).ok_or_else(|| DeviceError::UnknownTarget {
                kind: target.kind().to_string(),
                target: target.to_string(),
            })?;

        let index = match target.option("device_id") {
            Some(value) => value.parse().map_err(|_| DeviceError::InvalidDeviceId {
                value: value.to_string(),
                target: target.to_string(),
            })?,
            None => 0,
        };

        let exists = kind == DeviceKind::Cpu && index < Self::cpu_count();
        if !exists {
            return Err(DeviceError::NoSuchDevice {
                kind,
                index,
                target: target.to_string(),
            });
        }

        Ok(DeviceContext {
            kind,
            index,
            owner_pid: std::process::id(),
        })
    }
}

impl DeviceResolver for HostDevices {
    type Context = DeviceContext;

    fn resolve(&self, target: &Target) -> anyhow::Result<DeviceContext> {
        Ok(self.lookup(target)?)
    }
}
