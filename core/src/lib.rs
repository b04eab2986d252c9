//! # clrt Core
//!
//! Compute devices and everything a client needs to drive them: bring-up,
//! partitioning, programs and kernels, submission, and attribute queries.
//!
//! ## Components
//!
//! - **Devices**: CPU and remote accelerator devices, sub-devices, client
//!   handles ([`Device`], [`DeviceHandle`])
//! - **Dispatchers**: per-kind command execution ([`dispatch`])
//! - **Partitioning**: equal splits of compute units ([`PartitionRequest`])
//! - **Programs**: build options, build logs, per-device builds
//!   ([`Program`], [`Kernel`], [`compiler`])
//! - **Properties**: attribute keys and their byte encoding ([`properties`])
//! - **Configuration**: device and process settings ([`config`])
//!
//! ## Example
//!
//! ```no_run
//! use clrt_core::{CpuDeviceConfig, Device, Kernel, LaunchGeometry, NativeCompiler, Program};
//!
//! let device = Device::cpu(CpuDeviceConfig::default())?;
//! let compiler = NativeCompiler::new().with_kernel("fill", |_range| Ok(()));
//! let program = Program::with_source("__kernel void fill() {}");
//! program.build(&device, &compiler, "-cl-mad-enable")?;
//!
//! let kernel = Kernel::new(&program, "fill")?;
//! device.launch(kernel, LaunchGeometry::new(&[1024], &[64])?).wait()?;
//! # Ok::<(), clrt_core::ClError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod compiler;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod partition;
pub mod program;
pub mod properties;
pub mod sysinfo;

use core::fmt;

pub use clrt_execution::{
    Buffer, ClError, ClResult, Command, CommandStatus, CompletionEvent, DeviceId, Image2D,
    LaunchGeometry, MappedRegion, MemObject, WorkGroupRange,
};
pub use compiler::{BuildLog, BuildOptions, Compiler, CompileOutput, NativeCompiler, OptionPolicy};
pub use config::{CpuDeviceConfig, RemoteDeviceConfig, RuntimeConfig};
pub use device::{Device, DeviceHandle, DeviceKind};
pub use partition::PartitionRequest;
pub use program::{BuildStatus, Kernel, Program};
pub use properties::{DeviceInfo, PropertyValue};

/// Runtime version
pub const RUNTIME_VERSION: RuntimeVersion = RuntimeVersion {
    major: 0,
    minor: 1,
    patch: 0,
    suffix: "",
};

/// Runtime version structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
    /// Pre-release suffix, empty for releases
    pub suffix: &'static str,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.suffix.is_empty() {
            write!(f, "-{}", self.suffix)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(RUNTIME_VERSION.to_string(), "0.1.0");
        let rc = RuntimeVersion {
            suffix: "rc1",
            ..RUNTIME_VERSION
        };
        assert_eq!(rc.to_string(), "0.1.0-rc1");
    }
}
