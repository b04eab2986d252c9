//! # Runtime Status Codes
//!
//! The error type every command completes with. Each variant maps onto the
//! numeric status the C binding layer reports.

use core::fmt;

use clrt_hal::HalError;
use clrt_memory::MemError;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Runtime result type alias
pub type ClResult<T> = core::result::Result<T, ClError>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Runtime error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClError {
    // =========================================================================
    // Resources
    // =========================================================================
    /// Host or device resources exhausted
    OutOfResources,
    /// Host allocation failed
    OutOfHostMemory,
    /// A memory object could not be placed on the device
    MemObjectAllocationFailure,
    /// Mapping a memory object failed
    MapFailure,

    // =========================================================================
    // Devices
    // =========================================================================
    /// Device cannot be partitioned further
    DevicePartitionFailed,
    /// Handle does not name a live device
    InvalidDevice,
    /// Transport to the device failed; the device is unusable
    DeviceLost(HalError),

    // =========================================================================
    // Arguments
    // =========================================================================
    /// Argument value out of range
    InvalidValue,
    /// Operation not valid in the current state
    InvalidOperation,
    /// Memory object handle or range is invalid
    InvalidMemObject,
    /// Work dimension outside 1..=3
    InvalidWorkDimension,
    /// Local size does not divide the global size
    InvalidWorkGroupSize,
    /// Global size is zero or too large
    InvalidGlobalWorkSize,

    // =========================================================================
    // Programs
    // =========================================================================
    /// No compiler available for the device
    CompilerNotAvailable,
    /// Build failed; see the build log
    BuildProgramFailure,
    /// Unrecognised build option
    InvalidBuildOptions,
    /// Program object is unusable
    InvalidProgram,
    /// Program has no linked executable for the device
    InvalidProgramExecutable,
    /// Kernel name not present in the program
    InvalidKernelName,
    /// A kernel body reported a fault while running
    KernelFault(&'static str),
}

impl ClError {
    /// Numeric status reported through the C surface
    pub const fn code(&self) -> i32 {
        match self {
            ClError::OutOfResources => -5,
            ClError::OutOfHostMemory => -6,
            ClError::MemObjectAllocationFailure => -4,
            ClError::MapFailure => -12,
            ClError::DevicePartitionFailed => -18,
            ClError::InvalidDevice => -33,
            ClError::DeviceLost(_) => -2,
            ClError::InvalidValue => -30,
            ClError::InvalidOperation => -59,
            ClError::InvalidMemObject => -38,
            ClError::InvalidWorkDimension => -53,
            ClError::InvalidWorkGroupSize => -54,
            ClError::InvalidGlobalWorkSize => -63,
            ClError::CompilerNotAvailable => -3,
            ClError::BuildProgramFailure => -11,
            ClError::InvalidBuildOptions => -43,
            ClError::InvalidProgram => -44,
            ClError::InvalidProgramExecutable => -45,
            ClError::InvalidKernelName => -46,
            ClError::KernelFault(_) => -5,
        }
    }

    /// Whether the device behind this error must be treated as gone
    pub const fn is_device_lost(&self) -> bool {
        matches!(self, ClError::DeviceLost(_))
    }
}

impl fmt::Display for ClError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClError::OutOfResources => write!(f, "out of resources"),
            ClError::OutOfHostMemory => write!(f, "out of host memory"),
            ClError::MemObjectAllocationFailure => write!(f, "memory object allocation failure"),
            ClError::MapFailure => write!(f, "map failure"),
            ClError::DevicePartitionFailed => write!(f, "device partition failed"),
            ClError::InvalidDevice => write!(f, "invalid device"),
            ClError::DeviceLost(err) => write!(f, "device lost: {}", err),
            ClError::InvalidValue => write!(f, "invalid value"),
            ClError::InvalidOperation => write!(f, "invalid operation"),
            ClError::InvalidMemObject => write!(f, "invalid memory object"),
            ClError::InvalidWorkDimension => write!(f, "invalid work dimension"),
            ClError::InvalidWorkGroupSize => write!(f, "invalid work group size"),
            ClError::InvalidGlobalWorkSize => write!(f, "invalid global work size"),
            ClError::CompilerNotAvailable => write!(f, "compiler not available"),
            ClError::BuildProgramFailure => write!(f, "build program failure"),
            ClError::InvalidBuildOptions => write!(f, "invalid build options"),
            ClError::InvalidProgram => write!(f, "invalid program"),
            ClError::InvalidProgramExecutable => write!(f, "invalid program executable"),
            ClError::InvalidKernelName => write!(f, "invalid kernel name"),
            ClError::KernelFault(msg) => write!(f, "kernel fault: {}", msg),
        }
    }
}

impl std::error::Error for ClError {}

impl From<HalError> for ClError {
    fn from(err: HalError) -> Self {
        ClError::DeviceLost(err)
    }
}

impl From<MemError> for ClError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfDeviceMemory { .. } => ClError::MemObjectAllocationFailure,
            MemError::NotAllocated(_) => ClError::InvalidMemObject,
            _ => ClError::OutOfResources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clrt_hal::DeviceAddr;

    #[test]
    fn test_status_codes() {
        assert_eq!(ClError::InvalidValue.code(), -30);
        assert_eq!(ClError::DevicePartitionFailed.code(), -18);
        assert_eq!(ClError::InvalidProgramExecutable.code(), -45);
        assert_eq!(ClError::InvalidBuildOptions.code(), -43);
    }

    #[test]
    fn test_transport_errors_lose_the_device() {
        let err: ClError = HalError::LinkDown.into();
        assert!(err.is_device_lost());
        assert_eq!(err.to_string(), "device lost: device link down");
    }

    #[test]
    fn test_memory_errors() {
        let oom = MemError::OutOfDeviceMemory {
            requested: 256,
            largest_free: 128,
        };
        assert_eq!(ClError::from(oom), ClError::MemObjectAllocationFailure);
        assert_eq!(
            ClError::from(MemError::NotAllocated(DeviceAddr::new(0x80))),
            ClError::InvalidMemObject
        );
    }
}
