//! # clrt Memory Subsystem
//!
//! Host-side management of device memory that the host cannot address
//! directly.
//!
//! ## Features
//!
//! - First-fit allocation with neighbour coalescing
//! - Standard (128 B) and on-demand (4 KiB) granularity
//! - Fatal or fail-soft exhaustion
//! - One coarse lock per heap

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

use core::fmt;

use clrt_hal::DeviceAddr;

pub mod heap;

pub use heap::{
    AllocPolicy, FreeBlock, HeapConfig, HeapMode, HeapStats, RemoteHeap, MIN_BLOCK_SIZE,
    MIN_ONDEMAND_BLOCK_SIZE,
};

/// Memory subsystem result type
pub type MemResult<T> = core::result::Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MemError {
    /// No free block can hold the request
    OutOfDeviceMemory {
        /// Rounded request size
        requested: u64,
        /// Largest free block at the time of the request
        largest_free: u64,
    },
    /// Address does not start a live allocation
    NotAllocated(DeviceAddr),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfDeviceMemory {
                requested,
                largest_free,
            } => write!(
                f,
                "out of device memory: requested {} bytes, largest free block {} bytes",
                requested, largest_free
            ),
            MemError::NotAllocated(addr) => write!(f, "{} is not an allocated block", addr),
        }
    }
}

impl std::error::Error for MemError {}
