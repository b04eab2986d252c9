//! # clrt Execution Subsystem
//!
//! Commands, the blocking per-device queue, and the agents that drain it.
//!
//! ## Components
//!
//! - **Commands**: closed set of work kinds with per-variant device state
//! - **Events**: completion sinks clients wait on
//! - **Queue**: FIFO with kernel slot reservation and shutdown
//! - **Workers**: one OS thread per compute unit
//! - **Memory objects**: buffers and images commands operate on

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod command;
pub mod error;
pub mod event;
pub mod memobj;
pub mod queue;
pub mod worker;

pub use command::{
    Command, CommandId, CommandKind, DeviceId, ExecFault, Executable, KernelBinding,
    KernelLaunch, LaunchGeometry, LaunchState, MapBuffer, MapImage, ReadBuffer, SlotIndex,
    SlotReservation, Unmap, WorkGroupRange, WriteBuffer,
};
pub use error::{ClError, ClResult};
pub use event::{CommandStatus, CompletionEvent, ProfilingInfo};
pub use memobj::{Buffer, DeviceRegion, Image2D, MappedRegion, MemObject};
pub use queue::{EventQueue, Popped};
pub use worker::{Dispatch, WorkerPool};
