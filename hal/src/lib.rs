//! # clrt Transport Abstraction Layer
//!
//! The seam between the runtime and an accelerator that is not CPU-resident.
//!
//! ## Components
//!
//! - **Transport**: byte reads and writes into device memory, reset and boot,
//!   symbol lookup ([`TransportDriver`])
//! - **Mailboxes**: small request/reply message slots ([`Mailbox`],
//!   [`MailboxChannel`])
//! - **Loopback**: an in-process device used by tests and host-only builds
//!
//! Every collaborator here is an explicit handle passed to the device that
//! uses it.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod loopback;
pub mod mailbox;
pub mod transport;
pub mod types;

pub use error::{HalError, HalResult};
pub use loopback::{LoopbackMailbox, LoopbackTransport, MemoryWindow, TransferStats};
pub use mailbox::{Mailbox, MailboxChannel, MailboxConfig, MailboxId, MailboxMessage, MAX_PAYLOAD};
pub use transport::{
    core_alias, is_core_local, wait_for_ready, BootPoll, EntryState, ImageHandle, TransferPath,
    TransferPolicy, TransportDriver, CORES_PER_CHIP, DEFAULT_DMA_THRESHOLD,
};
pub use types::{CoreMask, DeviceAddr};
