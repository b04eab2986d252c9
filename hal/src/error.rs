//! # Transport Errors
//!
//! Every failure a transport or mailbox can report. Upper layers turn all of
//! these except [`HalError::MailboxFull`] into a lost device.

use core::fmt;

use crate::types::DeviceAddr;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Transport result type alias
pub type HalResult<T> = core::result::Result<T, HalError>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Transport error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HalError {
    // =========================================================================
    // Link
    // =========================================================================
    /// Transport has not been opened
    NotOpen,
    /// Transport is already open
    AlreadyOpen,
    /// The link to the device stopped responding
    LinkDown,
    /// Access outside every mapped device window
    OutOfRange {
        /// First byte of the access
        addr: DeviceAddr,
        /// Length of the access
        len: u64,
    },

    // =========================================================================
    // Boot
    // =========================================================================
    /// Cores never reported ready after reset
    BootTimeout,
    /// Image handle is unusable
    InvalidImage,
    /// Symbol missing from the loaded image
    SymbolNotFound,

    // =========================================================================
    // Mailbox
    // =========================================================================
    /// Mailbox has no free slot (transient)
    MailboxFull,
    /// No such mailbox
    MailboxNotFound,
    /// Mailbox was created but never opened
    MailboxClosed,
    /// Message exceeds the mailbox payload size
    MessageTooLarge,
    /// Nothing arrived before the deadline
    Timeout,
}

impl HalError {
    /// Whether retrying the same operation can succeed
    pub const fn is_transient(&self) -> bool {
        matches!(self, HalError::MailboxFull)
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::NotOpen => write!(f, "transport not open"),
            HalError::AlreadyOpen => write!(f, "transport already open"),
            HalError::LinkDown => write!(f, "device link down"),
            HalError::OutOfRange { addr, len } => {
                write!(f, "access of {} bytes at {} is outside device memory", len, addr)
            },
            HalError::BootTimeout => write!(f, "device cores did not come out of reset"),
            HalError::InvalidImage => write!(f, "invalid device image"),
            HalError::SymbolNotFound => write!(f, "symbol not found in device image"),
            HalError::MailboxFull => write!(f, "mailbox full"),
            HalError::MailboxNotFound => write!(f, "mailbox not found"),
            HalError::MailboxClosed => write!(f, "mailbox not open"),
            HalError::MessageTooLarge => write!(f, "message exceeds mailbox payload size"),
            HalError::Timeout => write!(f, "timed out waiting for device"),
        }
    }
}

impl std::error::Error for HalError {}
