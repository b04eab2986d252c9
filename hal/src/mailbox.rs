//! # Mailboxes
//!
//! Small fixed-size message slots shared with the device. The host posts
//! launch requests into one mailbox and collects replies from another.
//!
//! A full mailbox is transient. [`MailboxChannel::write`] spins on it rather
//! than surfacing it to callers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{HalError, HalResult};

/// Largest payload a single mailbox message carries
pub const MAX_PAYLOAD: usize = 64;

static_assertions::const_assert!(MAX_PAYLOAD % 4 == 0);

// =============================================================================
// MESSAGES
// =============================================================================

/// Mailbox identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxId(pub u32);

/// Mailbox creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxConfig {
    /// Messages the mailbox holds before it reports full
    pub depth: usize,
}

impl MailboxConfig {
    /// Default depth
    pub const fn new() -> Self {
        Self { depth: 16 }
    }

    /// Custom depth
    pub const fn with_depth(depth: usize) -> Self {
        Self { depth }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One mailbox message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailboxMessage {
    /// Transaction id echoed back by the device
    pub trans_id: u32,
    /// Payload bytes
    pub payload: heapless::Vec<u8, MAX_PAYLOAD>,
}

impl MailboxMessage {
    /// Build a message from a byte slice
    pub fn new(trans_id: u32, bytes: &[u8]) -> HalResult<Self> {
        let payload =
            heapless::Vec::from_slice(bytes).map_err(|()| HalError::MessageTooLarge)?;
        Ok(Self { trans_id, payload })
    }

    /// Build a message from 32-bit words
    pub fn from_words(trans_id: u32, words: &[u32]) -> HalResult<Self> {
        let mut payload = heapless::Vec::new();
        for word in words {
            payload
                .extend_from_slice(&word.to_ne_bytes())
                .map_err(|()| HalError::MessageTooLarge)?;
        }
        Ok(Self { trans_id, payload })
    }

    /// Read the `index`th 32-bit word of the payload
    pub fn word(&self, index: usize) -> Option<u32> {
        let start = index * 4;
        let bytes = self.payload.get(start..start + 4)?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

// =============================================================================
// MAILBOX TRAIT
// =============================================================================

/// Device mailbox collaborator
pub trait Mailbox: Send + Sync {
    /// Create a mailbox
    fn create(&self, config: MailboxConfig) -> HalResult<MailboxId>;

    /// Open a created mailbox for traffic
    fn open(&self, id: MailboxId) -> HalResult<()>;

    /// Post a message; fails with [`HalError::MailboxFull`] when no slot is free
    fn try_write(&self, id: MailboxId, message: &MailboxMessage) -> HalResult<()>;

    /// Take the oldest message, if any
    fn read(&self, id: MailboxId) -> HalResult<Option<MailboxMessage>>;

    /// Number of messages waiting
    fn query(&self, id: MailboxId) -> HalResult<usize>;
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Paired request/reply mailboxes over a shared [`Mailbox`] handle
#[derive(Clone)]
pub struct MailboxChannel {
    mailbox: Arc<dyn Mailbox>,
    to_device: MailboxId,
    from_device: MailboxId,
}

impl MailboxChannel {
    /// Create and open both directions
    pub fn open(mailbox: Arc<dyn Mailbox>, config: MailboxConfig) -> HalResult<Self> {
        let to_device = mailbox.create(config)?;
        let from_device = mailbox.create(config)?;
        mailbox.open(to_device)?;
        mailbox.open(from_device)?;
        log::debug!("mailbox: channel {:?} -> {:?} open", to_device, from_device);
        Ok(Self {
            mailbox,
            to_device,
            from_device,
        })
    }

    /// Request mailbox id
    pub fn to_device(&self) -> MailboxId {
        self.to_device
    }

    /// Reply mailbox id
    pub fn from_device(&self) -> MailboxId {
        self.from_device
    }

    /// Post a request, retrying while the mailbox is full
    pub fn write(&self, message: &MailboxMessage) -> HalResult<()> {
        let mut retries = 0u64;
        loop {
            match self.mailbox.try_write(self.to_device, message) {
                Err(err) if err.is_transient() => {
                    retries += 1;
                    std::thread::yield_now();
                },
                Ok(()) => {
                    if retries > 0 {
                        log::trace!("mailbox: write {} after {} retries", message.trans_id, retries);
                    }
                    return Ok(());
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Wait up to `timeout` for the next reply
    pub fn recv(&self, timeout: Duration) -> HalResult<MailboxMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.mailbox.read(self.from_device)? {
                return Ok(message);
            }
            if Instant::now() >= deadline {
                return Err(HalError::Timeout);
            }
            std::thread::yield_now();
        }
    }

    /// Replies waiting to be read
    pub fn pending_replies(&self) -> HalResult<usize> {
        self.mailbox.query(self.from_device)
    }
}

impl core::fmt::Debug for MailboxChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MailboxChannel")
            .field("to_device", &self.to_device)
            .field("from_device", &self.from_device)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_words() {
        let msg = MailboxMessage::from_words(7, &[1, 2, 0xdead_beef]).unwrap();
        assert_eq!(msg.trans_id, 7);
        assert_eq!(msg.payload.len(), 12);
        assert_eq!(msg.word(2), Some(0xdead_beef));
        assert_eq!(msg.word(3), None);
    }

    #[test]
    fn test_message_too_large() {
        let bytes = [0u8; MAX_PAYLOAD + 1];
        assert_eq!(MailboxMessage::new(0, &bytes), Err(HalError::MessageTooLarge));
        assert!(MailboxMessage::new(0, &bytes[..MAX_PAYLOAD]).is_ok());
    }
}
