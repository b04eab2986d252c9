//! # Transport Driver
//!
//! Byte-level access to an external processor's memory, plus reset and image
//! loading.
//!
//! ```text
//!  host                                   device
//! ┌──────────────┐   write < threshold   ┌──────────────────────────┐
//! │ RemoteDevice │ ───── direct ───────► │ DDR / MSMC               │
//! │              │ ───── DMA ──────────► │                          │
//! │              │                       │ L2 (0x008xxxxx) ──┬ core0 │
//! │              │   L2 writes fan out   │                   ├ ...   │
//! │              │ ────────────────────► │                   └ core7 │
//! └──────────────┘                       └──────────────────────────┘
//! ```
//!
//! Implementations are explicit handles. Nothing in this crate is a
//! process-wide singleton.

use std::time::Duration;

use crate::error::{HalError, HalResult};
use crate::types::{CoreMask, DeviceAddr};

// =============================================================================
// DEVICE LAYOUT CONSTANTS
// =============================================================================

/// Cores on one chip
pub const CORES_PER_CHIP: u32 = 8;

/// Window selector (`addr >> 20`) of the core-local L2 memory
pub const L2_LOCAL_WINDOW: u64 = 0x008;

/// Core-local location each core clears once it has left reset
pub const BOOT_ENTRY_LOCATION: DeviceAddr = DeviceAddr::new(0x0087_fffc);

/// Transfers at or above this size go through DMA
pub const DEFAULT_DMA_THRESHOLD: usize = 24 * 1024;

/// Global alias of a core-local address as seen by the host
#[inline]
pub const fn core_alias(core: u32, local: DeviceAddr) -> DeviceAddr {
    DeviceAddr::new((((0x10 + core) as u64) << 24) + local.raw())
}

/// Whether `addr` targets the core-local L2 window
#[inline]
pub const fn is_core_local(addr: DeviceAddr) -> bool {
    addr.window() == L2_LOCAL_WINDOW
}

// =============================================================================
// TRANSFER POLICY
// =============================================================================

/// Path a single transfer takes across the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    /// Programmed I/O through the outbound window
    Direct,
    /// DMA engine transfer
    Dma,
}

/// Transfer path selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPolicy {
    /// Transfers of this many bytes or more use DMA
    pub dma_threshold: usize,
    /// DMA channels claimed at open
    pub dma_channels: u32,
    /// Parameter sets per DMA channel
    pub param_sets: u32,
    /// Outbound window block size
    pub outbound_block: u64,
    /// Upper bound on in-flight DMA transactions
    pub max_dma_transactions: u32,
}

impl TransferPolicy {
    /// Link defaults
    pub const fn new() -> Self {
        Self {
            dma_threshold: DEFAULT_DMA_THRESHOLD,
            dma_channels: 4,
            param_sets: 32,
            outbound_block: 0x40_0000,
            max_dma_transactions: 256,
        }
    }

    /// Never use DMA
    pub const fn direct_only() -> Self {
        Self {
            dma_threshold: usize::MAX,
            ..Self::new()
        }
    }

    /// Path for a transfer of `len` bytes
    #[inline]
    pub const fn path_for(&self, len: usize) -> TransferPath {
        if len < self.dma_threshold {
            TransferPath::Direct
        } else {
            TransferPath::Dma
        }
    }
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// IMAGES
// =============================================================================

/// A loadable device program image with its symbol table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    name: String,
    entry: DeviceAddr,
    symbols: hashbrown::HashMap<String, DeviceAddr>,
}

impl ImageHandle {
    /// Create an image with an entry point and no symbols
    pub fn new(name: impl Into<String>, entry: DeviceAddr) -> Self {
        Self {
            name: name.into(),
            entry,
            symbols: hashbrown::HashMap::new(),
        }
    }

    /// Add a symbol
    pub fn with_symbol(mut self, name: impl Into<String>, addr: DeviceAddr) -> Self {
        self.symbols.insert(name.into(), addr);
        self
    }

    /// Image name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry point
    pub fn entry(&self) -> DeviceAddr {
        self.entry
    }

    /// Resolve a symbol in this image
    pub fn symbol(&self, name: &str) -> HalResult<DeviceAddr> {
        self.symbols.get(name).copied().ok_or(HalError::SymbolNotFound)
    }
}

/// State of the device after a successful reset-and-boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryState {
    /// Entry point the cores were released to
    pub entry: DeviceAddr,
    /// Cores that reported ready
    pub ready: CoreMask,
}

// =============================================================================
// DRIVER TRAIT
// =============================================================================

/// Byte transport to an external processor
pub trait TransportDriver: Send + Sync {
    /// Claim the link
    fn open(&self) -> HalResult<()>;

    /// Release the link
    fn close(&self) -> HalResult<()>;

    /// Copy `bytes` to device memory at `addr`
    fn write(&self, addr: DeviceAddr, bytes: &[u8]) -> HalResult<()>;

    /// Copy device memory at `addr` into `buf`
    fn read(&self, addr: DeviceAddr, buf: &mut [u8]) -> HalResult<()>;

    /// Reset every core, wait for them to come up, then load `image`
    fn reset_and_boot(&self, image: &ImageHandle) -> HalResult<EntryState>;

    /// Resolve `name` in a loaded image
    fn get_symbol(&self, image: &ImageHandle, name: &str) -> HalResult<DeviceAddr>;
}

// =============================================================================
// BOOT POLLING
// =============================================================================

/// Boot readiness polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPoll {
    /// Polls before giving up
    pub max_tries: u32,
    /// Sleep between polls
    pub interval: Duration,
}

impl BootPoll {
    /// Hardware defaults: 1000 polls, 1 ms apart
    pub const fn new() -> Self {
        Self {
            max_tries: 1000,
            interval: Duration::from_millis(1),
        }
    }
}

impl Default for BootPoll {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll every core's boot entry location until all read zero.
///
/// Returns the ready mask, or [`HalError::BootTimeout`] after
/// `poll.max_tries` rounds.
pub fn wait_for_ready<T>(transport: &T, cores: u32, poll: BootPoll) -> HalResult<CoreMask>
where
    T: TransportDriver + ?Sized,
{
    let mut tries = 0u32;
    loop {
        let mut ready = CoreMask::empty();
        for core in 0..cores {
            let mut word = [0u8; 4];
            transport.read(core_alias(core, BOOT_ENTRY_LOCATION), &mut word)?;
            if u32::from_ne_bytes(word) != 0 {
                break;
            }
            ready |= CoreMask::core(core);
        }

        if ready.count() == cores {
            return Ok(ready);
        }

        tries += 1;
        if tries > poll.max_tries {
            log::error!("boot: {} of {} cores ready after {} polls", ready.count(), cores, tries);
            return Err(HalError::BootTimeout);
        }
        if !poll.interval.is_zero() {
            std::thread::sleep(poll.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_alias() {
        assert_eq!(core_alias(0, BOOT_ENTRY_LOCATION).raw(), 0x1087_fffc);
        assert_eq!(core_alias(7, BOOT_ENTRY_LOCATION).raw(), 0x1787_fffc);
    }

    #[test]
    fn test_core_local_window() {
        assert!(is_core_local(DeviceAddr::new(0x0080_0000)));
        assert!(is_core_local(DeviceAddr::new(0x008f_ffff)));
        assert!(!is_core_local(DeviceAddr::new(0x0090_0000)));
        assert!(!is_core_local(DeviceAddr::new(0x8000_0000)));
    }

    #[test]
    fn test_transfer_path() {
        let policy = TransferPolicy::new();
        assert_eq!(policy.path_for(1024), TransferPath::Direct);
        assert_eq!(policy.path_for(24 * 1024 - 1), TransferPath::Direct);
        assert_eq!(policy.path_for(24 * 1024), TransferPath::Dma);
        assert_eq!(TransferPolicy::direct_only().path_for(1 << 30), TransferPath::Direct);
    }

    #[test]
    fn test_image_symbols() {
        let image = ImageHandle::new("monitor", DeviceAddr::new(0x8000_0000))
            .with_symbol("heap_start", DeviceAddr::new(0x8100_0000));
        assert_eq!(image.symbol("heap_start"), Ok(DeviceAddr::new(0x8100_0000)));
        assert_eq!(image.symbol("missing"), Err(HalError::SymbolNotFound));
    }
}
