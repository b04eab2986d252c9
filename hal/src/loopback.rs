//! # Loopback Device
//!
//! In-process stand-in for an accelerator reached over a link. Device memory
//! is a sparse page map covering a set of windows, boot is simulated through
//! the per-core boot entry words, and faults can be injected to exercise the
//! device-lost paths of upper layers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{HalError, HalResult};
use crate::mailbox::{Mailbox, MailboxConfig, MailboxId, MailboxMessage};
use crate::transport::{
    core_alias, is_core_local, wait_for_ready, BootPoll, EntryState, ImageHandle,
    TransferPath, TransferPolicy, TransportDriver, BOOT_ENTRY_LOCATION, CORES_PER_CHIP,
};
use crate::types::DeviceAddr;

const PAGE_SIZE: u64 = 4096;

/// Value a core leaves in its boot entry word while held in reset
const RESET_MAGIC: u32 = 0xbabe_face;

// =============================================================================
// MEMORY WINDOWS
// =============================================================================

/// A contiguous range of device memory the loopback accepts accesses to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryWindow {
    /// First byte
    pub base: DeviceAddr,
    /// Length in bytes
    pub size: u64,
}

impl MemoryWindow {
    /// Create a window
    pub const fn new(base: u64, size: u64) -> Self {
        Self {
            base: DeviceAddr::new(base),
            size,
        }
    }

    fn contains(&self, addr: DeviceAddr, len: u64) -> bool {
        addr >= self.base && addr.raw().saturating_add(len) <= self.base.raw() + self.size
    }
}

/// Default map: 512 MiB DDR, 4 MiB MSMC, and each core's 1 MiB L2 alias
pub fn default_windows() -> Vec<MemoryWindow> {
    let mut windows = vec![
        MemoryWindow::new(0x8000_0000, 0x2000_0000),
        MemoryWindow::new(0x0c00_0000, 0x40_0000),
    ];
    for core in 0..CORES_PER_CHIP {
        windows.push(MemoryWindow {
            base: core_alias(core, DeviceAddr::new(0x0080_0000)),
            size: 0x10_0000,
        });
    }
    windows
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Writes that used programmed I/O
    pub direct_writes: u64,
    /// Writes that used DMA
    pub dma_writes: u64,
    /// Reads of any size
    pub reads: u64,
    /// Bytes written
    pub bytes_written: u64,
}

struct LoopbackState {
    open: bool,
    pages: hashbrown::HashMap<u64, Box<[u8]>>,
    booted: Option<EntryState>,
    stall_boot: bool,
    fault: Option<HalError>,
}

impl LoopbackState {
    fn take_fault(&mut self) -> HalResult<()> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn store(&mut self, addr: DeviceAddr, bytes: &[u8]) {
        let mut cursor = addr.raw();
        let mut rest = bytes;
        while !rest.is_empty() {
            let page = cursor / PAGE_SIZE;
            let within = (cursor % PAGE_SIZE) as usize;
            let chunk = rest.len().min(PAGE_SIZE as usize - within);
            let frame = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            frame[within..within + chunk].copy_from_slice(&rest[..chunk]);
            cursor += chunk as u64;
            rest = &rest[chunk..];
        }
    }

    fn load(&self, addr: DeviceAddr, buf: &mut [u8]) {
        let mut cursor = addr.raw();
        let mut done = 0;
        while done < buf.len() {
            let page = cursor / PAGE_SIZE;
            let within = (cursor % PAGE_SIZE) as usize;
            let chunk = (buf.len() - done).min(PAGE_SIZE as usize - within);
            match self.pages.get(&page) {
                Some(frame) => buf[done..done + chunk].copy_from_slice(&frame[within..within + chunk]),
                None => buf[done..done + chunk].fill(0),
            }
            cursor += chunk as u64;
            done += chunk;
        }
    }
}

/// In-process transport backed by host memory
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    windows: Vec<MemoryWindow>,
    policy: TransferPolicy,
    poll: BootPoll,
    direct_writes: AtomicU64,
    dma_writes: AtomicU64,
    reads: AtomicU64,
    bytes_written: AtomicU64,
}

impl LoopbackTransport {
    /// Loopback with the default memory map and link policy
    pub fn new() -> Self {
        Self::with_windows(default_windows(), TransferPolicy::new())
    }

    /// Loopback with a custom memory map
    pub fn with_windows(windows: Vec<MemoryWindow>, policy: TransferPolicy) -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                open: false,
                pages: hashbrown::HashMap::new(),
                booted: None,
                stall_boot: false,
                fault: None,
            }),
            windows,
            policy,
            poll: BootPoll {
                max_tries: 8,
                interval: std::time::Duration::ZERO,
            },
            direct_writes: AtomicU64::new(0),
            dma_writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Make the next transport operation fail with `err`
    pub fn inject_fault(&self, err: HalError) {
        self.state.lock().fault = Some(err);
    }

    /// Keep cores in reset on the next boot
    pub fn stall_boot(&self, stall: bool) {
        self.state.lock().stall_boot = stall;
    }

    /// Whether the link is claimed
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Entry state of the last successful boot
    pub fn booted(&self) -> Option<EntryState> {
        self.state.lock().booted
    }

    /// Transfer counters
    pub fn stats(&self) -> TransferStats {
        TransferStats {
            direct_writes: self.direct_writes.load(Ordering::Relaxed),
            dma_writes: self.dma_writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    fn check_range(&self, addr: DeviceAddr, len: u64) -> HalResult<()> {
        if self.windows.iter().any(|w| w.contains(addr, len)) {
            Ok(())
        } else {
            Err(HalError::OutOfRange { addr, len })
        }
    }

    fn write_one(&self, state: &mut LoopbackState, addr: DeviceAddr, bytes: &[u8]) -> HalResult<()> {
        self.check_range(addr, bytes.len() as u64)?;
        match self.policy.path_for(bytes.len()) {
            TransferPath::Direct => self.direct_writes.fetch_add(1, Ordering::Relaxed),
            TransferPath::Dma => self.dma_writes.fetch_add(1, Ordering::Relaxed),
        };
        self.bytes_written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        #[cfg(feature = "trace_transfers")]
        log::trace!("loopback: write {} bytes at {}", bytes.len(), addr);
        state.store(addr, bytes);
        Ok(())
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportDriver for LoopbackTransport {
    fn open(&self) -> HalResult<()> {
        let mut state = self.state.lock();
        state.take_fault()?;
        if state.open {
            return Err(HalError::AlreadyOpen);
        }
        state.open = true;
        log::debug!(
            "loopback: open ({} DMA channels, {} param sets, threshold {} bytes)",
            self.policy.dma_channels,
            self.policy.param_sets,
            self.policy.dma_threshold
        );
        Ok(())
    }

    fn close(&self) -> HalResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(HalError::NotOpen);
        }
        state.open = false;
        state.booted = None;
        Ok(())
    }

    fn write(&self, addr: DeviceAddr, bytes: &[u8]) -> HalResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(HalError::NotOpen);
        }
        state.take_fault()?;

        if is_core_local(addr) {
            for core in 0..CORES_PER_CHIP {
                self.write_one(&mut state, core_alias(core, addr), bytes)?;
            }
            Ok(())
        } else {
            self.write_one(&mut state, addr, bytes)
        }
    }

    fn read(&self, addr: DeviceAddr, buf: &mut [u8]) -> HalResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(HalError::NotOpen);
        }
        state.take_fault()?;
        self.check_range(addr, buf.len() as u64)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        state.load(addr, buf);
        Ok(())
    }

    fn reset_and_boot(&self, image: &ImageHandle) -> HalResult<EntryState> {
        {
            let mut state = self.state.lock();
            if !state.open {
                return Err(HalError::NotOpen);
            }
            state.take_fault()?;
            if image.entry().is_null() {
                return Err(HalError::InvalidImage);
            }

            state.booted = None;
            let magic = RESET_MAGIC.to_ne_bytes();
            for core in 0..CORES_PER_CHIP {
                state.store(core_alias(core, BOOT_ENTRY_LOCATION), &magic);
            }
            if !state.stall_boot {
                for core in 0..CORES_PER_CHIP {
                    state.store(core_alias(core, BOOT_ENTRY_LOCATION), &[0u8; 4]);
                }
            }
        }

        let ready = wait_for_ready(self, CORES_PER_CHIP, self.poll)?;
        let entry = EntryState {
            entry: image.entry(),
            ready,
        };
        self.state.lock().booted = Some(entry);
        log::info!("loopback: booted '{}' at {}", image.name(), image.entry());
        Ok(entry)
    }

    fn get_symbol(&self, image: &ImageHandle, name: &str) -> HalResult<DeviceAddr> {
        if !self.state.lock().open {
            return Err(HalError::NotOpen);
        }
        image.symbol(name)
    }
}

impl core::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("windows", &self.windows.len())
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// MAILBOX
// =============================================================================

/// Produces the device's reply to one request
pub type Responder = Box<dyn Fn(&MailboxMessage) -> Option<MailboxMessage> + Send + Sync>;

struct Slot {
    depth: usize,
    open: bool,
    queue: VecDeque<MailboxMessage>,
}

/// In-process mailbox set.
///
/// With a responder installed, every message written to mailbox `n` is
/// consumed immediately and the responder's reply lands in mailbox `n + 1`,
/// which is the reply half created right after it by
/// [`crate::MailboxChannel::open`]. Without one, messages queue up.
pub struct LoopbackMailbox {
    slots: Mutex<Vec<Slot>>,
    responder: Option<Responder>,
    fault: Mutex<Option<HalError>>,
}

impl LoopbackMailbox {
    /// Mailbox set where messages simply queue
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            responder: None,
            fault: Mutex::new(None),
        }
    }

    /// Mailbox set that answers each request through `responder`
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&MailboxMessage) -> Option<MailboxMessage> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    /// Make the next mailbox operation fail with `err`
    pub fn inject_fault(&self, err: HalError) {
        *self.fault.lock() = Some(err);
    }

    fn take_fault(&self) -> HalResult<()> {
        match self.fault.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for LoopbackMailbox {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_mut(slots: &mut [Slot], id: MailboxId) -> HalResult<&mut Slot> {
    let slot = slots.get_mut(id.0 as usize).ok_or(HalError::MailboxNotFound)?;
    if !slot.open {
        return Err(HalError::MailboxClosed);
    }
    Ok(slot)
}

impl Mailbox for LoopbackMailbox {
    fn create(&self, config: MailboxConfig) -> HalResult<MailboxId> {
        self.take_fault()?;
        let mut slots = self.slots.lock();
        let id = MailboxId(slots.len() as u32);
        slots.push(Slot {
            depth: config.depth.max(1),
            open: false,
            queue: VecDeque::new(),
        });
        Ok(id)
    }

    fn open(&self, id: MailboxId) -> HalResult<()> {
        self.take_fault()?;
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id.0 as usize).ok_or(HalError::MailboxNotFound)?;
        slot.open = true;
        Ok(())
    }

    fn try_write(&self, id: MailboxId, message: &MailboxMessage) -> HalResult<()> {
        self.take_fault()?;

        if let Some(responder) = &self.responder {
            let reply_id = MailboxId(id.0 + 1);
            {
                let mut slots = self.slots.lock();
                slot_mut(&mut slots, id)?;
                let reply_slot = slot_mut(&mut slots, reply_id)?;
                if reply_slot.queue.len() >= reply_slot.depth {
                    return Err(HalError::MailboxFull);
                }
            }
            let Some(reply) = responder(message) else {
                return Ok(());
            };
            let mut slots = self.slots.lock();
            slot_mut(&mut slots, reply_id)?.queue.push_back(reply);
            return Ok(());
        }

        let mut slots = self.slots.lock();
        let slot = slot_mut(&mut slots, id)?;
        if slot.queue.len() >= slot.depth {
            return Err(HalError::MailboxFull);
        }
        slot.queue.push_back(message.clone());
        Ok(())
    }

    fn read(&self, id: MailboxId) -> HalResult<Option<MailboxMessage>> {
        self.take_fault()?;
        let mut slots = self.slots.lock();
        Ok(slot_mut(&mut slots, id)?.queue.pop_front())
    }

    fn query(&self, id: MailboxId) -> HalResult<usize> {
        let mut slots = self.slots.lock();
        Ok(slot_mut(&mut slots, id)?.queue.len())
    }
}

impl core::fmt::Debug for LoopbackMailbox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackMailbox")
            .field("mailboxes", &self.slots.lock().len())
            .field("responder", &self.responder.is_some())
            .finish()
    }
}
