//! # Remote Dispatch
//!
//! Kernel slots are posted to the accelerator as mailbox requests and
//! answered one at a time. A request carries six words:
//!
//! ```text
//!   [0] entry (low)   [1] entry (high)   [2] slot   [3] slots
//!   [4] first group   [5] group count
//! ```
//!
//! The reply's first word is the slot's status, zero on success.
//!
//! Memory commands move bytes between a buffer's device region and its host
//! shadow through the transport. Any transport or mailbox failure marks the
//! device lost; every later command then fails with
//! [`ClError::DeviceLost`] without touching the device.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clrt_execution::{
    Buffer, ClError, ClResult, Command, CommandKind, DeviceId, Dispatch, LaunchState, SlotIndex,
};
use clrt_hal::{
    DeviceAddr, HalError, ImageHandle, MailboxChannel, MailboxMessage, TransportDriver,
    MAX_PAYLOAD,
};
use static_assertions::const_assert;

use super::{buffer_mapping, detach, image_mapping, validate};

/// Reply status of a slot that ran to completion
pub const SLOT_OK: u32 = 0;

/// Words in a slot request
const REQUEST_WORDS: usize = 6;

const_assert!(REQUEST_WORDS * 4 <= MAX_PAYLOAD);

/// Posts kernels over a mailbox and serves memory commands through a
/// transport
pub struct RemoteDispatcher {
    root: DeviceId,
    transport: Arc<dyn TransportDriver>,
    channel: MailboxChannel,
    image: ImageHandle,
    reply_timeout: Duration,
    // One request/reply exchange in flight
    exchange: Mutex<()>,
    lost: spin::Mutex<Option<HalError>>,
}

impl RemoteDispatcher {
    /// Dispatcher for the partition tree rooted at `root`
    pub fn new(
        root: DeviceId,
        transport: Arc<dyn TransportDriver>,
        channel: MailboxChannel,
        image: ImageHandle,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            root,
            transport,
            channel,
            image,
            reply_timeout,
            exchange: Mutex::new(()),
            lost: spin::Mutex::new(None),
        }
    }

    /// The failure that took the device down, if any
    pub fn lost(&self) -> Option<HalError> {
        *self.lost.lock()
    }

    fn check_alive(&self) -> ClResult<()> {
        match self.lost() {
            Some(err) => Err(ClError::DeviceLost(err)),
            None => Ok(()),
        }
    }

    fn device_lost(&self, err: HalError) -> ClError {
        let mut lost = self.lost.lock();
        if lost.is_none() {
            log::error!("remote: device {} lost: {}", self.root.0, err);
            *lost = Some(err);
        }
        ClError::DeviceLost(err)
    }

    fn device_addr(buffer: &Buffer, offset: usize) -> ClResult<DeviceAddr> {
        let base = buffer.device_addr().ok_or(ClError::InvalidMemObject)?;
        Ok(base.offset(offset as u64))
    }

    /// Copy device bytes into the host shadow
    fn pull(&self, buffer: &Buffer, offset: usize, len: usize) -> ClResult<Vec<u8>> {
        let addr = Self::device_addr(buffer, offset)?;
        let mut bytes = vec![0u8; len];
        self.transport
            .read(addr, &mut bytes)
            .map_err(|err| self.device_lost(err))?;
        buffer.write_host(offset, &bytes)?;
        Ok(bytes)
    }

    /// Copy the host shadow out to the device
    fn push(&self, buffer: &Buffer, offset: usize, len: usize) -> ClResult<()> {
        let addr = Self::device_addr(buffer, offset)?;
        let mut bytes = vec![0u8; len];
        buffer.read_host(offset, &mut bytes)?;
        self.transport
            .write(addr, &bytes)
            .map_err(|err| self.device_lost(err))
    }

    fn run_slot(&self, command: &Command, entry: DeviceAddr, slot: SlotIndex, total: usize) -> ClResult<()> {
        let Some(launch) = command.launch() else {
            return Ok(());
        };
        let range = launch.geometry().slot_range(slot, total);
        if range.is_empty() {
            return Ok(());
        }

        let words: [u32; REQUEST_WORDS] = [
            entry.raw() as u32,
            (entry.raw() >> 32) as u32,
            slot as u32,
            total as u32,
            range.first as u32,
            range.count as u32,
        ];
        let trans_id = command.id().0 as u32;
        let request =
            MailboxMessage::from_words(trans_id, &words).map_err(|err| self.device_lost(err))?;

        let reply = {
            let _exchange = self.exchange.lock().unwrap_or_else(PoisonError::into_inner);
            self.channel
                .write(&request)
                .map_err(|err| self.device_lost(err))?;
            self.channel
                .recv(self.reply_timeout)
                .map_err(|err| self.device_lost(err))?
        };

        if reply.trans_id != trans_id {
            log::warn!("remote: reply {} for request {}", reply.trans_id, trans_id);
            return Err(ClError::KernelFault("reply out of sequence"));
        }
        match reply.word(0) {
            Some(SLOT_OK) => Ok(()),
            Some(status) => {
                log::warn!("remote: '{}' slot {} status {}", launch.kernel().name(), slot, status);
                Err(ClError::KernelFault("remote kernel reported failure"))
            },
            None => Err(ClError::KernelFault("empty reply")),
        }
    }
}

impl Dispatch for RemoteDispatcher {
    fn prepare(&self, command: &Command) -> ClResult<()> {
        self.check_alive()?;
        validate(command)?;

        match command.kind() {
            CommandKind::NdRangeKernel(launch) | CommandKind::TaskKernel(launch) => {
                if launch.kernel().executable_for(self.root).is_none() {
                    return Err(ClError::InvalidProgramExecutable);
                }
                let entry = match self.transport.get_symbol(&self.image, launch.kernel().name()) {
                    Ok(entry) => entry,
                    Err(HalError::SymbolNotFound) => return Err(ClError::InvalidProgramExecutable),
                    Err(err) => return Err(self.device_lost(err)),
                };
                launch.attach(LaunchState::Remote { entry });
            },
            CommandKind::MapBuffer(map) => Self::device_addr(&map.buffer, 0).map(|_| ())?,
            CommandKind::MapImage(map) => Self::device_addr(map.image.buffer(), 0).map(|_| ())?,
            CommandKind::UnmapMemObject(unmap) => {
                Self::device_addr(unmap.target.buffer(), 0).map(|_| ())?
            },
            CommandKind::ReadBuffer(read) => Self::device_addr(&read.buffer, 0).map(|_| ())?,
            CommandKind::WriteBuffer(write) => Self::device_addr(&write.buffer, 0).map(|_| ())?,
            CommandKind::Marker => {},
        }
        Ok(())
    }

    fn execute(&self, command: &Command, slot: Option<SlotIndex>) -> ClResult<()> {
        self.check_alive()?;

        match command.kind() {
            CommandKind::NdRangeKernel(launch) | CommandKind::TaskKernel(launch) => {
                let Some(LaunchState::Remote { entry }) = launch.state() else {
                    return Err(ClError::InvalidProgramExecutable);
                };
                self.run_slot(command, entry, slot.unwrap_or(0), launch.slots().total())
            },
            CommandKind::MapBuffer(map) => {
                self.pull(&map.buffer, map.offset, map.len)?;
                let _ = map.mapped.set(buffer_mapping(map.offset, map.len));
                Ok(())
            },
            CommandKind::MapImage(map) => {
                let region = image_mapping(map)?;
                self.pull(map.image.buffer(), region.offset, region.len)?;
                let _ = map.mapped.set(region);
                Ok(())
            },
            CommandKind::UnmapMemObject(unmap) => {
                self.push(unmap.target.buffer(), unmap.mapping.offset, unmap.mapping.len)
            },
            CommandKind::ReadBuffer(read) => {
                let data = self.pull(&read.buffer, read.offset, read.len)?;
                *read.data.lock() = data;
                Ok(())
            },
            CommandKind::WriteBuffer(write) => {
                write.buffer.write_host(write.offset, &write.bytes)?;
                self.push(&write.buffer, write.offset, write.bytes.len())
            },
            CommandKind::Marker => Ok(()),
        }
    }

    fn release(&self, command: &Command) {
        detach(command);
    }
}

impl core::fmt::Debug for RemoteDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteDispatcher")
            .field("root", &self.root)
            .field("channel", &self.channel)
            .field("image", &self.image.name())
            .field("lost", &self.lost())
            .finish_non_exhaustive()
    }
}
