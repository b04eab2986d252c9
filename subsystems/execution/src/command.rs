//! # Commands
//!
//! A command is one unit of work submitted to a device queue. The set of
//! command kinds is closed; device-specific execution state lives inside the
//! variant that needs it and is attached by the dispatcher before the command
//! is queued.
//!
//! ## Kernel reservation
//!
//! A kernel launch is split into `total` slots. Each dequeue of a launch
//! reserves the next slot and hands the *same* command to another agent; the
//! launch leaves the queue when its last slot has been reserved, and
//! completes when its last slot has finished.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use clrt_hal::DeviceAddr;
use spin::Mutex;

use crate::error::{ClError, ClResult};
use crate::event::CompletionEvent;
use crate::memobj::{Buffer, Image2D, MappedRegion, MemObject};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Process-unique command identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl CommandId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process-unique device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

/// Index of one reserved slot of a kernel launch
pub type SlotIndex = usize;

// =============================================================================
// KERNEL COLLABORATORS
// =============================================================================

/// A failure reported by a kernel body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecFault(pub &'static str);

/// Linked device code able to run kernels on the host
pub trait Executable: Send + Sync {
    /// Run `kernel` over one slot's share of work groups
    fn run(&self, kernel: &str, range: &WorkGroupRange) -> Result<(), ExecFault>;
}

/// A kernel as seen by a dispatcher
pub trait KernelBinding: Send + Sync {
    /// Entry point name
    fn name(&self) -> &str;

    /// Linked executable for devices descended from `root`, if the owning
    /// program has been built for it
    fn executable_for(&self, root: DeviceId) -> Option<Arc<dyn Executable>>;
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// ND-range of a kernel launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    /// Used dimensions, 1..=3
    pub dims: usize,
    /// Global work size per dimension
    pub global: [usize; 3],
    /// Work-group size per dimension
    pub local: [usize; 3],
    /// Global id offset per dimension
    pub offset: [usize; 3],
}

impl LaunchGeometry {
    /// Single work-item launch
    pub const fn task() -> Self {
        Self {
            dims: 1,
            global: [1, 1, 1],
            local: [1, 1, 1],
            offset: [0, 0, 0],
        }
    }

    /// Launch over `global` with groups of `local`; unused dimensions are 1
    pub fn new(global: &[usize], local: &[usize]) -> ClResult<Self> {
        let dims = global.len();
        if !(1..=3).contains(&dims) {
            return Err(ClError::InvalidWorkDimension);
        }
        if !local.is_empty() && local.len() != dims {
            return Err(ClError::InvalidWorkGroupSize);
        }

        let mut geometry = Self {
            dims,
            global: [1; 3],
            local: [1; 3],
            offset: [0; 3],
        };
        geometry.global[..dims].copy_from_slice(global);
        if !local.is_empty() {
            geometry.local[..dims].copy_from_slice(local);
        }
        geometry.validate()?;
        Ok(geometry)
    }

    /// Set the global id offset
    pub fn with_offset(mut self, offset: &[usize]) -> Self {
        let n = offset.len().min(3);
        self.offset[..n].copy_from_slice(&offset[..n]);
        self
    }

    /// Check sizes are non-zero and groups tile the range exactly
    pub fn validate(&self) -> ClResult<()> {
        for axis in 0..3 {
            if self.global[axis] == 0 {
                return Err(ClError::InvalidGlobalWorkSize);
            }
            if self.local[axis] == 0 || self.global[axis] % self.local[axis] != 0 {
                return Err(ClError::InvalidWorkGroupSize);
            }
        }
        Ok(())
    }

    /// Work groups per dimension
    pub fn groups(&self) -> [usize; 3] {
        [
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
            self.global[2] / self.local[2],
        ]
    }

    /// Total work groups
    pub fn group_count(&self) -> usize {
        self.groups().iter().product()
    }

    /// Work groups handled by `slot` out of `slots`
    pub fn slot_range(&self, slot: SlotIndex, slots: usize) -> WorkGroupRange {
        let count = self.group_count();
        let slots = slots.max(1);
        let first = slot * count / slots;
        let end = (slot + 1) * count / slots;
        WorkGroupRange {
            geometry: *self,
            first,
            count: end.saturating_sub(first),
        }
    }
}

/// Contiguous run of linearised work-group ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroupRange {
    /// Launch geometry
    pub geometry: LaunchGeometry,
    /// First linear group id
    pub first: usize,
    /// Number of groups
    pub count: usize,
}

impl WorkGroupRange {
    /// Whether the range holds no groups
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Group coordinates in the range, x fastest
    pub fn group_ids(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        let [gx, gy, _] = self.geometry.groups();
        (self.first..self.first + self.count).map(move |linear| {
            [linear % gx, (linear / gx) % gy, linear / (gx * gy)]
        })
    }
}

// =============================================================================
// SLOT RESERVATION
// =============================================================================

/// Reservation and completion counters of a kernel launch
#[derive(Debug)]
pub struct SlotReservation {
    total: usize,
    remaining: AtomicUsize,
    finished: AtomicUsize,
    first_error: Mutex<Option<ClError>>,
}

impl SlotReservation {
    /// Counters for `total` slots (at least one)
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self {
            total,
            remaining: AtomicUsize::new(total),
            finished: AtomicUsize::new(0),
            first_error: Mutex::new(None),
        }
    }

    /// Slots in the launch
    pub fn total(&self) -> usize {
        self.total
    }

    /// Slots not yet reserved
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Reserve the next slot; `true` when it was the last one. `None` once
    /// every slot is taken.
    ///
    /// Called with the owning queue's lock held.
    pub(crate) fn reserve(&self) -> Option<(SlotIndex, bool)> {
        let before = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()?;
        let after = before - 1;
        Some((self.total - after - 1, after == 0))
    }

    /// Record one slot's outcome; returns the launch outcome once every slot
    /// has finished
    pub fn finish(&self, result: ClResult<()>) -> Option<ClResult<()>> {
        if let Err(err) = result {
            self.first_error.lock().get_or_insert(err);
        }
        let done = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if done < self.total {
            return None;
        }
        Some(match *self.first_error.lock() {
            Some(err) => Err(err),
            None => Ok(()),
        })
    }
}

// =============================================================================
// COMMAND VARIANTS
// =============================================================================

/// Device state attached to a launch before it is queued
#[derive(Clone)]
pub enum LaunchState {
    /// Host-run executable
    Host(Arc<dyn Executable>),
    /// Kernel entry on a remote device
    Remote {
        /// Entry point address
        entry: DeviceAddr,
    },
}

impl core::fmt::Debug for LaunchState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LaunchState::Host(_) => f.write_str("LaunchState::Host"),
            LaunchState::Remote { entry } => write!(f, "LaunchState::Remote({})", entry),
        }
    }
}

/// Kernel launch
pub struct KernelLaunch {
    kernel: Arc<dyn KernelBinding>,
    geometry: LaunchGeometry,
    slots: SlotReservation,
    state: Mutex<Option<LaunchState>>,
}

impl KernelLaunch {
    /// Kernel being launched
    pub fn kernel(&self) -> &Arc<dyn KernelBinding> {
        &self.kernel
    }

    /// ND-range
    pub fn geometry(&self) -> &LaunchGeometry {
        &self.geometry
    }

    /// Slot counters
    pub fn slots(&self) -> &SlotReservation {
        &self.slots
    }

    /// Attach device state
    pub fn attach(&self, state: LaunchState) {
        *self.state.lock() = Some(state);
    }

    /// Detach device state
    pub fn detach(&self) -> Option<LaunchState> {
        self.state.lock().take()
    }

    /// Attached device state
    pub fn state(&self) -> Option<LaunchState> {
        self.state.lock().clone()
    }
}

impl core::fmt::Debug for KernelLaunch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelLaunch")
            .field("kernel", &self.kernel.name())
            .field("geometry", &self.geometry)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

/// Map part of a buffer into host memory
#[derive(Debug)]
pub struct MapBuffer {
    /// Target buffer
    pub buffer: Arc<Buffer>,
    /// Start of the mapping
    pub offset: usize,
    /// Length of the mapping
    pub len: usize,
    /// Set when the map completes
    pub mapped: OnceLock<MappedRegion>,
}

/// Map a region of an image into host memory
#[derive(Debug)]
pub struct MapImage {
    /// Target image
    pub image: Arc<Image2D>,
    /// First pixel
    pub origin: [usize; 3],
    /// Pixels per dimension
    pub region: [usize; 3],
    /// Set when the map completes
    pub mapped: OnceLock<MappedRegion>,
}

/// Release a mapping made by a map command
#[derive(Debug)]
pub struct Unmap {
    /// Mapped object
    pub target: MemObject,
    /// The mapping being released
    pub mapping: MappedRegion,
}

/// Copy device contents into host memory
#[derive(Debug)]
pub struct ReadBuffer {
    /// Source buffer
    pub buffer: Arc<Buffer>,
    /// Start offset
    pub offset: usize,
    /// Bytes to read
    pub len: usize,
    /// Filled when the read completes
    pub data: Mutex<Vec<u8>>,
}

/// Copy host bytes into a buffer
#[derive(Debug)]
pub struct WriteBuffer {
    /// Destination buffer
    pub buffer: Arc<Buffer>,
    /// Start offset
    pub offset: usize,
    /// Bytes to write
    pub bytes: Vec<u8>,
}

/// Kind of a command
#[derive(Debug)]
pub enum CommandKind {
    /// ND-range kernel launch
    NdRangeKernel(KernelLaunch),
    /// Single work-item kernel launch
    TaskKernel(KernelLaunch),
    /// Buffer map
    MapBuffer(MapBuffer),
    /// Image map
    MapImage(MapImage),
    /// Buffer or image unmap
    UnmapMemObject(Unmap),
    /// Buffer read
    ReadBuffer(ReadBuffer),
    /// Buffer write
    WriteBuffer(WriteBuffer),
    /// No device work
    Marker,
}

// =============================================================================
// COMMAND
// =============================================================================

/// Unit of work for a device queue
#[derive(Debug)]
pub struct Command {
    id: CommandId,
    kind: CommandKind,
    event: CompletionEvent,
}

impl Command {
    fn with_kind(kind: CommandKind) -> Arc<Self> {
        Arc::new(Self {
            id: CommandId::next(),
            kind,
            event: CompletionEvent::new(),
        })
    }

    fn launch_of(kernel: Arc<dyn KernelBinding>, geometry: LaunchGeometry, slots: usize) -> KernelLaunch {
        KernelLaunch {
            kernel,
            geometry,
            slots: SlotReservation::new(slots),
            state: Mutex::new(None),
        }
    }

    /// ND-range launch split into `slots` reservations
    pub fn nd_range(
        kernel: Arc<dyn KernelBinding>,
        geometry: LaunchGeometry,
        slots: usize,
    ) -> Arc<Self> {
        Self::with_kind(CommandKind::NdRangeKernel(Self::launch_of(kernel, geometry, slots)))
    }

    /// Single work-item launch
    pub fn task(kernel: Arc<dyn KernelBinding>) -> Arc<Self> {
        Self::with_kind(CommandKind::TaskKernel(Self::launch_of(
            kernel,
            LaunchGeometry::task(),
            1,
        )))
    }

    /// Map `len` bytes of `buffer` at `offset`
    pub fn map_buffer(buffer: Arc<Buffer>, offset: usize, len: usize) -> Arc<Self> {
        Self::with_kind(CommandKind::MapBuffer(MapBuffer {
            buffer,
            offset,
            len,
            mapped: OnceLock::new(),
        }))
    }

    /// Map `region` of `image` at `origin`
    pub fn map_image(image: Arc<Image2D>, origin: [usize; 3], region: [usize; 3]) -> Arc<Self> {
        Self::with_kind(CommandKind::MapImage(MapImage {
            image,
            origin,
            region,
            mapped: OnceLock::new(),
        }))
    }

    /// Release `mapping` of `target`
    pub fn unmap(target: MemObject, mapping: MappedRegion) -> Arc<Self> {
        Self::with_kind(CommandKind::UnmapMemObject(Unmap { target, mapping }))
    }

    /// Read `len` bytes of `buffer` at `offset`
    pub fn read_buffer(buffer: Arc<Buffer>, offset: usize, len: usize) -> Arc<Self> {
        Self::with_kind(CommandKind::ReadBuffer(ReadBuffer {
            buffer,
            offset,
            len,
            data: Mutex::new(Vec::new()),
        }))
    }

    /// Write `bytes` into `buffer` at `offset`
    pub fn write_buffer(buffer: Arc<Buffer>, offset: usize, bytes: Vec<u8>) -> Arc<Self> {
        Self::with_kind(CommandKind::WriteBuffer(WriteBuffer {
            buffer,
            offset,
            bytes,
        }))
    }

    /// Marker with no device work
    pub fn marker() -> Arc<Self> {
        Self::with_kind(CommandKind::Marker)
    }

    /// Identifier
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Kind and payload
    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Completion sink
    pub fn event(&self) -> &CompletionEvent {
        &self.event
    }

    /// Launch payload, for kernel commands
    pub fn launch(&self) -> Option<&KernelLaunch> {
        match &self.kind {
            CommandKind::NdRangeKernel(launch) | CommandKind::TaskKernel(launch) => Some(launch),
            _ => None,
        }
    }

    /// Mapping produced by a completed map command
    pub fn mapped_region(&self) -> Option<MappedRegion> {
        match &self.kind {
            CommandKind::MapBuffer(map) => map.mapped.get().copied(),
            CommandKind::MapImage(map) => map.mapped.get().copied(),
            _ => None,
        }
    }

    /// Bytes produced by a completed read command
    pub fn take_read_data(&self) -> Option<Vec<u8>> {
        match &self.kind {
            CommandKind::ReadBuffer(read) => Some(core::mem::take(&mut *read.data.lock())),
            _ => None,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match &self.kind {
            CommandKind::NdRangeKernel(_) => "ndrange",
            CommandKind::TaskKernel(_) => "task",
            CommandKind::MapBuffer(_) => "map-buffer",
            CommandKind::MapImage(_) => "map-image",
            CommandKind::UnmapMemObject(_) => "unmap",
            CommandKind::ReadBuffer(_) => "read-buffer",
            CommandKind::WriteBuffer(_) => "write-buffer",
            CommandKind::Marker => "marker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedKernel;

    impl KernelBinding for NamedKernel {
        fn name(&self) -> &str {
            "k"
        }

        fn executable_for(&self, _root: DeviceId) -> Option<Arc<dyn Executable>> {
            None
        }
    }

    #[test]
    fn test_geometry_validation() {
        assert!(LaunchGeometry::new(&[64, 8], &[8, 8]).is_ok());
        assert_eq!(LaunchGeometry::new(&[], &[]), Err(ClError::InvalidWorkDimension));
        assert_eq!(LaunchGeometry::new(&[1, 1, 1, 1], &[]), Err(ClError::InvalidWorkDimension));
        assert_eq!(LaunchGeometry::new(&[10], &[3]), Err(ClError::InvalidWorkGroupSize));
        assert_eq!(LaunchGeometry::new(&[0], &[]), Err(ClError::InvalidGlobalWorkSize));
        assert_eq!(LaunchGeometry::new(&[8, 8], &[8]), Err(ClError::InvalidWorkGroupSize));
    }

    #[test]
    fn test_slot_ranges_cover_every_group() {
        let geometry = LaunchGeometry::new(&[16, 4], &[2, 2]).unwrap();
        assert_eq!(geometry.group_count(), 16);

        let mut seen = Vec::new();
        for slot in 0..3 {
            let range = geometry.slot_range(slot, 3);
            seen.extend(range.group_ids());
        }
        assert_eq!(seen.len(), 16);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 16);
        assert!(seen.iter().all(|g| g[0] < 8 && g[1] < 2 && g[2] == 0));
    }

    #[test]
    fn test_more_slots_than_groups() {
        let geometry = LaunchGeometry::new(&[2], &[1]).unwrap();
        let empty = (0..4).filter(|&s| geometry.slot_range(s, 4).is_empty()).count();
        assert_eq!(empty, 2);
    }

    #[test]
    fn test_reservation_counts() {
        let slots = SlotReservation::new(3);
        assert_eq!(slots.reserve(), Some((0, false)));
        assert_eq!(slots.reserve(), Some((1, false)));
        assert_eq!(slots.reserve(), Some((2, true)));
        assert_eq!(slots.remaining(), 0);
        assert_eq!(slots.reserve(), None);
        assert_eq!(slots.remaining(), 0);

        assert_eq!(slots.finish(Ok(())), None);
        assert_eq!(slots.finish(Err(ClError::KernelFault("boom"))), None);
        assert_eq!(slots.finish(Ok(())), Some(Err(ClError::KernelFault("boom"))));
    }

    #[test]
    fn test_zero_slots_becomes_one() {
        let command = Command::nd_range(Arc::new(NamedKernel), LaunchGeometry::task(), 0);
        assert_eq!(command.launch().unwrap().slots().total(), 1);
    }

    #[test]
    fn test_command_ids_unique() {
        let a = Command::marker();
        let b = Command::marker();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "marker");
        assert!(a.launch().is_none());
    }

    #[test]
    fn test_launch_state_attach_detach() {
        let command = Command::task(Arc::new(NamedKernel));
        let launch = command.launch().unwrap();
        assert!(launch.state().is_none());
        launch.attach(LaunchState::Remote {
            entry: DeviceAddr::new(0x8000_0000),
        });
        assert!(matches!(launch.state(), Some(LaunchState::Remote { .. })));
        assert!(launch.detach().is_some());
        assert!(launch.state().is_none());
    }
}
