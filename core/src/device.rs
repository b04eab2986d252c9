//! # Compute Devices
//!
//! A device owns one [`EventQueue`] and one [`WorkerPool`] with an agent per
//! compute unit. Clients hold devices through [`DeviceHandle`], which counts
//! client references.
//!
//! ## Partition tree
//!
//! ```text
//!   root (8 CU)
//!    ├── sub (3 CU) ──► parent: Arc<root>
//!    └── sub (3 CU) ──► parent: Arc<root>
//! ```
//!
//! Sub-devices keep their parent alive and share its dispatcher (and with it
//! the transport and heaps). The parent keeps no reference to its children.
//! Every device has its own queue, agents and client count.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use clrt_execution::{
    Buffer, ClError, ClResult, Command, CommandStatus, CompletionEvent, DeviceId, Dispatch,
    EventQueue, KernelBinding, LaunchGeometry, WorkerPool,
};
use clrt_hal::{HalError, MailboxChannel, TransportDriver};
use clrt_memory::{AllocPolicy, RemoteHeap};

use crate::compiler::OptionPolicy;
use crate::config::{CpuDeviceConfig, RemoteDeviceConfig};
use crate::dispatch::{CpuDispatcher, RemoteDispatcher};
use crate::partition::PartitionRequest;
use crate::properties::{DeviceInfo, DeviceProfile, PropertyValue};
use crate::sysinfo;

fn next_device_id() -> DeviceId {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    DeviceId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Where a device executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// Accelerator behind a transport
    Remote,
}

/// Resources of a booted accelerator, shared across its partition tree
struct RemoteContext {
    transport: Arc<dyn TransportDriver>,
    heap: Arc<RemoteHeap>,
    ondemand: Option<Arc<RemoteHeap>>,
    alloc_policy: AllocPolicy,
}

impl Drop for RemoteContext {
    fn drop(&mut self) {
        if let Err(err) = self.transport.close() {
            log::warn!("device: closing transport failed: {}", err);
        }
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// Compute device
pub struct Device {
    id: DeviceId,
    root: DeviceId,
    kind: DeviceKind,
    compute_units: u32,
    parent: Option<Arc<Device>>,
    partition: Option<PartitionRequest>,
    client_refs: AtomicU32,
    profile: Arc<DeviceProfile>,
    option_policy: OptionPolicy,
    dispatcher: Arc<dyn Dispatch>,
    remote: Option<Arc<RemoteContext>>,
    queue: Arc<EventQueue>,
    pool: WorkerPool,
}

impl Device {
    /// Bring up the host CPU device
    pub fn cpu(config: CpuDeviceConfig) -> ClResult<DeviceHandle> {
        let units = config
            .compute_units
            .unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, |n| n.get() as u32)
            })
            .max(1);
        let facts = sysinfo::probe();
        let name = config.name.unwrap_or(facts.model_name);
        let profile = DeviceProfile::cpu(&name, facts.mhz, facts.total_memory);

        let id = next_device_id();
        let dispatcher: Arc<dyn Dispatch> = Arc::new(CpuDispatcher::new(id));
        let device = Self::assemble(
            id,
            id,
            DeviceKind::Cpu,
            units,
            None,
            None,
            Arc::new(profile),
            config.option_policy,
            dispatcher,
            None,
        )?;

        log::info!("device {}: cpu '{}' with {} compute units", id.0, name, units);
        Ok(DeviceHandle::new(device))
    }

    /// Open, reset and boot an accelerator
    pub fn remote(config: RemoteDeviceConfig) -> ClResult<DeviceHandle> {
        let transport = config.transport.clone();
        transport.open()?;

        let booted = transport.reset_and_boot(&config.image).and_then(|entry| {
            let channel = MailboxChannel::open(config.mailbox.clone(), config.mailbox_config)?;
            Ok((entry, channel))
        });
        let (entry, channel) = match booted {
            Ok(booted) if booted.0.ready.count() > 0 => booted,
            Ok(_) => return Err(Self::abandon(&transport, HalError::BootTimeout)),
            Err(err) => return Err(Self::abandon(&transport, err)),
        };

        let units = entry.ready.count();
        let heap = Arc::new(RemoteHeap::new(config.heap));
        let ondemand = config.ondemand_heap.map(|c| Arc::new(RemoteHeap::new(c)));
        let global_mem = config.heap.size + config.ondemand_heap.map_or(0, |c| c.size);
        let profile = DeviceProfile::accelerator(&config.name, config.clock_mhz, global_mem);

        let id = next_device_id();
        let dispatcher: Arc<dyn Dispatch> = Arc::new(RemoteDispatcher::new(
            id,
            transport.clone(),
            channel,
            config.image.clone(),
            config.reply_timeout,
        ));
        let remote = Arc::new(RemoteContext {
            transport,
            heap,
            ondemand,
            alloc_policy: config.alloc_policy,
        });
        let device = Self::assemble(
            id,
            id,
            DeviceKind::Remote,
            units,
            None,
            None,
            Arc::new(profile),
            config.option_policy,
            dispatcher,
            Some(remote),
        )?;

        log::info!(
            "device {}: '{}' booted at {} with {} compute units",
            id.0,
            config.image.name(),
            entry.entry,
            units
        );
        Ok(DeviceHandle::new(device))
    }

    fn abandon(transport: &Arc<dyn TransportDriver>, err: HalError) -> ClError {
        log::error!("device: bring-up failed: {}", err);
        if let Err(close) = transport.close() {
            log::warn!("device: closing transport failed: {}", close);
        }
        ClError::DeviceLost(err)
    }

    fn assemble(
        id: DeviceId,
        root: DeviceId,
        kind: DeviceKind,
        compute_units: u32,
        parent: Option<Arc<Device>>,
        partition: Option<PartitionRequest>,
        profile: Arc<DeviceProfile>,
        option_policy: OptionPolicy,
        dispatcher: Arc<dyn Dispatch>,
        remote: Option<Arc<RemoteContext>>,
    ) -> ClResult<Arc<Self>> {
        let queue = Arc::new(EventQueue::new());
        let name = match kind {
            DeviceKind::Cpu => format!("clrt-cpu{}", id.0),
            DeviceKind::Remote => format!("clrt-remote{}", id.0),
        };
        let pool = WorkerPool::spawn(&name, compute_units as usize, queue.clone(), dispatcher.clone())?;

        Ok(Arc::new(Self {
            id,
            root,
            kind,
            compute_units,
            parent,
            partition,
            client_refs: AtomicU32::new(0),
            profile,
            option_policy,
            dispatcher,
            remote,
            queue,
            pool,
        }))
    }

    /// Identifier
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Identifier of the root of this device's partition tree
    pub fn root_id(&self) -> DeviceId {
        self.root
    }

    /// CPU or remote
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Compute units, equal to the number of agents
    pub fn compute_units(&self) -> u32 {
        self.compute_units
    }

    /// Parent device; `None` for roots
    pub fn parent(&self) -> Option<&Arc<Device>> {
        self.parent.as_ref()
    }

    /// Request this device was partitioned with; `None` for roots
    pub fn partition(&self) -> Option<&PartitionRequest> {
        self.partition.as_ref()
    }

    /// Whether this device is a root
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Static attributes
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Build-option policy for programs built for this device
    pub fn option_policy(&self) -> OptionPolicy {
        self.option_policy
    }

    /// Client references held through [`DeviceHandle`]
    pub fn reference_count(&self) -> u32 {
        self.client_refs.load(Ordering::Acquire)
    }

    /// Running agents
    pub fn agents(&self) -> usize {
        self.pool.agents()
    }

    /// Commands queued but not fully dequeued
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Whether any submitted command is still waiting for an agent
    pub fn has_enough_work(&self) -> bool {
        self.queue.pending() > 0
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a command.
    ///
    /// Never fails synchronously: a command the device cannot run comes back
    /// with its event already completed with the error. A command that was
    /// already submitted is not queued again; its event is returned as is.
    pub fn enqueue(&self, command: Arc<Command>) -> CompletionEvent {
        let event = command.event().clone();
        if event.status() != CommandStatus::Queued {
            log::warn!("device {}: {} {} resubmitted", self.id.0, command.name(), command.id().0);
            return event;
        }
        if let Err(err) = self.dispatcher.prepare(&command) {
            log::debug!("device {}: rejected {} ({})", self.id.0, command.name(), err);
            event.complete(Err(err));
            return event;
        }
        self.queue.push(command);
        event
    }

    /// Launch `kernel` over `geometry`, split across at most one slot per
    /// compute unit
    pub fn launch(&self, kernel: Arc<dyn KernelBinding>, geometry: LaunchGeometry) -> CompletionEvent {
        let slots = (self.compute_units as usize).min(geometry.group_count()).max(1);
        self.enqueue(Command::nd_range(kernel, geometry, slots))
    }

    /// Launch `kernel` as a single work-item
    pub fn task(&self, kernel: Arc<dyn KernelBinding>) -> CompletionEvent {
        self.enqueue(Command::task(kernel))
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Buffer usable by commands on this device.
    ///
    /// Remote buffers come from the device heap, falling back to the
    /// on-demand heap when one is configured.
    pub fn create_buffer(&self, size: usize) -> ClResult<Arc<Buffer>> {
        if size == 0 {
            return Err(ClError::InvalidValue);
        }
        let Some(remote) = &self.remote else {
            return Ok(Buffer::host(size));
        };
        match &remote.ondemand {
            Some(ondemand) => Buffer::on_device(size, &remote.heap, AllocPolicy::FailSoft)
                .or_else(|_| Buffer::on_device(size, ondemand, remote.alloc_policy)),
            None => Buffer::on_device(size, &remote.heap, remote.alloc_policy),
        }
    }

    /// Device heap, for remote devices
    pub fn remote_heap(&self) -> Option<&Arc<RemoteHeap>> {
        self.remote.as_ref().map(|r| &r.heap)
    }

    /// On-demand heap, when configured
    pub fn ondemand_heap(&self) -> Option<&Arc<RemoteHeap>> {
        self.remote.as_ref().and_then(|r| r.ondemand.as_ref())
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Attribute value
    pub fn info(&self, key: DeviceInfo) -> ClResult<PropertyValue> {
        let value = match key {
            DeviceInfo::MaxComputeUnits => PropertyValue::Uint(self.compute_units),
            DeviceInfo::ParentDevice => PropertyValue::Device(self.parent.as_ref().map(|p| p.id)),
            DeviceInfo::PartitionMaxSubDevices => {
                PropertyValue::Uint(if self.compute_units <= 1 { 0 } else { self.compute_units })
            },
            DeviceInfo::PartitionType => PropertyValue::Partition(
                self.partition
                    .as_ref()
                    .map(PartitionRequest::to_properties)
                    .unwrap_or_default(),
            ),
            DeviceInfo::ReferenceCount => PropertyValue::Uint(self.reference_count()),
            _ => self.profile.value(key).ok_or(ClError::InvalidValue)?,
        };
        Ok(value)
    }

    /// Copy an attribute into `buf`; returns its size.
    ///
    /// With no buffer only the size is returned. A short buffer fails with
    /// [`ClError::InvalidValue`] and is left untouched.
    pub fn query(&self, key: DeviceInfo, buf: Option<&mut [u8]>) -> ClResult<usize> {
        self.info(key)?.write_to(buf)
    }

    // =========================================================================
    // Partitioning
    // =========================================================================

    /// Sub-devices `request` would create
    pub fn sub_device_count(&self, request: &PartitionRequest) -> ClResult<u32> {
        Ok(request.plan(self.compute_units)?.count)
    }

    fn partition_from(parent: &Arc<Device>, request: &PartitionRequest) -> ClResult<Vec<DeviceHandle>> {
        let plan = request.plan(parent.compute_units)?;

        let mut children = Vec::with_capacity(plan.count as usize);
        for _ in 0..plan.count {
            let child = Self::assemble(
                next_device_id(),
                parent.root,
                parent.kind,
                plan.units_each,
                Some(parent.clone()),
                Some(request.clone()),
                parent.profile.clone(),
                parent.option_policy,
                parent.dispatcher.clone(),
                parent.remote.clone(),
            )?;
            children.push(DeviceHandle::new(child));
        }

        log::info!(
            "device {}: partitioned into {} sub-devices of {} compute units",
            parent.id.0,
            plan.count,
            plan.units_each
        );
        Ok(children)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.pool.shutdown_and_join();
        log::info!("device {}: shut down", self.id.0);
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("kind", &self.kind)
            .field("compute_units", &self.compute_units)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("partition", &self.partition)
            .field("client_refs", &self.reference_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CLIENT HANDLE
// =============================================================================

/// Client reference to a device
///
/// Cloning retains, dropping releases. The device itself lives as long as
/// any handle or sub-device refers to it.
#[derive(Debug)]
pub struct DeviceHandle {
    device: Arc<Device>,
}

impl DeviceHandle {
    fn new(device: Arc<Device>) -> Self {
        device.client_refs.fetch_add(1, Ordering::AcqRel);
        Self { device }
    }

    /// Shared device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Split this device; nothing is created when the request is invalid
    pub fn create_sub_devices(&self, request: &PartitionRequest) -> ClResult<Vec<DeviceHandle>> {
        Device::partition_from(&self.device, request)
    }

    /// Split this device into at most `capacity` sub-devices
    pub fn create_sub_devices_into(
        &self,
        request: &PartitionRequest,
        capacity: usize,
    ) -> ClResult<Vec<DeviceHandle>> {
        let needed = self.device.sub_device_count(request)?;
        if capacity < needed as usize {
            return Err(ClError::InvalidValue);
        }
        self.create_sub_devices(request)
    }
}

impl Clone for DeviceHandle {
    fn clone(&self) -> Self {
        Self::new(self.device.clone())
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.device.client_refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Deref for DeviceHandle {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use super::*;
    use crate::compiler::NativeCompiler;
    use crate::partition::PARTITION_EQUALLY;
    use crate::program::{Kernel, Program};
    use clrt_execution::MemObject;
    use clrt_hal::{DeviceAddr, ImageHandle, LoopbackMailbox, LoopbackTransport, MailboxMessage};
    use clrt_memory::HeapConfig;

    fn cpu(units: u32) -> DeviceHandle {
        Device::cpu(CpuDeviceConfig::with_compute_units(units)).unwrap()
    }

    fn remote() -> (Arc<LoopbackTransport>, DeviceHandle) {
        let transport = Arc::new(LoopbackTransport::new());
        let mailbox = Arc::new(LoopbackMailbox::with_responder(|msg| {
            MailboxMessage::from_words(msg.trans_id, &[0]).ok()
        }));
        let image = ImageHandle::new("kernels.out", DeviceAddr::new(0x8000_0000))
            .with_symbol("vadd", DeviceAddr::new(0x8000_0800));
        let mut config = RemoteDeviceConfig::new(
            transport.clone(),
            mailbox,
            image,
            HeapConfig::new(DeviceAddr::new(0x8100_0000), 1 << 20),
        );
        config.alloc_policy = AllocPolicy::FailSoft;
        config.reply_timeout = Duration::from_secs(5);
        let device = Device::remote(config).unwrap();
        (transport, device)
    }

    #[test]
    fn test_partition_arithmetic() {
        let parent = cpu(8);
        let subs = parent.create_sub_devices(&PartitionRequest::Equally(3)).unwrap();
        assert_eq!(subs.len(), 2);
        for sub in &subs {
            assert_eq!(sub.compute_units(), 3);
            assert_eq!(sub.agents(), 3);
            assert_eq!(sub.root_id(), parent.id());
            assert_eq!(sub.parent().map(|p| p.id()), Some(parent.id()));
        }

        assert_eq!(
            parent.create_sub_devices(&PartitionRequest::Equally(0)).unwrap_err(),
            ClError::InvalidValue
        );
        assert_eq!(
            parent.create_sub_devices(&PartitionRequest::Equally(9)).unwrap_err(),
            ClError::InvalidValue
        );
    }

    #[test]
    fn test_single_unit_rejects_every_request() {
        let device = cpu(1);
        for request in [
            PartitionRequest::Equally(1),
            PartitionRequest::ByCounts([1].into_iter().collect()),
            PartitionRequest::ByAffinityDomain(1),
        ] {
            assert_eq!(
                device.create_sub_devices(&request).unwrap_err(),
                ClError::DevicePartitionFailed
            );
        }
    }

    #[test]
    fn test_child_release_keeps_parent_count() {
        let parent = cpu(4);
        let extra = parent.clone();
        assert_eq!(parent.reference_count(), 2);
        drop(extra);
        assert_eq!(parent.reference_count(), 1);

        let mut subs = parent.create_sub_devices(&PartitionRequest::Equally(2)).unwrap();
        assert_eq!(parent.reference_count(), 1);
        assert_eq!(subs[0].reference_count(), 1);

        let child = subs.pop().unwrap();
        let child_clone = child.clone();
        assert_eq!(child.reference_count(), 2);
        drop(child_clone);
        drop(child);
        assert_eq!(parent.reference_count(), 1);
    }

    #[test]
    fn test_capacity_and_count_queries() {
        let parent = cpu(8);
        let request = PartitionRequest::Equally(2);
        assert_eq!(parent.sub_device_count(&request), Ok(4));
        assert_eq!(
            parent.create_sub_devices_into(&request, 3).unwrap_err(),
            ClError::InvalidValue
        );
        assert_eq!(parent.create_sub_devices_into(&request, 4).unwrap().len(), 4);
    }

    #[test]
    fn test_kernel_covers_every_group() {
        let device = cpu(4);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let compiler = NativeCompiler::new().with_kernel("count", move |range| {
            counter.fetch_add(range.group_ids().count(), Ordering::SeqCst);
            Ok(())
        });
        let program = Program::with_source("__kernel void count() {}");
        program.build(&device, &compiler, "").unwrap();
        let kernel = Kernel::new(&program, "count").unwrap();

        let geometry = LaunchGeometry::new(&[16, 6], &[2, 3]).unwrap();
        let event = device.launch(kernel.clone(), geometry);
        assert_eq!(event.wait(), Ok(()));
        assert_eq!(seen.load(Ordering::SeqCst), 16);

        assert_eq!(device.task(kernel).wait(), Ok(()));
        assert_eq!(seen.load(Ordering::SeqCst), 17);
    }

    #[test]
    fn test_has_enough_work_with_busy_agents() {
        let device = cpu(4);
        let started = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));
        let (s, r) = (started.clone(), release.clone());
        let compiler = NativeCompiler::new().with_kernel("hold", move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            Ok(())
        });
        let program = Program::with_source("__kernel void hold() {}");
        program.build(&device, &compiler, "").unwrap();
        let kernel = Kernel::new(&program, "hold").unwrap();

        let busy = device.launch(kernel, LaunchGeometry::new(&[4], &[1]).unwrap());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(started.load(Ordering::SeqCst), 4);
        assert_eq!(device.pending(), 0);
        assert!(!device.has_enough_work());

        let marker = device.enqueue(Command::marker());
        assert_eq!(device.pending(), 1);
        assert!(device.has_enough_work());

        release.store(true, Ordering::SeqCst);
        assert_eq!(busy.wait(), Ok(()));
        assert_eq!(marker.wait(), Ok(()));
        assert!(!device.has_enough_work());
    }

    #[test]
    fn test_resubmitted_command_not_requeued() {
        let device = cpu(2);
        let compiler = NativeCompiler::new().with_kernel("noop", |_| Ok(()));
        let program = Program::with_source("__kernel void noop() {}");
        program.build(&device, &compiler, "").unwrap();
        let kernel = Kernel::new(&program, "noop").unwrap();

        let task = Command::task(kernel);
        assert_eq!(device.enqueue(task.clone()).wait(), Ok(()));

        let again = device.enqueue(task);
        assert_eq!(again.status(), CommandStatus::Complete);
        assert_eq!(device.pending(), 0);

        let marker = device.enqueue(Command::marker());
        assert_eq!(marker.wait_timeout(Duration::from_secs(5)), Some(Ok(())));
    }

    #[test]
    fn test_sub_device_uses_root_build() {
        let parent = cpu(4);
        let compiler = NativeCompiler::new().with_kernel("noop", |_| Ok(()));
        let program = Program::with_source("__kernel void noop() {}");
        program.build(&parent, &compiler, "").unwrap();
        let kernel = Kernel::new(&program, "noop").unwrap();

        let subs = parent.create_sub_devices(&PartitionRequest::Equally(2)).unwrap();
        assert_eq!(subs[1].task(kernel).wait(), Ok(()));
    }

    #[test]
    fn test_unbuilt_program_completes_with_error() {
        let device = cpu(2);
        let program = Program::with_source("__kernel void k() {}");
        let kernel = Kernel::new(&program, "k").unwrap();
        let event = device.launch(kernel, LaunchGeometry::task());
        assert_eq!(event.status(), CommandStatus::Failed(ClError::InvalidProgramExecutable));
        assert_eq!(event.wait(), Err(ClError::InvalidProgramExecutable));
    }

    #[test]
    fn test_query_sizes() {
        let device = cpu(2);
        let name_len = device.query(DeviceInfo::Name, None).unwrap();
        assert_eq!(name_len, device.profile().name.len() + 1);

        let mut short = vec![0u8; name_len - 1];
        assert_eq!(device.query(DeviceInfo::Name, Some(&mut short[..])), Err(ClError::InvalidValue));
        assert!(short.iter().all(|&b| b == 0));

        let mut units = [0u8; 4];
        assert_eq!(device.query(DeviceInfo::MaxComputeUnits, Some(&mut units[..])), Ok(4));
        assert_eq!(u32::from_ne_bytes(units), 2);
        assert_eq!(device.query(DeviceInfo::PartitionType, None), Ok(0));
        assert_eq!(device.info(DeviceInfo::ParentDevice), Ok(PropertyValue::Device(None)));
    }

    #[test]
    fn test_partition_properties() {
        let parent = cpu(4);
        assert_eq!(parent.info(DeviceInfo::PartitionMaxSubDevices), Ok(PropertyValue::Uint(4)));
        let subs = parent.create_sub_devices(&PartitionRequest::Equally(2)).unwrap();
        match subs[0].info(DeviceInfo::PartitionType).unwrap() {
            PropertyValue::Partition(props) => assert_eq!(props.as_slice(), &[PARTITION_EQUALLY, 2, 0]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            subs[0].info(DeviceInfo::ParentDevice),
            Ok(PropertyValue::Device(Some(parent.id())))
        );
        assert_eq!(cpu(1).info(DeviceInfo::PartitionMaxSubDevices), Ok(PropertyValue::Uint(0)));
    }

    #[test]
    fn test_remote_bring_up() {
        let (transport, device) = remote();
        assert_eq!(device.kind(), DeviceKind::Remote);
        assert_eq!(device.compute_units(), 8);
        assert!(transport.booted().is_some());
        assert_eq!(device.remote_heap().unwrap().stats().free, 1 << 20);

        drop(device);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_remote_boot_failure() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.stall_boot(true);
        let config = RemoteDeviceConfig::new(
            transport.clone(),
            Arc::new(LoopbackMailbox::new()),
            ImageHandle::new("kernels.out", DeviceAddr::new(0x8000_0000)),
            HeapConfig::new(DeviceAddr::new(0x8100_0000), 1 << 20),
        );
        assert_eq!(
            Device::remote(config).unwrap_err(),
            ClError::DeviceLost(HalError::BootTimeout)
        );
        assert!(!transport.is_open());
    }

    #[test]
    fn test_remote_map_unmap() {
        let (transport, device) = remote();
        let buffer = device.create_buffer(256).unwrap();
        let addr = buffer.device_addr().unwrap();
        transport.write(addr, &[5u8; 16]).unwrap();

        let map = Command::map_buffer(buffer.clone(), 0, 16);
        assert_eq!(device.enqueue(map.clone()).wait(), Ok(()));
        let region = map.mapped_region().unwrap();
        buffer.with_host(|host| {
            assert_eq!(&host[..16], &[5u8; 16]);
            host[..16].fill(6);
        });

        let unmap = Command::unmap(MemObject::Buffer(buffer), region);
        assert_eq!(device.enqueue(unmap).wait(), Ok(()));
        let mut back = [0u8; 16];
        transport.read(addr, &mut back).unwrap();
        assert_eq!(back, [6u8; 16]);
    }

    #[test]
    fn test_remote_kernel() {
        let (_transport, device) = remote();
        let compiler = NativeCompiler::new().with_kernel("vadd", |_| Ok(()));
        let program = Program::with_source("__kernel void vadd() {}");
        program.build(&device, &compiler, "").unwrap();
        let kernel = Kernel::new(&program, "vadd").unwrap();

        let geometry = LaunchGeometry::new(&[64], &[4]).unwrap();
        assert_eq!(device.launch(kernel, geometry).wait(), Ok(()));
    }

    #[test]
    fn test_remote_fault_is_device_lost() {
        let (transport, device) = remote();
        let buffer = device.create_buffer(64).unwrap();
        transport.inject_fault(HalError::LinkDown);

        let event = device.enqueue(Command::map_buffer(buffer.clone(), 0, 64));
        assert_eq!(event.wait(), Err(ClError::DeviceLost(HalError::LinkDown)));

        let later = device.enqueue(Command::read_buffer(buffer, 0, 8));
        assert_eq!(later.wait(), Err(ClError::DeviceLost(HalError::LinkDown)));
    }

    #[test]
    fn test_remote_heap_exhaustion() {
        let (_transport, device) = remote();
        assert_eq!(
            device.create_buffer(2 << 20).unwrap_err(),
            ClError::MemObjectAllocationFailure
        );
        assert_eq!(device.create_buffer(0).unwrap_err(), ClError::InvalidValue);
    }
}
