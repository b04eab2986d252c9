//! Host CPU dispatch.

use clrt_execution::{
    ClError, ClResult, Command, CommandKind, DeviceId, Dispatch, LaunchState, SlotIndex,
};

use super::{buffer_mapping, detach, image_mapping, validate};

/// Runs kernels on agent threads and serves memory commands from host storage
#[derive(Debug)]
pub struct CpuDispatcher {
    root: DeviceId,
}

impl CpuDispatcher {
    /// Dispatcher for the partition tree rooted at `root`
    pub fn new(root: DeviceId) -> Self {
        Self { root }
    }
}

impl Dispatch for CpuDispatcher {
    fn prepare(&self, command: &Command) -> ClResult<()> {
        validate(command)?;
        if let Some(launch) = command.launch() {
            let executable = launch
                .kernel()
                .executable_for(self.root)
                .ok_or(ClError::InvalidProgramExecutable)?;
            launch.attach(LaunchState::Host(executable));
        }
        Ok(())
    }

    fn execute(&self, command: &Command, slot: Option<SlotIndex>) -> ClResult<()> {
        match command.kind() {
            CommandKind::NdRangeKernel(launch) | CommandKind::TaskKernel(launch) => {
                let Some(LaunchState::Host(executable)) = launch.state() else {
                    return Err(ClError::InvalidProgramExecutable);
                };
                let range = launch
                    .geometry()
                    .slot_range(slot.unwrap_or(0), launch.slots().total());
                if range.is_empty() {
                    return Ok(());
                }
                log::trace!(
                    "cpu: {} groups {}..{} of '{}'",
                    command.name(),
                    range.first,
                    range.first + range.count,
                    launch.kernel().name()
                );
                executable
                    .run(launch.kernel().name(), &range)
                    .map_err(|fault| ClError::KernelFault(fault.0))
            },
            CommandKind::MapBuffer(map) => {
                // Host storage is the buffer; nothing to copy.
                let _ = map.mapped.set(buffer_mapping(map.offset, map.len));
                Ok(())
            },
            CommandKind::MapImage(map) => {
                let _ = map.mapped.set(image_mapping(map)?);
                Ok(())
            },
            CommandKind::UnmapMemObject(_) | CommandKind::Marker => Ok(()),
            CommandKind::ReadBuffer(read) => {
                let mut data = vec![0u8; read.len];
                read.buffer.read_host(read.offset, &mut data)?;
                *read.data.lock() = data;
                Ok(())
            },
            CommandKind::WriteBuffer(write) => write.buffer.write_host(write.offset, &write.bytes),
        }
    }

    fn release(&self, command: &Command) {
        detach(command);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use clrt_execution::{Buffer, ExecFault, Executable, Image2D, KernelBinding, LaunchGeometry, WorkGroupRange};

    struct Fails;

    impl Executable for Fails {
        fn run(&self, _kernel: &str, _range: &WorkGroupRange) -> Result<(), ExecFault> {
            Err(ExecFault("bad access"))
        }
    }

    struct Binding(Option<Arc<dyn Executable>>);

    impl KernelBinding for Binding {
        fn name(&self) -> &str {
            "k"
        }

        fn executable_for(&self, root: DeviceId) -> Option<Arc<dyn Executable>> {
            self.0.clone().filter(|_| root == DeviceId(1))
        }
    }

    #[test]
    fn test_unbuilt_kernel_rejected() {
        let dispatcher = CpuDispatcher::new(DeviceId(1));
        let command = Command::task(Arc::new(Binding(None)));
        assert_eq!(dispatcher.prepare(&command), Err(ClError::InvalidProgramExecutable));

        let other = CpuDispatcher::new(DeviceId(2));
        let command = Command::task(Arc::new(Binding(Some(Arc::new(Fails)))));
        assert_eq!(other.prepare(&command), Err(ClError::InvalidProgramExecutable));
    }

    #[test]
    fn test_kernel_fault() {
        let dispatcher = CpuDispatcher::new(DeviceId(1));
        let geometry = LaunchGeometry::new(&[4], &[1]).unwrap();
        let command = Command::nd_range(Arc::new(Binding(Some(Arc::new(Fails)))), geometry, 2);
        dispatcher.prepare(&command).unwrap();
        assert_eq!(dispatcher.execute(&command, Some(0)), Err(ClError::KernelFault("bad access")));
        dispatcher.release(&command);
        assert!(command.launch().unwrap().state().is_none());
    }

    #[test]
    fn test_read_write_map() {
        let dispatcher = CpuDispatcher::new(DeviceId(1));
        let buffer = Buffer::host(8);

        let write = Command::write_buffer(buffer.clone(), 2, vec![7, 8, 9]);
        dispatcher.prepare(&write).unwrap();
        dispatcher.execute(&write, None).unwrap();

        let read = Command::read_buffer(buffer.clone(), 0, 6);
        dispatcher.execute(&read, None).unwrap();
        assert_eq!(read.take_read_data().unwrap(), vec![0, 0, 7, 8, 9, 0]);

        let map = Command::map_buffer(buffer.clone(), 4, 4);
        dispatcher.execute(&map, None).unwrap();
        assert_eq!(map.mapped_region().unwrap().offset, 4);

        let oob = Command::read_buffer(buffer, 6, 4);
        assert_eq!(dispatcher.prepare(&oob), Err(ClError::InvalidValue));
    }

    #[test]
    fn test_image_map_pitches() {
        let dispatcher = CpuDispatcher::new(DeviceId(1));
        let image = Image2D::host(4, 4, 4).unwrap();
        let map = Command::map_image(image, [1, 1, 0], [2, 2, 1]);
        dispatcher.prepare(&map).unwrap();
        dispatcher.execute(&map, None).unwrap();
        let region = map.mapped_region().unwrap();
        assert_eq!(region.offset, 16 + 4);
        assert_eq!(region.row_pitch, 16);
        assert_eq!(region.slice_pitch, 0);
    }
}
