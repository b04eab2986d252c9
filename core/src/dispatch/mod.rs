//! # Dispatchers
//!
//! Device-specific implementations of [`clrt_execution::Dispatch`]. A dispatcher is shared
//! by a root device and every sub-device partitioned from it.
//!
//! - [`CpuDispatcher`]: kernels run on the agent thread through a host
//!   [`clrt_execution::Executable`]; memory commands touch host storage
//! - [`RemoteDispatcher`]: kernels are posted to the accelerator over a
//!   mailbox; memory commands move bytes through the transport

pub mod cpu;
pub mod remote;

pub use cpu::CpuDispatcher;
pub use remote::RemoteDispatcher;

use clrt_execution::{ClResult, Command, CommandKind, MapImage, MappedRegion};

/// Range checks shared by every dispatcher's `prepare`
pub(crate) fn validate(command: &Command) -> ClResult<()> {
    match command.kind() {
        CommandKind::NdRangeKernel(launch) | CommandKind::TaskKernel(launch) => {
            launch.geometry().validate()
        },
        CommandKind::MapBuffer(map) => map.buffer.check_range(map.offset, map.len),
        CommandKind::MapImage(map) => map.image.region_span(map.origin, map.region).map(|_| ()),
        CommandKind::UnmapMemObject(unmap) => unmap
            .target
            .buffer()
            .check_range(unmap.mapping.offset, unmap.mapping.len),
        CommandKind::ReadBuffer(read) => read.buffer.check_range(read.offset, read.len),
        CommandKind::WriteBuffer(write) => write.buffer.check_range(write.offset, write.bytes.len()),
        CommandKind::Marker => Ok(()),
    }
}

/// Host window exposed by an image map
pub(crate) fn image_mapping(map: &MapImage) -> ClResult<MappedRegion> {
    let (offset, len) = map.image.region_span(map.origin, map.region)?;
    let depth = map.image.dimensions()[2];
    Ok(MappedRegion {
        offset,
        len,
        row_pitch: map.image.row_pitch(),
        slice_pitch: if depth > 1 { map.image.slice_pitch() } else { 0 },
    })
}

/// Buffer mappings carry no pitches
pub(crate) fn buffer_mapping(offset: usize, len: usize) -> MappedRegion {
    MappedRegion {
        offset,
        len,
        row_pitch: 0,
        slice_pitch: 0,
    }
}

/// Release hook shared by both dispatchers
pub(crate) fn detach(command: &Command) {
    if let Some(launch) = command.launch() {
        launch.detach();
    }
}
