//! # Memory Objects
//!
//! Buffers and images referenced by commands. Every buffer has host-visible
//! storage. A buffer placed on a remote device additionally owns a region of
//! that device's heap; the host storage then acts as the mapping shadow that
//! map commands fill and unmap commands flush.

use std::sync::Arc;

use clrt_hal::DeviceAddr;
use clrt_memory::{AllocPolicy, RemoteHeap};
use spin::Mutex;

use crate::error::{ClError, ClResult};

// =============================================================================
// DEVICE REGION
// =============================================================================

/// Heap region owned by a buffer; released on drop
#[derive(Debug)]
pub struct DeviceRegion {
    addr: DeviceAddr,
    heap: Arc<RemoteHeap>,
}

impl DeviceRegion {
    /// Allocate `size` bytes from `heap`
    pub fn allocate(heap: &Arc<RemoteHeap>, size: u64, policy: AllocPolicy) -> ClResult<Self> {
        let addr = heap.allocate_with(size, policy)?;
        Ok(Self {
            addr,
            heap: heap.clone(),
        })
    }

    /// Start of the region
    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }
}

impl Drop for DeviceRegion {
    fn drop(&mut self) {
        if let Err(err) = self.heap.release(self.addr) {
            log::warn!("memobj: releasing {} failed: {}", self.addr, err);
        }
    }
}

// =============================================================================
// BUFFER
// =============================================================================

/// Linear memory object
#[derive(Debug)]
pub struct Buffer {
    size: usize,
    host: Mutex<Vec<u8>>,
    region: Option<DeviceRegion>,
}

impl Buffer {
    /// Buffer living in host memory
    pub fn host(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            host: Mutex::new(vec![0u8; size]),
            region: None,
        })
    }

    /// Host buffer initialised from `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            size: bytes.len(),
            host: Mutex::new(bytes.to_vec()),
            region: None,
        })
    }

    /// Buffer backed by a region of a remote heap
    pub fn on_device(
        size: usize,
        heap: &Arc<RemoteHeap>,
        policy: AllocPolicy,
    ) -> ClResult<Arc<Self>> {
        if size == 0 {
            return Err(ClError::InvalidValue);
        }
        let region = DeviceRegion::allocate(heap, size as u64, policy)?;
        Ok(Arc::new(Self {
            size,
            host: Mutex::new(vec![0u8; size]),
            region: Some(region),
        }))
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Device address, for buffers on a remote heap
    pub fn device_addr(&self) -> Option<DeviceAddr> {
        self.region.as_ref().map(DeviceRegion::addr)
    }

    /// Check that `[offset, offset + len)` lies inside the buffer
    pub fn check_range(&self, offset: usize, len: usize) -> ClResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ClError::InvalidValue),
        }
    }

    /// Copy out of host storage
    pub fn read_host(&self, offset: usize, out: &mut [u8]) -> ClResult<()> {
        self.check_range(offset, out.len())?;
        out.copy_from_slice(&self.host.lock()[offset..offset + out.len()]);
        Ok(())
    }

    /// Copy into host storage
    pub fn write_host(&self, offset: usize, bytes: &[u8]) -> ClResult<()> {
        self.check_range(offset, bytes.len())?;
        self.host.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Run `f` over the whole host storage
    pub fn with_host<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.host.lock())
    }
}

// =============================================================================
// IMAGE
// =============================================================================

/// Two- or three-dimensional image over a backing buffer
#[derive(Debug)]
pub struct Image2D {
    buffer: Arc<Buffer>,
    width: usize,
    height: usize,
    depth: usize,
    pixel_size: usize,
    row_pitch: usize,
    slice_pitch: usize,
}

impl Image2D {
    /// Tightly packed image in host memory
    pub fn host(width: usize, height: usize, pixel_size: usize) -> ClResult<Arc<Self>> {
        Self::host_3d(width, height, 1, pixel_size)
    }

    /// Tightly packed image with `depth` slices in host memory
    pub fn host_3d(
        width: usize,
        height: usize,
        depth: usize,
        pixel_size: usize,
    ) -> ClResult<Arc<Self>> {
        let (row_pitch, slice_pitch, total) = Self::pitches(width, height, depth, pixel_size)?;
        Ok(Arc::new(Self {
            buffer: Buffer::host(total),
            width,
            height,
            depth,
            pixel_size,
            row_pitch,
            slice_pitch,
        }))
    }

    /// Image over an existing buffer, which must be large enough
    pub fn over(
        buffer: Arc<Buffer>,
        width: usize,
        height: usize,
        depth: usize,
        pixel_size: usize,
    ) -> ClResult<Arc<Self>> {
        let (row_pitch, slice_pitch, total) = Self::pitches(width, height, depth, pixel_size)?;
        if buffer.size() < total {
            return Err(ClError::InvalidMemObject);
        }
        Ok(Arc::new(Self {
            buffer,
            width,
            height,
            depth,
            pixel_size,
            row_pitch,
            slice_pitch,
        }))
    }

    fn pitches(
        width: usize,
        height: usize,
        depth: usize,
        pixel_size: usize,
    ) -> ClResult<(usize, usize, usize)> {
        if width == 0 || height == 0 || depth == 0 || pixel_size == 0 {
            return Err(ClError::InvalidValue);
        }
        let row_pitch = width.checked_mul(pixel_size).ok_or(ClError::InvalidValue)?;
        let slice_pitch = row_pitch.checked_mul(height).ok_or(ClError::InvalidValue)?;
        let total = slice_pitch.checked_mul(depth).ok_or(ClError::InvalidValue)?;
        Ok((row_pitch, slice_pitch, total))
    }

    /// Backing buffer
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Width, height, depth in pixels
    pub fn dimensions(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    /// Bytes per pixel
    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    /// Bytes per row
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    /// Bytes per slice
    pub fn slice_pitch(&self) -> usize {
        self.slice_pitch
    }

    /// Byte offset of pixel `origin`
    pub fn origin_offset(&self, origin: [usize; 3]) -> usize {
        origin[2] * self.slice_pitch + origin[1] * self.row_pitch + origin[0] * self.pixel_size
    }

    /// Byte range `(offset, len)` covering `region` starting at `origin`
    pub fn region_span(&self, origin: [usize; 3], region: [usize; 3]) -> ClResult<(usize, usize)> {
        let dims = self.dimensions();
        for axis in 0..3 {
            if region[axis] == 0 || origin[axis] + region[axis] > dims[axis] {
                return Err(ClError::InvalidValue);
            }
        }
        let start = self.origin_offset(origin);
        let last = [
            origin[0] + region[0] - 1,
            origin[1] + region[1] - 1,
            origin[2] + region[2] - 1,
        ];
        let end = self.origin_offset(last) + self.pixel_size;
        Ok((start, end - start))
    }
}

// =============================================================================
// MAPPINGS
// =============================================================================

/// Either kind of memory object
#[derive(Debug, Clone)]
pub enum MemObject {
    /// Linear buffer
    Buffer(Arc<Buffer>),
    /// Image
    Image(Arc<Image2D>),
}

impl MemObject {
    /// Storage behind the object
    pub fn buffer(&self) -> &Arc<Buffer> {
        match self {
            MemObject::Buffer(buffer) => buffer,
            MemObject::Image(image) => image.buffer(),
        }
    }
}

/// Window of host storage exposed by a map command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// Byte offset into the buffer's host storage
    pub offset: usize,
    /// Bytes covered
    pub len: usize,
    /// Row pitch; zero for buffers
    pub row_pitch: usize,
    /// Slice pitch; zero for buffers and single-slice images
    pub slice_pitch: usize,
}
