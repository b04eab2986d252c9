//! # Remote Heap
//!
//! First-fit allocator for a range of device memory the host cannot
//! dereference. The host keeps all bookkeeping; the device never sees it.
//!
//! ```text
//!  base                                                   base + size
//!   │                                                          │
//!   ▼                                                          ▼
//!  ┌────────┬──────────────┬────────┬───────────────────────────┐
//!  │ alloc  │     free     │ alloc  │           free            │
//!  └────────┴──────────────┴────────┴───────────────────────────┘
//! ```
//!
//! The free and allocated maps are keyed by start address and together
//! partition the managed range. Released blocks merge with any neighbour
//! that touches them, so two free regions are never adjacent.

use std::collections::BTreeMap;

use clrt_hal::DeviceAddr;
use spin::Mutex;

use crate::{MemError, MemResult};

/// Granularity of the standard heap
pub const MIN_BLOCK_SIZE: u64 = 128;

/// Granularity of the on-demand (page-mapped) heap
pub const MIN_ONDEMAND_BLOCK_SIZE: u64 = 4096;

static_assertions::const_assert!(MIN_BLOCK_SIZE.is_power_of_two());
static_assertions::const_assert!(MIN_ONDEMAND_BLOCK_SIZE.is_power_of_two());

type BlockMap = BTreeMap<DeviceAddr, u64>;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Allocation granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapMode {
    /// 128-byte blocks
    #[default]
    Standard,
    /// 4 KiB blocks, for memory mapped into the host on demand
    OnDemand,
}

impl HeapMode {
    /// Rounding unit of this mode
    pub const fn granularity(self) -> u64 {
        match self {
            HeapMode::Standard => MIN_BLOCK_SIZE,
            HeapMode::OnDemand => MIN_ONDEMAND_BLOCK_SIZE,
        }
    }
}

/// What to do when no free block is large enough
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// Log and abort the process
    #[default]
    Abort,
    /// Return [`MemError::OutOfDeviceMemory`]
    FailSoft,
}

/// Remote heap configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// First managed address
    pub base: DeviceAddr,
    /// Managed length in bytes
    pub size: u64,
    /// Granularity
    pub mode: HeapMode,
}

impl HeapConfig {
    /// Standard heap over `[base, base + size)`
    pub const fn new(base: DeviceAddr, size: u64) -> Self {
        Self {
            base,
            size,
            mode: HeapMode::Standard,
        }
    }

    /// On-demand heap over `[base, base + size)`
    pub const fn on_demand(base: DeviceAddr, size: u64) -> Self {
        Self {
            base,
            size,
            mode: HeapMode::OnDemand,
        }
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Largest free block report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Start of the block, or the heap base when `size` is zero
    pub addr: DeviceAddr,
    /// Block length; zero when no block holds a whole granule
    pub size: u64,
    /// Heap granularity
    pub granularity: u64,
}

/// Heap usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Managed bytes
    pub total: u64,
    /// Bytes in free regions
    pub free: u64,
    /// Bytes handed out
    pub allocated: u64,
    /// Number of free regions
    pub free_regions: usize,
    /// Number of live allocations
    pub allocations: usize,
}

impl HeapStats {
    /// Usage percentage
    pub fn usage_percent(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.allocated as f32 / self.total as f32) * 100.0
        }
    }
}

// =============================================================================
// REMOTE HEAP
// =============================================================================

#[derive(Debug, Default)]
struct HeapMaps {
    free: BlockMap,
    allocated: BlockMap,
}

/// Device memory heap
#[derive(Debug)]
pub struct RemoteHeap {
    base: DeviceAddr,
    size: u64,
    granularity: u64,
    maps: Mutex<HeapMaps>,
}

impl RemoteHeap {
    /// Create a heap whose whole range starts out free
    pub fn new(config: HeapConfig) -> Self {
        let heap = Self {
            base: config.base,
            size: config.size,
            granularity: config.mode.granularity(),
            maps: Mutex::new(HeapMaps::default()),
        };
        heap.seed();
        log::debug!(
            "heap: managing [{}, {}) in {}-byte blocks",
            heap.base,
            heap.base.offset(heap.size),
            heap.granularity
        );
        heap
    }

    /// Re-describe the managed range.
    ///
    /// The free map is only seeded while the heap holds no regions at all, so
    /// a heap that already has regions keeps them.
    pub fn configure(&mut self, config: HeapConfig) {
        self.base = config.base;
        self.size = config.size;
        self.granularity = config.mode.granularity();
        self.seed();
    }

    fn seed(&self) {
        let mut maps = self.maps.lock();
        if maps.free.is_empty() && maps.allocated.is_empty() && self.size > 0 {
            maps.free.insert(self.base, self.size);
        }
    }

    /// First managed address
    pub fn base(&self) -> DeviceAddr {
        self.base
    }

    /// Managed length
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Rounding unit
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Round `size` up to the granularity; zero-byte requests take one block
    fn round(&self, size: u64) -> Option<u64> {
        let size = size.max(1);
        let mask = self.granularity - 1;
        size.checked_add(mask).map(|s| s & !mask)
    }

    /// Allocate, returning an error when no free block fits
    pub fn try_allocate(&self, size: u64) -> MemResult<DeviceAddr> {
        let Some(rounded) = self.round(size) else {
            return Err(MemError::OutOfDeviceMemory {
                requested: size,
                largest_free: self.largest_free_block().size,
            });
        };

        let mut maps = self.maps.lock();
        let found = maps
            .free
            .iter()
            .find(|&(_, &len)| len >= rounded)
            .map(|(&addr, &len)| (addr, len));

        match found {
            Some((addr, len)) => {
                maps.free.remove(&addr);
                if len > rounded {
                    maps.free.insert(addr.offset(rounded), len - rounded);
                }
                maps.allocated.insert(addr, rounded);
                log::trace!("heap: allocated {} bytes at {}", rounded, addr);
                Ok(addr)
            },
            None => {
                let largest_free = maps.free.values().copied().max().unwrap_or(0);
                Err(MemError::OutOfDeviceMemory {
                    requested: rounded,
                    largest_free,
                })
            },
        }
    }

    /// Allocate; exhaustion is fatal
    pub fn allocate(&self, size: u64) -> DeviceAddr {
        match self.try_allocate(size) {
            Ok(addr) => addr,
            Err(err) => {
                log::error!(
                    "heap: allocation of 0x{:x} bytes from range ({}, {}) failed: {}",
                    size,
                    self.base,
                    self.base.offset(self.size.saturating_sub(1)),
                    err
                );
                std::process::abort();
            },
        }
    }

    /// Allocate under an explicit exhaustion policy
    pub fn allocate_with(&self, size: u64, policy: AllocPolicy) -> MemResult<DeviceAddr> {
        match policy {
            AllocPolicy::Abort => Ok(self.allocate(size)),
            AllocPolicy::FailSoft => self.try_allocate(size),
        }
    }

    /// Return a block to the free map, merging it with touching neighbours.
    ///
    /// Returns the block's rounded length.
    pub fn release(&self, addr: DeviceAddr) -> MemResult<u64> {
        let mut maps = self.maps.lock();
        let len = maps.allocated.remove(&addr).ok_or(MemError::NotAllocated(addr))?;

        let mut start = addr;
        let mut merged = len;

        // Region ending exactly where this block starts
        let before = maps
            .free
            .range(..addr)
            .next_back()
            .map(|(&a, &l)| (a, l))
            .filter(|&(a, l)| a.offset(l) == addr);
        if let Some((prev, prev_len)) = before {
            maps.free.remove(&prev);
            start = prev;
            merged += prev_len;
        }

        // Region starting exactly where this block ends
        if let Some(next_len) = maps.free.remove(&addr.offset(len)) {
            merged += next_len;
        }

        maps.free.insert(start, merged);
        log::trace!("heap: released {} bytes at {} (free region {} +{})", len, addr, start, merged);
        Ok(len)
    }

    /// Largest free block holding at least one granule
    pub fn largest_free_block(&self) -> FreeBlock {
        let none = FreeBlock {
            addr: self.base,
            size: 0,
            granularity: self.granularity,
        };
        if self.size < self.granularity {
            return none;
        }

        let maps = self.maps.lock();
        maps.free
            .iter()
            .filter(|&(_, &len)| len >= self.granularity)
            .fold(none, |best, (&addr, &len)| {
                if len >= best.size {
                    FreeBlock {
                        addr,
                        size: len,
                        granularity: self.granularity,
                    }
                } else {
                    best
                }
            })
    }

    /// Rounded length of a live allocation
    pub fn allocation_size(&self, addr: DeviceAddr) -> Option<u64> {
        self.maps.lock().allocated.get(&addr).copied()
    }

    /// Whether `addr` starts a live allocation
    pub fn is_allocated(&self, addr: DeviceAddr) -> bool {
        self.maps.lock().allocated.contains_key(&addr)
    }

    /// Free regions in address order
    pub fn free_regions(&self) -> Vec<(DeviceAddr, u64)> {
        self.maps.lock().free.iter().map(|(&a, &l)| (a, l)).collect()
    }

    /// Live allocations in address order
    pub fn allocations(&self) -> Vec<(DeviceAddr, u64)> {
        self.maps.lock().allocated.iter().map(|(&a, &l)| (a, l)).collect()
    }

    /// Usage snapshot
    pub fn stats(&self) -> HeapStats {
        let maps = self.maps.lock();
        HeapStats {
            total: self.size,
            free: maps.free.values().sum(),
            allocated: maps.allocated.values().sum(),
            free_regions: maps.free.len(),
            allocations: maps.allocated.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: DeviceAddr = DeviceAddr::new(0x8000_0000);

    fn heap(size: u64) -> RemoteHeap {
        RemoteHeap::new(HeapConfig::new(BASE, size))
    }

    fn assert_partitioned(heap: &RemoteHeap) {
        let mut regions: Vec<_> = heap.free_regions();
        regions.extend(heap.allocations());
        regions.sort();
        let mut cursor = heap.base();
        for (addr, len) in regions {
            assert_eq!(addr, cursor, "gap or overlap at {}", addr);
            cursor = addr.offset(len);
        }
        assert_eq!(cursor, heap.base().offset(heap.size()));
    }

    #[test]
    fn test_round_up() {
        let heap = heap(1 << 20);
        let a = heap.try_allocate(1).unwrap();
        assert_eq!(heap.allocation_size(a), Some(128));
        let b = heap.try_allocate(129).unwrap();
        assert_eq!(heap.allocation_size(b), Some(256));
        assert_eq!(b, BASE.offset(128));

        let ondemand = RemoteHeap::new(HeapConfig::on_demand(BASE, 1 << 20));
        let c = ondemand.try_allocate(100).unwrap();
        assert_eq!(ondemand.allocation_size(c), Some(4096));
    }

    #[test]
    fn test_first_fit() {
        let heap = heap(4096);
        let a = heap.try_allocate(1024).unwrap();
        let _b = heap.try_allocate(1024).unwrap();
        heap.release(a).unwrap();

        // The hole at the front is found before the tail
        let c = heap.try_allocate(512).unwrap();
        assert_eq!(c, BASE);
        assert_partitioned(&heap);
    }

    #[test]
    fn test_round_trip_restores_single_region() {
        let heap = heap(64 * 1024);
        let blocks: Vec<_> = [100u64, 4096, 300, 8000, 128]
            .iter()
            .map(|&s| heap.try_allocate(s).unwrap())
            .collect();
        assert_partitioned(&heap);

        for &addr in blocks.iter().rev().step_by(2) {
            heap.release(addr).unwrap();
        }
        for &addr in blocks.iter().skip(1).step_by(2) {
            heap.release(addr).unwrap();
        }
        assert_eq!(heap.free_regions(), vec![(BASE, 64 * 1024)]);
        assert!(heap.allocations().is_empty());
    }

    #[test]
    fn test_coalesce_either_order() {
        for reverse in [false, true] {
            let heap = heap(12288);
            let a = heap.try_allocate(4096).unwrap();
            let b = heap.try_allocate(8192).unwrap();
            assert!(heap.free_regions().is_empty());

            if reverse {
                heap.release(b).unwrap();
                heap.release(a).unwrap();
            } else {
                heap.release(a).unwrap();
                heap.release(b).unwrap();
            }
            assert_eq!(heap.free_regions(), vec![(BASE, 12288)]);
        }
    }

    #[test]
    fn test_middle_release_merges_both_sides() {
        let heap = heap(3 * 1024);
        let a = heap.try_allocate(1024).unwrap();
        let b = heap.try_allocate(1024).unwrap();
        let c = heap.try_allocate(1024).unwrap();
        heap.release(a).unwrap();
        heap.release(c).unwrap();
        assert_eq!(heap.stats().free_regions, 2);

        heap.release(b).unwrap();
        assert_eq!(heap.free_regions(), vec![(BASE, 3 * 1024)]);
    }

    #[test]
    fn test_release_unknown() {
        let heap = heap(4096);
        let a = heap.try_allocate(128).unwrap();
        assert_eq!(heap.release(a.offset(128)), Err(MemError::NotAllocated(a.offset(128))));
        assert_eq!(heap.release(a), Ok(128));
        assert_eq!(heap.release(a), Err(MemError::NotAllocated(a)));
    }

    #[test]
    fn test_fail_soft_exhaustion() {
        let heap = heap(1024);
        heap.allocate_with(768, AllocPolicy::FailSoft).unwrap();
        let err = heap.allocate_with(512, AllocPolicy::FailSoft).unwrap_err();
        assert_eq!(
            err,
            MemError::OutOfDeviceMemory {
                requested: 512,
                largest_free: 256
            }
        );
        assert_partitioned(&heap);
    }

    #[test]
    fn test_largest_free_block() {
        let heap = heap(8192);
        let a = heap.try_allocate(1024).unwrap();
        heap.try_allocate(1024).unwrap();
        heap.release(a).unwrap();

        let block = heap.largest_free_block();
        assert_eq!(block.addr, BASE.offset(2048));
        assert_eq!(block.size, 6144);
        assert_eq!(block.granularity, 128);

        let tiny = RemoteHeap::new(HeapConfig::on_demand(BASE, 1024));
        let block = tiny.largest_free_block();
        assert_eq!(block.size, 0);
        assert_eq!(block.granularity, 4096);
    }

    #[test]
    fn test_configure_keeps_existing_regions() {
        let mut heap = heap(4096);
        let a = heap.try_allocate(1024).unwrap();
        heap.configure(HeapConfig::new(BASE, 4096));
        assert!(heap.is_allocated(a));
        assert_eq!(heap.stats().free, 3072);
    }

    #[test]
    fn test_configure_full_heap_adds_no_free_region() {
        let mut heap = heap(4096);
        let a = heap.try_allocate(4096).unwrap();
        assert!(heap.free_regions().is_empty());

        heap.configure(HeapConfig::new(BASE, 4096));
        assert!(heap.free_regions().is_empty());
        assert!(heap.try_allocate(64).is_err());

        heap.release(a).unwrap();
        assert_eq!(heap.free_regions(), vec![(BASE, 4096)]);
    }

    #[test]
    fn test_stats() {
        let heap = heap(4096);
        heap.try_allocate(1024).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.total, 4096);
        assert_eq!(stats.allocated, 1024);
        assert_eq!(stats.free, 3072);
        assert_eq!(stats.allocations, 1);
        assert!((stats.usage_percent() - 25.0).abs() < 1e-3);
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let heap = std::sync::Arc::new(heap(1 << 20));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                std::thread::spawn(move || {
                    (0..64).map(|_| heap.try_allocate(256).unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 256);
        assert_partitioned(&heap);
    }
}
