//! # Transport Types
//!
//! Addresses and identifiers shared by every layer that talks to a device.
//!
//! A [`DeviceAddr`] lives in the accelerator's own address space. It is never
//! a host pointer and is only meaningful to a [`crate::TransportDriver`].

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// DEVICE ADDRESS
// =============================================================================

/// Address in a device's externally addressed memory
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceAddr(u64);

impl DeviceAddr {
    /// Create a new device address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Null device address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment (power of two)
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary (power of two)
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Bits 20 and up, the window selector used by core-local memories
    #[inline]
    pub const fn window(self) -> u64 {
        self.0 >> 20
    }
}

impl Add<u64> for DeviceAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<DeviceAddr> for DeviceAddr {
    type Output = u64;

    fn sub(self, rhs: DeviceAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddr(0x{:08x})", self.0)
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

// =============================================================================
// CORE MASK
// =============================================================================

bitflags::bitflags! {
    /// Set of processor cores on one chip
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CoreMask: u8 {
        const CORE0 = 1 << 0;
        const CORE1 = 1 << 1;
        const CORE2 = 1 << 2;
        const CORE3 = 1 << 3;
        const CORE4 = 1 << 4;
        const CORE5 = 1 << 5;
        const CORE6 = 1 << 6;
        const CORE7 = 1 << 7;
    }
}

impl CoreMask {
    /// Mask containing only `core`
    pub fn core(core: u32) -> Self {
        1u8.checked_shl(core)
            .map(Self::from_bits_truncate)
            .unwrap_or_else(Self::empty)
    }

    /// Number of cores in the mask
    pub fn count(self) -> u32 {
        self.bits().count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_addr_alignment() {
        let addr = DeviceAddr::new(0x8000_0001);
        assert!(!addr.is_aligned(128));
        assert_eq!(addr.align_up(128), DeviceAddr::new(0x8000_0080));
        assert_eq!(addr.offset(0x7f).raw(), 0x8000_0080);
        assert_eq!(DeviceAddr::new(0x0090_0000) - DeviceAddr::new(0x0080_0000), 0x10_0000);
    }

    #[test]
    fn test_window() {
        assert_eq!(DeviceAddr::new(0x0087_fffc).window(), 0x008);
        assert_eq!(DeviceAddr::new(0x8000_0000).window(), 0x800);
    }

    #[test]
    fn test_core_mask() {
        assert_eq!(CoreMask::core(3), CoreMask::CORE3);
        assert_eq!(CoreMask::all().count(), 8);
        assert!(CoreMask::core(8).is_empty());
    }
}
