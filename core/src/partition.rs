//! # Device Partitioning
//!
//! A partition request splits a device's compute units into sub-devices.
//! Only equal partitioning is supported; the other request kinds parse and
//! round-trip through the property encoding but are rejected on use.

use arrayvec::ArrayVec;
use clrt_execution::{ClError, ClResult};

/// `CL_DEVICE_PARTITION_EQUALLY`
pub const PARTITION_EQUALLY: isize = 0x1086;
/// `CL_DEVICE_PARTITION_BY_COUNTS`
pub const PARTITION_BY_COUNTS: isize = 0x1087;
/// `CL_DEVICE_PARTITION_BY_COUNTS_LIST_END`
pub const PARTITION_BY_COUNTS_LIST_END: isize = 0;
/// `CL_DEVICE_PARTITION_BY_AFFINITY_DOMAIN`
pub const PARTITION_BY_AFFINITY_DOMAIN: isize = 0x1088;

/// Longest encoded property list, terminator included
pub const MAX_PARTITION_PROPS: usize = 16;

/// Encoded partition property list
pub type PartitionProps = ArrayVec<isize, MAX_PARTITION_PROPS>;

/// Most counts a by-counts request can carry
pub const MAX_PARTITION_COUNTS: usize = MAX_PARTITION_PROPS - 3;

/// How to split a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionRequest {
    /// Sub-devices of `n` compute units each
    Equally(u32),
    /// One sub-device per listed count
    ByCounts(ArrayVec<u32, MAX_PARTITION_COUNTS>),
    /// Split along an affinity domain
    ByAffinityDomain(u64),
}

/// The one value of a single-valued partition kind, which must be followed
/// directly by the terminator
fn single_value(rest: &[isize]) -> ClResult<isize> {
    match rest {
        [value, 0, ..] => Ok(*value),
        _ => Err(ClError::InvalidValue),
    }
}

impl PartitionRequest {
    /// Decode a zero-terminated property list
    pub fn from_properties(props: &[isize]) -> ClResult<Self> {
        let (&kind, rest) = props.split_first().ok_or(ClError::InvalidValue)?;
        match kind {
            PARTITION_EQUALLY => {
                let n = single_value(rest)?;
                let n = u32::try_from(n).map_err(|_| ClError::InvalidValue)?;
                Ok(PartitionRequest::Equally(n))
            },
            PARTITION_BY_COUNTS => {
                let mut counts = ArrayVec::new();
                for &count in rest {
                    if count == PARTITION_BY_COUNTS_LIST_END {
                        return Ok(PartitionRequest::ByCounts(counts));
                    }
                    let count = u32::try_from(count).map_err(|_| ClError::InvalidValue)?;
                    counts.try_push(count).map_err(|_| ClError::InvalidValue)?;
                }
                Err(ClError::InvalidValue)
            },
            PARTITION_BY_AFFINITY_DOMAIN => {
                let domain = single_value(rest)?;
                let domain = u64::try_from(domain).map_err(|_| ClError::InvalidValue)?;
                Ok(PartitionRequest::ByAffinityDomain(domain))
            },
            _ => Err(ClError::InvalidValue),
        }
    }

    /// Encode as a zero-terminated property list
    pub fn to_properties(&self) -> PartitionProps {
        let mut props = PartitionProps::new();
        match self {
            PartitionRequest::Equally(n) => {
                props.push(PARTITION_EQUALLY);
                props.push(*n as isize);
            },
            PartitionRequest::ByCounts(counts) => {
                props.push(PARTITION_BY_COUNTS);
                props.extend(counts.iter().map(|&c| c as isize));
                props.push(PARTITION_BY_COUNTS_LIST_END);
            },
            PartitionRequest::ByAffinityDomain(domain) => {
                props.push(PARTITION_BY_AFFINITY_DOMAIN);
                props.push(*domain as isize);
            },
        }
        props.push(0);
        props
    }

    /// Number of sub-devices and compute units each, for a parent with
    /// `compute_units` units
    pub fn plan(&self, compute_units: u32) -> ClResult<SubDevicePlan> {
        if compute_units <= 1 {
            return Err(ClError::DevicePartitionFailed);
        }
        let PartitionRequest::Equally(n) = *self else {
            return Err(ClError::InvalidValue);
        };
        if n == 0 || n > compute_units {
            return Err(ClError::InvalidValue);
        }
        Ok(SubDevicePlan {
            count: compute_units / n,
            units_each: n,
        })
    }
}

/// Outcome of a valid partition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubDevicePlan {
    /// Sub-devices to create
    pub count: u32,
    /// Compute units per sub-device
    pub units_each: u32,
}
