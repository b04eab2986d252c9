//! # Device Properties
//!
//! Attribute keys, their typed values and the fixed byte layout a C binding
//! copies out. Scalars are native-endian, booleans are 32-bit, strings are
//! NUL-terminated, handles and sizes are pointer-width.
//!
//! [`DeviceProfile`] holds the attributes that never change after a device is
//! brought up. Attributes that depend on the device's position in a
//! partition tree are answered by [`crate::device::Device::info`].

use core::mem::size_of;

use clrt_execution::{ClError, ClResult, DeviceId};
use static_assertions::{assert_eq_size, const_assert, const_assert_eq};

use crate::partition::{PartitionProps, PARTITION_EQUALLY};

/// Work-item dimensions every device supports
pub const MAX_WORK_ITEM_DIMENSIONS: usize = 3;

/// Printf buffer size reported by every device
pub const PRINTF_BUFFER_SIZE: usize = 1024 * 1024;

/// Extensions shared by every device
pub const BASE_EXTENSIONS: &str = "cl_khr_global_int32_base_atomics \
     cl_khr_global_int32_extended_atomics cl_khr_local_int32_base_atomics \
     cl_khr_local_int32_extended_atomics cl_khr_byte_addressable_store cl_khr_fp64";

// `cl_bool` and `cl_uint` share the 32-bit slot; partition properties and
// device handles are pointer-sized.
const_assert_eq!(size_of::<u32>(), 4);
assert_eq_size!(isize, usize);
const_assert!(MAX_WORK_ITEM_DIMENSIONS == 3);

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// `cl_device_type`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceType: u64 {
        const DEFAULT     = 1 << 0;
        const CPU         = 1 << 1;
        const GPU         = 1 << 2;
        const ACCELERATOR = 1 << 3;
        const CUSTOM      = 1 << 4;
    }
}

bitflags::bitflags! {
    /// `cl_device_fp_config`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FpConfig: u64 {
        const DENORM                        = 1 << 0;
        const INF_NAN                       = 1 << 1;
        const ROUND_TO_NEAREST              = 1 << 2;
        const ROUND_TO_ZERO                 = 1 << 3;
        const ROUND_TO_INF                  = 1 << 4;
        const FMA                           = 1 << 5;
        const SOFT_FLOAT                    = 1 << 6;
        const CORRECTLY_ROUNDED_DIVIDE_SQRT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// `cl_device_exec_capabilities`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecCapabilities: u64 {
        const KERNEL        = 1 << 0;
        const NATIVE_KERNEL = 1 << 1;
    }
}

bitflags::bitflags! {
    /// `cl_command_queue_properties`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueProperties: u64 {
        const OUT_OF_ORDER_EXEC_MODE_ENABLE = 1 << 0;
        const PROFILING_ENABLE              = 1 << 1;
    }
}

bitflags::bitflags! {
    /// `cl_device_affinity_domain`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AffinityDomain: u64 {
        const NUMA               = 1 << 0;
        const L4_CACHE           = 1 << 1;
        const L3_CACHE           = 1 << 2;
        const L2_CACHE           = 1 << 3;
        const L1_CACHE           = 1 << 4;
        const NEXT_PARTITIONABLE = 1 << 5;
    }
}

/// `CL_READ_WRITE_CACHE`
pub const READ_WRITE_CACHE: u32 = 2;
/// `CL_LOCAL`
pub const LOCAL_MEM_LOCAL: u32 = 1;
/// `CL_GLOBAL`
pub const LOCAL_MEM_GLOBAL: u32 = 2;

// =============================================================================
// KEYS
// =============================================================================

macro_rules! device_info_keys {
    ($( $(#[$doc:meta])* $name:ident = $code:literal, )*) => {
        /// Device attribute key; discriminants are the `cl_device_info` codes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        #[non_exhaustive]
        pub enum DeviceInfo {
            $( $(#[$doc])* $name = $code, )*
        }

        impl DeviceInfo {
            /// Every key
            pub const ALL: &'static [DeviceInfo] = &[$(DeviceInfo::$name,)*];

            /// Key for a raw `cl_device_info` code
            pub fn from_raw(code: u32) -> ClResult<Self> {
                match code {
                    $( $code => Ok(DeviceInfo::$name), )*
                    _ => Err(ClError::InvalidValue),
                }
            }

            /// Raw `cl_device_info` code
            pub const fn raw(self) -> u32 {
                self as u32
            }
        }
    };
}

device_info_keys! {
    Type = 0x1000,
    VendorId = 0x1001,
    MaxComputeUnits = 0x1002,
    MaxWorkItemDimensions = 0x1003,
    MaxWorkGroupSize = 0x1004,
    MaxWorkItemSizes = 0x1005,
    PreferredVectorWidthChar = 0x1006,
    PreferredVectorWidthShort = 0x1007,
    PreferredVectorWidthInt = 0x1008,
    PreferredVectorWidthLong = 0x1009,
    PreferredVectorWidthFloat = 0x100A,
    PreferredVectorWidthDouble = 0x100B,
    MaxClockFrequency = 0x100C,
    AddressBits = 0x100D,
    MaxReadImageArgs = 0x100E,
    MaxWriteImageArgs = 0x100F,
    MaxMemAllocSize = 0x1010,
    Image2dMaxWidth = 0x1011,
    Image2dMaxHeight = 0x1012,
    Image3dMaxWidth = 0x1013,
    Image3dMaxHeight = 0x1014,
    Image3dMaxDepth = 0x1015,
    ImageSupport = 0x1016,
    MaxParameterSize = 0x1017,
    MaxSamplers = 0x1018,
    MemBaseAddrAlign = 0x1019,
    MinDataTypeAlignSize = 0x101A,
    SingleFpConfig = 0x101B,
    GlobalMemCacheType = 0x101C,
    GlobalMemCachelineSize = 0x101D,
    GlobalMemCacheSize = 0x101E,
    GlobalMemSize = 0x101F,
    MaxConstantBufferSize = 0x1020,
    MaxConstantArgs = 0x1021,
    LocalMemType = 0x1022,
    LocalMemSize = 0x1023,
    ErrorCorrectionSupport = 0x1024,
    ProfilingTimerResolution = 0x1025,
    EndianLittle = 0x1026,
    Available = 0x1027,
    CompilerAvailable = 0x1028,
    ExecutionCapabilities = 0x1029,
    QueueProperties = 0x102A,
    Name = 0x102B,
    Vendor = 0x102C,
    DriverVersion = 0x102D,
    Profile = 0x102E,
    Version = 0x102F,
    Extensions = 0x1030,
    DoubleFpConfig = 0x1032,
    PreferredVectorWidthHalf = 0x1034,
    HostUnifiedMemory = 0x1035,
    NativeVectorWidthChar = 0x1036,
    NativeVectorWidthShort = 0x1037,
    NativeVectorWidthInt = 0x1038,
    NativeVectorWidthLong = 0x1039,
    NativeVectorWidthFloat = 0x103A,
    NativeVectorWidthDouble = 0x103B,
    NativeVectorWidthHalf = 0x103C,
    OpenclCVersion = 0x103D,
    LinkerAvailable = 0x103E,
    BuiltInKernels = 0x103F,
    ImageMaxBufferSize = 0x1040,
    ImageMaxArraySize = 0x1041,
    ParentDevice = 0x1042,
    PartitionMaxSubDevices = 0x1043,
    PartitionProperties = 0x1044,
    PartitionAffinityDomain = 0x1045,
    PartitionType = 0x1046,
    ReferenceCount = 0x1047,
    PreferredInteropUserSync = 0x1048,
    PrintfBufferSize = 0x1049,
}

// =============================================================================
// VALUES
// =============================================================================

/// Typed attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// `cl_uint`
    Uint(u32),
    /// `cl_ulong`
    Ulong(u64),
    /// `size_t`
    Size(usize),
    /// `cl_bool`
    Bool(bool),
    /// Any `cl_bitfield`
    Bitfield(u64),
    /// `char[]`
    Str(String),
    /// `size_t[3]`
    Sizes([usize; MAX_WORK_ITEM_DIMENSIONS]),
    /// `cl_device_partition_property[]`
    Partition(PartitionProps),
    /// `cl_device_id`; `None` is the null handle
    Device(Option<DeviceId>),
}

impl PropertyValue {
    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            PropertyValue::Uint(_) | PropertyValue::Bool(_) => size_of::<u32>(),
            PropertyValue::Ulong(_) | PropertyValue::Bitfield(_) => size_of::<u64>(),
            PropertyValue::Size(_) | PropertyValue::Device(_) => size_of::<usize>(),
            PropertyValue::Str(s) => s.len() + 1,
            PropertyValue::Sizes(sizes) => sizes.len() * size_of::<usize>(),
            PropertyValue::Partition(props) => props.len() * size_of::<isize>(),
        }
    }

    /// Encode into `out`, which must hold exactly [`PropertyValue::size`] bytes
    fn encode(&self, out: &mut [u8]) {
        match self {
            PropertyValue::Uint(v) => out.copy_from_slice(&v.to_ne_bytes()),
            PropertyValue::Bool(v) => out.copy_from_slice(&u32::from(*v).to_ne_bytes()),
            PropertyValue::Ulong(v) | PropertyValue::Bitfield(v) => {
                out.copy_from_slice(&v.to_ne_bytes())
            },
            PropertyValue::Size(v) => out.copy_from_slice(&v.to_ne_bytes()),
            PropertyValue::Device(id) => {
                let raw = id.map_or(0usize, |id| id.0 as usize);
                out.copy_from_slice(&raw.to_ne_bytes());
            },
            PropertyValue::Str(s) => {
                let (text, nul) = out.split_at_mut(s.len());
                text.copy_from_slice(s.as_bytes());
                nul[0] = 0;
            },
            PropertyValue::Sizes(sizes) => {
                for (chunk, v) in out.chunks_exact_mut(size_of::<usize>()).zip(sizes) {
                    chunk.copy_from_slice(&v.to_ne_bytes());
                }
            },
            PropertyValue::Partition(props) => {
                for (chunk, v) in out.chunks_exact_mut(size_of::<isize>()).zip(props) {
                    chunk.copy_from_slice(&v.to_ne_bytes());
                }
            },
        }
    }

    /// Encoded bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size()];
        self.encode(&mut out);
        out
    }

    /// Copy into a caller buffer.
    ///
    /// With no buffer only the size is reported. A buffer shorter than the
    /// value fails with [`ClError::InvalidValue`] and is left untouched.
    pub fn write_to(&self, buf: Option<&mut [u8]>) -> ClResult<usize> {
        let size = self.size();
        if let Some(buf) = buf {
            if buf.len() < size {
                return Err(ClError::InvalidValue);
            }
            self.encode(&mut buf[..size]);
        }
        Ok(size)
    }
}

// =============================================================================
// STATIC PROFILE
// =============================================================================

/// Attributes fixed at device bring-up
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device_type: DeviceType,
    pub vendor_id: u32,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; MAX_WORK_ITEM_DIMENSIONS],
    /// char, short, int, long, float, double, half
    pub preferred_widths: [u32; 7],
    /// char, short, int, long, float, double, half
    pub native_widths: [u32; 7],
    pub clock_mhz: u32,
    pub address_bits: u32,
    pub max_parameter_size: usize,
    /// In bits
    pub mem_base_addr_align: u32,
    pub min_data_type_align: u32,
    pub single_fp: FpConfig,
    pub double_fp: FpConfig,
    pub cacheline_size: u32,
    pub cache_size: u64,
    pub global_mem_size: u64,
    pub max_mem_alloc_size: u64,
    pub max_constant_buffer_size: u64,
    pub max_constant_args: u32,
    pub local_mem_type: u32,
    pub local_mem_size: u64,
    pub timer_resolution: usize,
    pub exec_capabilities: ExecCapabilities,
    pub queue_properties: QueueProperties,
    pub name: String,
    pub vendor: String,
    pub driver_version: String,
    pub extensions: String,
    pub host_unified_memory: bool,
}

impl DeviceProfile {
    /// Profile of a host CPU device
    pub fn cpu(name: &str, clock_mhz: u32, global_mem_size: u64) -> Self {
        Self {
            device_type: DeviceType::CPU,
            vendor_id: 0,
            max_work_group_size: 46 * 1024,
            max_work_item_sizes: [46 * 1024; MAX_WORK_ITEM_DIMENSIONS],
            preferred_widths: [16, 8, 4, 2, 4, 2, 0],
            native_widths: [16, 8, 4, 2, 4, 2, 0],
            clock_mhz,
            address_bits: 64,
            max_parameter_size: 1024,
            mem_base_addr_align: 1024,
            min_data_type_align: 128,
            single_fp: FpConfig::INF_NAN | FpConfig::ROUND_TO_NEAREST,
            double_fp: FpConfig::FMA
                | FpConfig::ROUND_TO_NEAREST
                | FpConfig::ROUND_TO_ZERO
                | FpConfig::ROUND_TO_INF
                | FpConfig::INF_NAN
                | FpConfig::DENORM,
            cacheline_size: 16,
            cache_size: 512 * 1024 * 1024,
            global_mem_size,
            max_mem_alloc_size: global_mem_size / 4,
            max_constant_buffer_size: 64 * 1024,
            max_constant_args: 8,
            local_mem_type: LOCAL_MEM_GLOBAL,
            local_mem_size: 128 * 1024,
            timer_resolution: 1000,
            exec_capabilities: ExecCapabilities::KERNEL | ExecCapabilities::NATIVE_KERNEL,
            queue_properties: QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE
                | QueueProperties::PROFILING_ENABLE,
            name: name.to_owned(),
            vendor: "Generic".to_owned(),
            driver_version: crate::RUNTIME_VERSION.to_string(),
            extensions: BASE_EXTENSIONS.to_owned(),
            host_unified_memory: true,
        }
    }

    /// Profile of a remote accelerator whose global memory is its heap
    pub fn accelerator(name: &str, clock_mhz: u32, global_mem_size: u64) -> Self {
        Self {
            device_type: DeviceType::ACCELERATOR,
            vendor_id: 0,
            max_work_group_size: 1024 * 1024 * 1024,
            max_work_item_sizes: [1024 * 1024 * 1024; MAX_WORK_ITEM_DIMENSIONS],
            preferred_widths: [4, 2, 1, 1, 1, 1, 0],
            native_widths: [4, 2, 1, 1, 1, 1, 0],
            clock_mhz,
            address_bits: 32,
            max_parameter_size: 1024,
            mem_base_addr_align: 1024,
            min_data_type_align: 128,
            single_fp: FpConfig::INF_NAN | FpConfig::ROUND_TO_NEAREST | FpConfig::FMA,
            double_fp: FpConfig::FMA
                | FpConfig::ROUND_TO_NEAREST
                | FpConfig::ROUND_TO_ZERO
                | FpConfig::ROUND_TO_INF
                | FpConfig::INF_NAN
                | FpConfig::DENORM,
            cacheline_size: 128,
            cache_size: 128 * 1024,
            global_mem_size,
            max_mem_alloc_size: global_mem_size,
            max_constant_buffer_size: 1024 * 1024,
            max_constant_args: 8,
            local_mem_type: LOCAL_MEM_LOCAL,
            local_mem_size: 128 * 1024,
            timer_resolution: 1,
            exec_capabilities: ExecCapabilities::KERNEL,
            queue_properties: QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE
                | QueueProperties::PROFILING_ENABLE,
            name: name.to_owned(),
            vendor: "Generic".to_owned(),
            driver_version: crate::RUNTIME_VERSION.to_string(),
            extensions: BASE_EXTENSIONS.to_owned(),
            host_unified_memory: false,
        }
    }

    /// Static attribute value; `None` for keys answered by the device itself
    pub fn value(&self, key: DeviceInfo) -> Option<PropertyValue> {
        use PropertyValue::*;

        let value = match key {
            DeviceInfo::Type => Bitfield(self.device_type.bits()),
            DeviceInfo::VendorId => Uint(self.vendor_id),
            DeviceInfo::MaxWorkItemDimensions => Uint(MAX_WORK_ITEM_DIMENSIONS as u32),
            DeviceInfo::MaxWorkGroupSize => Size(self.max_work_group_size),
            DeviceInfo::MaxWorkItemSizes => Sizes(self.max_work_item_sizes),
            DeviceInfo::PreferredVectorWidthChar => Uint(self.preferred_widths[0]),
            DeviceInfo::PreferredVectorWidthShort => Uint(self.preferred_widths[1]),
            DeviceInfo::PreferredVectorWidthInt => Uint(self.preferred_widths[2]),
            DeviceInfo::PreferredVectorWidthLong => Uint(self.preferred_widths[3]),
            DeviceInfo::PreferredVectorWidthFloat => Uint(self.preferred_widths[4]),
            DeviceInfo::PreferredVectorWidthDouble => Uint(self.preferred_widths[5]),
            DeviceInfo::PreferredVectorWidthHalf => Uint(self.preferred_widths[6]),
            DeviceInfo::NativeVectorWidthChar => Uint(self.native_widths[0]),
            DeviceInfo::NativeVectorWidthShort => Uint(self.native_widths[1]),
            DeviceInfo::NativeVectorWidthInt => Uint(self.native_widths[2]),
            DeviceInfo::NativeVectorWidthLong => Uint(self.native_widths[3]),
            DeviceInfo::NativeVectorWidthFloat => Uint(self.native_widths[4]),
            DeviceInfo::NativeVectorWidthDouble => Uint(self.native_widths[5]),
            DeviceInfo::NativeVectorWidthHalf => Uint(self.native_widths[6]),
            DeviceInfo::MaxClockFrequency => Uint(self.clock_mhz),
            DeviceInfo::AddressBits => Uint(self.address_bits),
            DeviceInfo::MaxReadImageArgs
            | DeviceInfo::MaxWriteImageArgs
            | DeviceInfo::MaxSamplers => Uint(0),
            DeviceInfo::Image2dMaxWidth
            | DeviceInfo::Image2dMaxHeight
            | DeviceInfo::Image3dMaxWidth
            | DeviceInfo::Image3dMaxHeight
            | DeviceInfo::Image3dMaxDepth
            | DeviceInfo::ImageMaxBufferSize
            | DeviceInfo::ImageMaxArraySize => Size(0),
            DeviceInfo::ImageSupport => Bool(false),
            DeviceInfo::MaxMemAllocSize => Ulong(self.max_mem_alloc_size),
            DeviceInfo::MaxParameterSize => Size(self.max_parameter_size),
            DeviceInfo::MemBaseAddrAlign => Uint(self.mem_base_addr_align),
            DeviceInfo::MinDataTypeAlignSize => Uint(self.min_data_type_align),
            DeviceInfo::SingleFpConfig => Bitfield(self.single_fp.bits()),
            DeviceInfo::DoubleFpConfig => Bitfield(self.double_fp.bits()),
            DeviceInfo::GlobalMemCacheType => Uint(READ_WRITE_CACHE),
            DeviceInfo::GlobalMemCachelineSize => Uint(self.cacheline_size),
            DeviceInfo::GlobalMemCacheSize => Ulong(self.cache_size),
            DeviceInfo::GlobalMemSize => Ulong(self.global_mem_size),
            DeviceInfo::MaxConstantBufferSize => Ulong(self.max_constant_buffer_size),
            DeviceInfo::MaxConstantArgs => Uint(self.max_constant_args),
            DeviceInfo::LocalMemType => Uint(self.local_mem_type),
            DeviceInfo::LocalMemSize => Ulong(self.local_mem_size),
            DeviceInfo::ErrorCorrectionSupport => Bool(false),
            DeviceInfo::ProfilingTimerResolution => Size(self.timer_resolution),
            DeviceInfo::EndianLittle => Bool(cfg!(target_endian = "little")),
            DeviceInfo::Available
            | DeviceInfo::CompilerAvailable
            | DeviceInfo::LinkerAvailable
            | DeviceInfo::PreferredInteropUserSync => Bool(true),
            DeviceInfo::ExecutionCapabilities => Bitfield(self.exec_capabilities.bits()),
            DeviceInfo::QueueProperties => Bitfield(self.queue_properties.bits()),
            DeviceInfo::Name => Str(self.name.clone()),
            DeviceInfo::Vendor => Str(self.vendor.clone()),
            DeviceInfo::DriverVersion => Str(self.driver_version.clone()),
            DeviceInfo::Profile => Str("FULL_PROFILE".to_owned()),
            DeviceInfo::Version => Str(format!("OpenCL 1.2 clrt {}", self.driver_version)),
            DeviceInfo::OpenclCVersion => Str("OpenCL C 1.2".to_owned()),
            DeviceInfo::Extensions => Str(self.extensions.clone()),
            DeviceInfo::BuiltInKernels => Str(String::new()),
            DeviceInfo::HostUnifiedMemory => Bool(self.host_unified_memory),
            DeviceInfo::PrintfBufferSize => Size(PRINTF_BUFFER_SIZE),
            DeviceInfo::PartitionProperties => {
                Partition([PARTITION_EQUALLY].into_iter().collect())
            },
            DeviceInfo::PartitionAffinityDomain => Bitfield(0),
            DeviceInfo::MaxComputeUnits
            | DeviceInfo::ParentDevice
            | DeviceInfo::PartitionMaxSubDevices
            | DeviceInfo::PartitionType
            | DeviceInfo::ReferenceCount => return None,
        };
        Some(value)
    }
}
