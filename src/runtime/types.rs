//! Raw handle and enum types shared by every backend
//!
//! Handles are plain `Copy` newtypes over the driver's opaque pointers. They
//! carry no ownership; ownership lives in the `driver` wrappers built on top.

use std::fmt;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(pub usize);

        impl $name {
            /// The null handle
            pub const NULL: Self = Self(0);

            /// Returns true for the null handle
            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(0x{:x})"), self.0)
            }
        }
    };
}

raw_handle!(
    /// Raw driver context handle (`CUcontext`)
    RawContext
);
raw_handle!(
    /// Raw driver stream handle (`CUstream`). The null handle names the
    /// context's default stream.
    RawStream
);
raw_handle!(
    /// Raw driver event handle (`CUevent`)
    RawEvent
);
raw_handle!(
    /// Raw loaded-module handle (`CUmodule`)
    RawModule
);
raw_handle!(
    /// Raw kernel function handle (`CUfunction`)
    RawFunction
);

/// Raw device handle (`CUdevice`). Device handles have no destroy call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawDevice(pub i32);

/// Address in device (or registered host) memory.
pub type DevicePtr = u64;

/// Three-dimensional launch extent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dim3 {
    /// X extent
    pub x: u32,
    /// Y extent
    pub y: u32,
    /// Z extent
    pub z: u32,
}

impl Dim3 {
    /// Create a 3-D extent
    #[inline]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total number of points in the extent
    #[inline]
    pub const fn volume(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

/// Memory space addressed by a pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// Page-locked or registered host memory
    Host,
    /// Device global memory
    Device,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Device => "device",
        })
    }
}

/// Event creation flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum EventFlags {
    /// Timing-enabled event
    #[default]
    Default,
    /// Skip timestamp capture when elapsed time is not needed
    DisableTiming,
}

/// Result of polling an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventStatus {
    /// Work preceding the event is still running
    Pending,
    /// All work preceding the event has completed
    Complete,
}

/// L1 / shared memory split preference (`CUfunc_cache`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CacheConfig {
    /// No preference
    #[default]
    PreferNone,
    /// Prefer larger shared memory
    PreferShared,
    /// Prefer larger L1 cache
    PreferL1,
    /// Equal split
    PreferEqual,
}

impl CacheConfig {
    /// Driver encoding
    pub const fn raw(self) -> u32 {
        match self {
            Self::PreferNone => 0,
            Self::PreferShared => 1,
            Self::PreferL1 => 2,
            Self::PreferEqual => 3,
        }
    }
}

/// Shared memory bank width (`CUsharedconfig`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SharedMemConfig {
    /// Device default bank size
    #[default]
    DefaultBankSize,
    /// Four-byte banks
    FourByteBankSize,
    /// Eight-byte banks
    EightByteBankSize,
}

impl SharedMemConfig {
    /// Driver encoding
    pub const fn raw(self) -> u32 {
        match self {
            Self::DefaultBankSize => 0,
            Self::FourByteBankSize => 1,
            Self::EightByteBankSize => 2,
        }
    }

    /// Decode from the driver encoding
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::DefaultBankSize),
            1 => Some(Self::FourByteBankSize),
            2 => Some(Self::EightByteBankSize),
            _ => None,
        }
    }
}

/// Host thread behaviour while waiting on the device (`CU_CTX_SCHED_*`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ScheduleMode {
    /// Driver heuristic
    #[default]
    Auto,
    /// Spin while waiting
    Spin,
    /// Yield the thread while waiting
    Yield,
    /// Block on a synchronization primitive
    BlockingSync,
}

/// Device attributes queried by the device handle layer (`CUdevice_attribute`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceAttribute {
    /// Maximum threads per block
    MaxThreadsPerBlock,
    /// Maximum grid X dimension
    MaxGridDimX,
    /// Maximum grid Y dimension
    MaxGridDimY,
    /// Maximum grid Z dimension
    MaxGridDimZ,
    /// Shared memory available to one block, in bytes
    MaxSharedMemoryPerBlock,
    /// Warp size in threads
    WarpSize,
    /// 32-bit registers available to one block
    MaxRegistersPerBlock,
    /// Number of multiprocessors
    MultiprocessorCount,
    /// ECC enabled (0/1)
    EccEnabled,
    /// Maximum resident threads per multiprocessor
    MaxThreadsPerMultiprocessor,
    /// Shared memory available to one multiprocessor, in bytes
    MaxSharedMemoryPerMultiprocessor,
    /// Compute capability major number
    ComputeCapabilityMajor,
    /// Compute capability minor number
    ComputeCapabilityMinor,
}

/// Kernel function attributes (`CUfunction_attribute`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FunctionAttribute {
    /// Maximum threads per block this function can be launched with
    MaxThreadsPerBlock,
    /// Statically allocated shared memory, in bytes
    SharedSizeBytes,
    /// Registers used per thread
    NumRegs,
}

/// Options applied when creating a context.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContextOptions {
    /// Host scheduling behaviour while waiting on the device
    pub schedule: ScheduleMode,
    /// Allow mapping page-locked host memory into the device address space
    pub map_host_memory: bool,
    /// Preferred L1 / shared memory split
    pub cache_config: CacheConfig,
    /// Preferred shared memory bank width
    pub shared_mem_config: SharedMemConfig,
}

impl ContextOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduling mode
    pub fn schedule(mut self, schedule: ScheduleMode) -> Self {
        self.schedule = schedule;
        self
    }

    /// Enable or disable mapped host memory
    pub fn map_host_memory(mut self, enabled: bool) -> Self {
        self.map_host_memory = enabled;
        self
    }

    /// Set the cache preference
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Set the shared memory bank preference
    pub fn shared_mem_config(mut self, config: SharedMemConfig) -> Self {
        self.shared_mem_config = config;
        self
    }

    /// Context creation flags in the driver encoding (`CU_CTX_*`).
    pub const fn flags(&self) -> u32 {
        let sched = match self.schedule {
            ScheduleMode::Auto => 0x0,
            ScheduleMode::Spin => 0x1,
            ScheduleMode::Yield => 0x2,
            ScheduleMode::BlockingSync => 0x4,
        };
        if self.map_host_memory { sched | 0x8 } else { sched }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_flags() {
        assert_eq!(ContextOptions::new().flags(), 0);
        let opts = ContextOptions::new()
            .schedule(ScheduleMode::BlockingSync)
            .map_host_memory(true);
        assert_eq!(opts.flags(), 0xC);
    }

    #[test]
    fn test_null_handles() {
        assert!(RawStream::NULL.is_null());
        assert!(!RawEvent(0x10).is_null());
        assert_eq!(format!("{:?}", RawContext(0x1f)), "RawContext(0x1f)");
    }

    #[test]
    fn test_dim3_volume() {
        assert_eq!(Dim3::new(4, 2, 3).volume(), 24);
        assert_eq!(Dim3::from(7), Dim3::new(7, 1, 1));
    }
}
