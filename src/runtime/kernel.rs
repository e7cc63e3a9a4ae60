//! Kernel images, naming and launch configuration
//!
//! A `KernelImage` names one compiled module. The CUDA backend loads it from the
//! PTX that `build.rs` produced (`$CUDA_KERNEL_DIR/<name>.ptx`); the host backend
//! runs the Rust entry points listed in `host`.
//!
//! Kernel names follow `<op>_<dtype>` or `<op>_<dtype>_<index dtype>`, e.g.
//! `unsorted_segment_sum_c64_i32`, and are identical for both backends.

use super::Dim3;
use super::host::HostKernel;
use crate::dtype::DType;

// ============================================================================
// Kernel Images
// ============================================================================

/// A compiled module and its host-executable counterpart.
#[derive(Debug)]
pub struct KernelImage {
    /// Module name; the PTX file stem for the CUDA backend
    pub name: &'static str,
    /// Kernels executable by the host backend
    pub host: &'static [HostKernel],
    /// Module-scope globals the host backend materializes on load
    pub globals: &'static [HostGlobal],
}

/// A `__device__` variable of a kernel image, as seen by the host backend.
#[derive(Debug)]
pub struct HostGlobal {
    /// Symbol name, identical to the CUDA source
    pub name: &'static str,
    /// Initial contents; the global is exactly this many bytes
    pub init: &'static [u8],
}

impl KernelImage {
    /// Host entry point for `kernel`, if the image provides one.
    pub fn host_kernel(&self, kernel: &str) -> Option<&'static HostKernel> {
        self.host.iter().find(|k| k.name == kernel)
    }
}

// ============================================================================
// Kernel Naming
// ============================================================================

/// Generate a kernel name with dtype suffix.
///
/// # Example
///
/// ```ignore
/// let name = kernel_name("segment_fill", DType::F32); // "segment_fill_f32"
/// ```
#[inline]
pub fn kernel_name(base: &str, dtype: DType) -> String {
    format!("{}_{}", base, dtype.kernel_suffix())
}

/// Generate a kernel name with element and index dtype suffixes.
#[inline]
pub fn indexed_kernel_name(base: &str, dtype: DType, index: DType) -> String {
    format!(
        "{}_{}_{}",
        base,
        dtype.kernel_suffix(),
        index.kernel_suffix()
    )
}

// ============================================================================
// Launch Configuration
// ============================================================================

/// Upper bound on threads per block used by the 1-D launch helper
pub const MAX_BLOCK_SIZE: u32 = 1024;

/// Device limits that shape a 1-D launch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaunchLimits {
    /// Maximum threads per block
    pub max_threads_per_block: u32,
    /// Number of multiprocessors
    pub multiprocessor_count: u32,
    /// Maximum resident threads per multiprocessor
    pub max_threads_per_multiprocessor: u32,
}

/// Grid, block and dynamic shared memory of one launch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Grid extent in blocks
    pub grid: Dim3,
    /// Block extent in threads
    pub block: Dim3,
    /// Dynamic shared memory in bytes
    pub shared_mem_bytes: u32,
}

/// Calculate the launch configuration for a grid-stride 1-D kernel.
///
/// Uses as many threads per block as the device allows (capped at
/// `MAX_BLOCK_SIZE`) and no more blocks than the device can keep resident at
/// once. Kernels loop with stride `grid * block` over the remaining work, so
/// every element is visited exactly once regardless of `work`.
///
/// Returns `None` for empty work.
pub fn launch_config_1d(work: u64, limits: LaunchLimits) -> Option<LaunchConfig> {
    if work == 0 {
        return None;
    }
    let threads = limits.max_threads_per_block.clamp(1, MAX_BLOCK_SIZE);
    let resident = u64::from(limits.multiprocessor_count.max(1))
        * u64::from(limits.max_threads_per_multiprocessor.max(threads));
    let physical = work.min(resident);
    let blocks = physical.div_ceil(u64::from(threads));
    Some(LaunchConfig {
        grid: Dim3::from(blocks as u32),
        block: Dim3::from(threads),
        shared_mem_bytes: 0,
    })
}
