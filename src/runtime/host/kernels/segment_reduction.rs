//! Host implementations of the segment reduction kernels
//!
//! Parameter layouts match `segment_reduction.cu`:
//!
//! ```text
//! segment_fill_<T>(u64 n, T value, T* out)
//! unsorted_segment_<op>_<T>_<I>(I outer, I inner, I output_rows,
//!                               const I* segment_ids, const T* input, T* output)
//! ```

use crate::dtype::{AtomicAccumulate, AtomicOrdered, Complex64, Complex128, Element, SegmentIndex};
use crate::runtime::{DriverResult, HostGlobal};
use crate::runtime::host::{HostKernel, HostLaunch};
use std::mem::size_of;

// ============================================================================
// Combiners
// ============================================================================

/// Atomic read-modify-write applied to one output element.
trait Combine<T> {
    /// # Safety
    ///
    /// `dest` must be a valid, aligned element only accessed through combiners.
    unsafe fn combine(dest: *mut T, value: T);
}

struct Sum;
struct Prod;
struct Max;
struct Min;

impl<T: AtomicAccumulate> Combine<T> for Sum {
    #[inline]
    unsafe fn combine(dest: *mut T, value: T) {
        unsafe { T::atomic_add(dest, value) }
    }
}

impl<T: AtomicOrdered> Combine<T> for Prod {
    #[inline]
    unsafe fn combine(dest: *mut T, value: T) {
        unsafe { T::atomic_mul(dest, value) }
    }
}

impl<T: AtomicOrdered> Combine<T> for Max {
    #[inline]
    unsafe fn combine(dest: *mut T, value: T) {
        unsafe { T::atomic_max(dest, value) }
    }
}

impl<T: AtomicOrdered> Combine<T> for Min {
    #[inline]
    unsafe fn combine(dest: *mut T, value: T) {
        unsafe { T::atomic_min(dest, value) }
    }
}

// ============================================================================
// Kernels
// ============================================================================

fn segment_fill<T: Element>(launch: &HostLaunch) -> DriverResult<()> {
    let n: u64 = launch.param(0)?;
    let value: T = launch.param(1)?;
    let out = launch.global::<T>(launch.param(2)?, n as usize)?;

    launch.for_each_thread(|t| {
        for i in t.grid_stride(n) {
            // SAFETY: each index is owned by exactly one thread of the grid.
            unsafe { out.store(i, value)? };
        }
        Ok(())
    })
}

fn unsorted_segment<T, I, C>(launch: &HostLaunch) -> DriverResult<()>
where
    T: Element,
    I: SegmentIndex,
    C: Combine<T>,
{
    let outer = launch.param::<I>(0)?.to_i64().max(0) as u64;
    let inner = launch.param::<I>(1)?.to_i64().max(0) as u64;
    let output_rows = launch.param::<I>(2)?.to_i64();
    let input_total = outer * inner;
    let output_total = output_rows.max(0) as u64 * inner;

    let segment_ids = launch.global::<I>(launch.param(3)?, outer as usize)?;
    let input = launch.global::<T>(launch.param(4)?, input_total as usize)?;
    let output = launch.global::<T>(launch.param(5)?, output_total as usize)?;

    launch.for_each_thread(|t| {
        for input_index in t.grid_stride(input_total) {
            let segment_offset = input_index % inner;
            // SAFETY: ids and input are read-only for the duration of the kernel.
            let segment = unsafe { segment_ids.load(input_index / inner)? }.to_i64();
            if segment < 0 || segment >= output_rows {
                continue;
            }
            let output_index = segment as u64 * inner + segment_offset;
            let value = unsafe { input.load(input_index)? };
            // SAFETY: every access to `output` in this kernel is atomic.
            unsafe { C::combine(output.element(output_index)?, value) };
        }
        Ok(())
    })
}

macro_rules! fill {
    ($t:ty, $suffix:literal) => {
        HostKernel {
            name: concat!("segment_fill_", $suffix),
            params: &[8, size_of::<$t>(), 8],
            entry: segment_fill::<$t>,
        }
    };
}

macro_rules! segment {
    ($op:ident, $combine:ty, $t:ty, $suffix:literal, $i:ty, $isuffix:literal) => {
        HostKernel {
            name: concat!("unsorted_segment_", stringify!($op), "_", $suffix, "_", $isuffix),
            params: &[size_of::<$i>(), size_of::<$i>(), size_of::<$i>(), 8, 8, 8],
            entry: unsorted_segment::<$t, $i, $combine>,
        }
    };
}

/// Version of the kernel parameter layout, exported by the image as the
/// `segment_reduction_abi_version` global
pub const SEGMENT_REDUCTION_ABI_VERSION: u32 = 1;

const ABI_VERSION_BYTES: [u8; 4] = SEGMENT_REDUCTION_ABI_VERSION.to_le_bytes();

/// Every global of the `segment_reduction` image
pub const GLOBALS: &[HostGlobal] = &[HostGlobal {
    name: "segment_reduction_abi_version",
    init: &ABI_VERSION_BYTES,
}];

/// Every kernel of the `segment_reduction` image
pub const KERNELS: &[HostKernel] = &[
    fill!(f32, "f32"),
    fill!(f64, "f64"),
    fill!(Complex64, "c64"),
    fill!(Complex128, "c128"),
    segment!(sum, Sum, f32, "f32", i32, "i32"),
    segment!(sum, Sum, f32, "f32", i64, "i64"),
    segment!(sum, Sum, f64, "f64", i32, "i32"),
    segment!(sum, Sum, f64, "f64", i64, "i64"),
    segment!(sum, Sum, Complex64, "c64", i32, "i32"),
    segment!(sum, Sum, Complex64, "c64", i64, "i64"),
    segment!(sum, Sum, Complex128, "c128", i32, "i32"),
    segment!(sum, Sum, Complex128, "c128", i64, "i64"),
    segment!(prod, Prod, f32, "f32", i32, "i32"),
    segment!(prod, Prod, f32, "f32", i64, "i64"),
    segment!(prod, Prod, f64, "f64", i32, "i32"),
    segment!(prod, Prod, f64, "f64", i64, "i64"),
    segment!(max, Max, f32, "f32", i32, "i32"),
    segment!(max, Max, f32, "f32", i64, "i64"),
    segment!(max, Max, f64, "f64", i32, "i32"),
    segment!(max, Max, f64, "f64", i64, "i64"),
    segment!(min, Min, f32, "f32", i32, "i32"),
    segment!(min, Min, f32, "f32", i64, "i64"),
    segment!(min, Min, f64, "f64", i32, "i32"),
    segment!(min, Min, f64, "f64", i64, "i64"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_kernel_table() {
        assert_eq!(KERNELS.len(), 4 + 8 + 12);
        let names: HashSet<_> = KERNELS.iter().map(|k| k.name).collect();
        assert_eq!(names.len(), KERNELS.len());
        assert!(names.contains("segment_fill_c128"));
        assert!(names.contains("unsorted_segment_sum_c64_i64"));
        assert!(names.contains("unsorted_segment_max_f32_i32"));
        assert!(!names.contains("unsorted_segment_prod_c64_i32"));
    }

    #[test]
    fn test_param_sizes() {
        let fill = KERNELS.iter().find(|k| k.name == "segment_fill_c128").unwrap();
        assert_eq!(fill.params, &[8, 16, 8]);
        let sum = KERNELS
            .iter()
            .find(|k| k.name == "unsorted_segment_sum_f32_i32")
            .unwrap();
        assert_eq!(sum.params, &[4, 4, 4, 8, 8, 8]);
    }
}
