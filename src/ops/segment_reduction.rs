//! Unsorted segment reduction
//!
//! Reduces the rows of an `[outer_dim, inner_dim]` input into an
//! `[output_rows, inner_dim]` output. Row `i` of the input is combined into row
//! `segment_ids[i]` of the output; ids need not be sorted or contiguous, and ids
//! that are negative or `>= output_rows` drop their row.
//!
//! Two launches on the caller's stream:
//!
//! 1. `segment_fill_<T>` writes the reduction identity over the whole output.
//! 2. `unsorted_segment_<op>_<T>_<I>` walks the input with a grid-stride loop and
//!    atomically combines every element into its output slot.
//!
//! Both launches return as soon as they are queued. Complex sums are
//! accumulated one component at a time, so a concurrent reader may observe the
//! real part of an update before its imaginary part; after the stream is
//! synchronized the result is complete.

use crate::driver::{Context, DeviceBuffer, Driver, Stream};
use crate::dtype::{AtomicAccumulate, Complex64, Complex128, DType, SegmentIndex};
use crate::error::{Error, Result};
use crate::runtime::host::kernels::segment_reduction::{GLOBALS, KERNELS};
pub use crate::runtime::host::kernels::segment_reduction::SEGMENT_REDUCTION_ABI_VERSION;
use crate::runtime::kernel::{indexed_kernel_name, kernel_name, launch_config_1d};
use crate::runtime::{Backend, DevicePtr, KernelImage};
use std::ffi::c_void;
use std::fmt;

/// Kernel image holding the fill and segment reduction kernels
pub static SEGMENT_REDUCTION_IMAGE: KernelImage = KernelImage {
    name: "segment_reduction",
    host: KERNELS,
    globals: GLOBALS,
};

// ============================================================================
// Reductions
// ============================================================================

/// Atomic-combinable reduction operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reduction {
    /// Sum of the segment; empty segments are zero
    Sum,
    /// Product of the segment; empty segments are one
    Prod,
    /// Maximum of the segment; empty segments hold the lowest finite value
    Max,
    /// Minimum of the segment; empty segments hold the highest finite value
    Min,
}

impl Reduction {
    /// Operator name used in kernel symbols
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Prod => "prod",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    fn op_name(self) -> &'static str {
        match self {
            Self::Sum => "unsorted_segment_sum",
            Self::Prod => "unsorted_segment_prod",
            Self::Max => "unsorted_segment_max",
            Self::Min => "unsorted_segment_min",
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element types the segment kernels are instantiated for.
pub trait SegmentReducible: AtomicAccumulate {
    /// Value the output is filled with before accumulation, `None` if the
    /// reduction is not available for this type.
    fn identity(reduction: Reduction) -> Option<Self>;
}

macro_rules! impl_segment_real {
    ($float:ty) => {
        impl SegmentReducible for $float {
            fn identity(reduction: Reduction) -> Option<Self> {
                Some(match reduction {
                    Reduction::Sum => 0.0,
                    Reduction::Prod => 1.0,
                    Reduction::Max => <$float>::MIN,
                    Reduction::Min => <$float>::MAX,
                })
            }
        }
    };
}

macro_rules! impl_segment_complex {
    ($complex:ty) => {
        impl SegmentReducible for $complex {
            fn identity(reduction: Reduction) -> Option<Self> {
                match reduction {
                    Reduction::Sum => Some(<$complex>::ZERO),
                    // Complex values have no order and no componentwise atomic product
                    Reduction::Prod | Reduction::Max | Reduction::Min => None,
                }
            }
        }
    };
}

impl_segment_real!(f32);
impl_segment_real!(f64);
impl_segment_complex!(Complex64);
impl_segment_complex!(Complex128);

// ============================================================================
// Launchers
// ============================================================================

fn narrow<I: SegmentIndex>(value: usize, arg: &'static str) -> Result<I> {
    I::from_usize(value).ok_or_else(|| {
        Error::invalid_argument(
            arg,
            format!("{} does not fit in a {} segment id", value, I::DTYPE),
        )
    })
}

/// Queue an unsorted segment reduction over raw device addresses.
///
/// Fills all `output_rows * inner_dim` output elements with the identity of
/// `reduction`, then combines the `outer_dim * inner_dim` input elements into
/// them. Returns after the fill when the input is empty. Does nothing when the
/// output is empty.
///
/// # Safety
///
/// `segment_ids` must address `outer_dim` ids of type `I`, `input`
/// `outer_dim * inner_dim` elements of type `T` and `output`
/// `output_rows * inner_dim` elements of type `T`, all visible to `context` and
/// live until the work queued on `stream` has run.
#[allow(clippy::too_many_arguments)]
pub unsafe fn launch_unsorted_segment_reduction<B, T, I>(
    context: &Context<B>,
    stream: &Stream<B>,
    reduction: Reduction,
    outer_dim: usize,
    inner_dim: usize,
    output_rows: usize,
    segment_ids: DevicePtr,
    input: DevicePtr,
    output: DevicePtr,
) -> Result<()>
where
    B: Backend,
    T: SegmentReducible,
    I: SegmentIndex,
{
    let identity = T::identity(reduction)
        .ok_or_else(|| Error::unsupported_dtype(T::DTYPE, reduction.op_name()))?;

    let output_total = output_rows.checked_mul(inner_dim).ok_or_else(|| {
        Error::invalid_argument("output_rows", "output size overflows usize")
    })?;
    if output_total == 0 {
        return Ok(());
    }
    let input_total = outer_dim.checked_mul(inner_dim).ok_or_else(|| {
        Error::invalid_argument("outer_dim", "input size overflows usize")
    })?;
    // Reject dimensions the index type cannot carry before the output is touched.
    let mut outer: I = narrow(outer_dim, "outer_dim")?;
    let mut inner: I = narrow(inner_dim, "inner_dim")?;
    let mut rows: I = narrow(output_rows, "output_rows")?;
    let limits = context.launch_limits()?;

    // Step 1: identity fill over the whole output
    let fill = Driver::get_or_load_function(
        context,
        &SEGMENT_REDUCTION_IMAGE,
        &kernel_name("segment_fill", T::DTYPE),
    )?;
    let Some(fill_config) = launch_config_1d(output_total as u64, limits) else {
        return Ok(());
    };
    let mut n = output_total as u64;
    let mut value = identity;
    let mut out = output;
    let fill_params = [
        &mut n as *mut u64 as *mut c_void,
        &mut value as *mut T as *mut c_void,
        &mut out as *mut DevicePtr as *mut c_void,
    ];
    // SAFETY: parameter types match `segment_fill_<T>(u64, T, T*)`; the caller
    // guarantees `output` holds `output_total` elements.
    unsafe { Driver::launch_with_config(context, &fill, fill_config, stream, &fill_params)? };

    // Step 2: nothing to accumulate
    let Some(config) = launch_config_1d(input_total as u64, limits) else {
        return Ok(());
    };

    // Step 3: scatter-combine
    let mut ids = segment_ids;
    let mut data = input;
    let mut out = output;
    let params = [
        &mut outer as *mut I as *mut c_void,
        &mut inner as *mut I as *mut c_void,
        &mut rows as *mut I as *mut c_void,
        &mut ids as *mut DevicePtr as *mut c_void,
        &mut data as *mut DevicePtr as *mut c_void,
        &mut out as *mut DevicePtr as *mut c_void,
    ];
    let name = indexed_kernel_name(reduction.op_name(), T::DTYPE, I::DTYPE);
    let function = Driver::get_or_load_function(context, &SEGMENT_REDUCTION_IMAGE, &name)?;
    tracing::trace!(
        backend = B::NAME,
        context = context.id(),
        outer_dim,
        inner_dim,
        output_rows,
        "launching {} on {:?} blocks of {:?}",
        name,
        config.grid,
        config.block
    );
    // SAFETY: parameter types match `unsorted_segment_<op>_<T>_<I>`; the caller
    // guarantees the three ranges.
    unsafe { Driver::launch_with_config(context, &function, config, stream, &params) }
}

/// Queue an unsorted segment reduction of `data` into `output`.
///
/// `data` holds `segment_ids.len()` rows of equal width; `output` must hold
/// `output_rows` rows of that width. When `data` or `segment_ids` is empty the
/// output is only filled with the identity.
pub fn unsorted_segment_reduce<B, T, I>(
    context: &Context<B>,
    stream: &Stream<B>,
    reduction: Reduction,
    data: &DeviceBuffer<B, T>,
    segment_ids: &DeviceBuffer<B, I>,
    output_rows: usize,
    output: &mut DeviceBuffer<B, T>,
) -> Result<()>
where
    B: Backend,
    T: SegmentReducible,
    I: SegmentIndex,
{
    if output.is_empty() {
        return Ok(());
    }
    if output_rows == 0 || output.len() % output_rows != 0 {
        return Err(Error::invalid_argument(
            "output_rows",
            format!(
                "{} rows do not evenly divide an output of {} elements",
                output_rows,
                output.len()
            ),
        ));
    }
    let inner_dim = output.len() / output_rows;

    let outer_dim = if data.is_empty() || segment_ids.is_empty() {
        0
    } else {
        if data.len() % segment_ids.len() != 0 {
            return Err(Error::invalid_argument(
                "data",
                format!(
                    "{} elements are not a whole number of rows for {} segment ids",
                    data.len(),
                    segment_ids.len()
                ),
            ));
        }
        if data.len() / segment_ids.len() != inner_dim {
            return Err(Error::invalid_argument(
                "output",
                format!(
                    "row width {} does not match input row width {}",
                    inner_dim,
                    data.len() / segment_ids.len()
                ),
            ));
        }
        segment_ids.len()
    };

    // SAFETY: the lengths above bound every range the kernels touch.
    unsafe {
        launch_unsorted_segment_reduction::<B, T, I>(
            context,
            stream,
            reduction,
            outer_dim,
            inner_dim,
            output_rows,
            segment_ids.ptr(),
            data.ptr(),
            output.ptr(),
        )
    }
}

/// [`unsorted_segment_reduce`] with [`Reduction::Sum`].
pub fn unsorted_segment_sum<B, T, I>(
    context: &Context<B>,
    stream: &Stream<B>,
    data: &DeviceBuffer<B, T>,
    segment_ids: &DeviceBuffer<B, I>,
    output_rows: usize,
    output: &mut DeviceBuffer<B, T>,
) -> Result<()>
where
    B: Backend,
    T: SegmentReducible,
    I: SegmentIndex,
{
    unsorted_segment_reduce(
        context,
        stream,
        Reduction::Sum,
        data,
        segment_ids,
        output_rows,
        output,
    )
}

/// Whether a reduction kernel exists for `dtype`.
pub fn supports(reduction: Reduction, dtype: DType) -> bool {
    match dtype {
        DType::F32 | DType::F64 => true,
        DType::Complex64 | DType::Complex128 => reduction == Reduction::Sum,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities() {
        assert_eq!(f32::identity(Reduction::Sum), Some(0.0));
        assert_eq!(f64::identity(Reduction::Prod), Some(1.0));
        assert_eq!(f32::identity(Reduction::Max), Some(f32::MIN));
        assert_eq!(f64::identity(Reduction::Min), Some(f64::MAX));
        assert_eq!(Complex64::identity(Reduction::Sum), Some(Complex64::ZERO));
        assert_eq!(Complex128::identity(Reduction::Max), None);
    }

    #[test]
    fn test_every_supported_kernel_is_in_the_image() {
        let reductions = [Reduction::Sum, Reduction::Prod, Reduction::Max, Reduction::Min];
        let dtypes = [DType::F32, DType::F64, DType::Complex64, DType::Complex128];
        for dtype in dtypes {
            assert!(
                SEGMENT_REDUCTION_IMAGE
                    .host_kernel(&kernel_name("segment_fill", dtype))
                    .is_some()
            );
            for reduction in reductions {
                for index in [DType::I32, DType::I64] {
                    let name = indexed_kernel_name(reduction.op_name(), dtype, index);
                    assert_eq!(
                        SEGMENT_REDUCTION_IMAGE.host_kernel(&name).is_some(),
                        supports(reduction, dtype),
                        "{}",
                        name
                    );
                }
            }
        }
    }
}
