//! Element traits for mapping Rust types to DType

use super::{Complex64, Complex128, DType};
use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;

/// Trait for types that can be stored in a reduction buffer
///
/// `Pod` covers byte-level transfers and kernel parameter packing.
pub trait Element: Copy + Send + Sync + Pod + Zeroable + Debug + PartialEq + 'static {
    /// The corresponding DType for this Rust type
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($t:ty, $dtype:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;
        }
    };
}

impl_element!(f64, F64);
impl_element!(f32, F32);
impl_element!(Complex64, Complex64);
impl_element!(Complex128, Complex128);

/// Signed integer type used for segment ids and kernel dimensions.
///
/// Kernels are instantiated for both 32- and 64-bit ids; dimensions are passed
/// to the device in the same width as the ids.
pub trait SegmentIndex: Copy + Send + Sync + Pod + Debug + PartialEq + 'static {
    /// The corresponding DType for this Rust type
    const DTYPE: DType;

    /// Widen to i64.
    fn to_i64(self) -> i64;

    /// Narrow a host dimension; `None` if it does not fit.
    fn from_usize(n: usize) -> Option<Self>;
}

impl SegmentIndex for i32 {
    const DTYPE: DType = DType::I32;

    #[inline]
    fn to_i64(self) -> i64 {
        self as i64
    }

    #[inline]
    fn from_usize(n: usize) -> Option<Self> {
        i32::try_from(n).ok()
    }
}

impl SegmentIndex for i64 {
    const DTYPE: DType = DType::I64;

    #[inline]
    fn to_i64(self) -> i64 {
        self
    }

    #[inline]
    fn from_usize(n: usize) -> Option<Self> {
        i64::try_from(n).ok()
    }
}
