//! Data type system for device buffers
//!
//! This module provides the `DType` enum naming the element and segment-id
//! types the kernels are instantiated for, the `Element` / `SegmentIndex`
//! traits mapping Rust types onto them, and the host-side atomic combiners used
//! by the software device.

pub mod atomic;
pub mod complex;
mod element;

pub use atomic::{AtomicAccumulate, AtomicOrdered};
pub use complex::{Complex64, Complex128};
pub use element::{Element, SegmentIndex};

use std::fmt;

/// Data type of a device buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DType {
    /// 64-bit floating point
    F64,
    /// 32-bit floating point
    F32,
    /// 64-bit signed integer (segment ids)
    I64,
    /// 32-bit signed integer (segment ids)
    I32,
    /// 64-bit complex (two f32: re, im)
    Complex64,
    /// 128-bit complex (two f64: re, im)
    Complex128,
}

impl DType {
    /// Suffix used in kernel symbol names (`unsorted_segment_sum_f32_i64`).
    pub const fn kernel_suffix(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Complex64 => "c64",
            Self::Complex128 => "c128",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel_suffix())
    }
}
