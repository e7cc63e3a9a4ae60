//! Host-side atomic combiners
//!
//! These are the software device's equivalents of the GPU's `atomicAdd` family.
//! Floating point values are combined with a compare-and-swap loop over their
//! bit patterns. Complex values are combined one component at a time: each
//! component update is atomic, the pair as a whole is not, exactly like the
//! device code.

use super::{Complex64, Complex128, Element};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Element types that support a lock-free atomic add.
pub trait AtomicAccumulate: Element {
    /// Atomically add `value` into `*dest`.
    ///
    /// # Safety
    ///
    /// `dest` must be valid for reads and writes, aligned for `Self`, and every
    /// concurrent access to it must also go through these atomic combiners.
    unsafe fn atomic_add(dest: *mut Self, value: Self);
}

/// Real element types that additionally support atomic multiply, max and min.
pub trait AtomicOrdered: AtomicAccumulate + PartialOrd {
    /// Identity of `max` (most negative finite value)
    const LOWEST: Self;
    /// Identity of `min` (largest finite value)
    const HIGHEST: Self;

    /// Atomically multiply `*dest` by `value`.
    ///
    /// # Safety
    ///
    /// Same contract as [`AtomicAccumulate::atomic_add`].
    unsafe fn atomic_mul(dest: *mut Self, value: Self);

    /// Atomically store `max(*dest, value)`.
    ///
    /// # Safety
    ///
    /// Same contract as [`AtomicAccumulate::atomic_add`].
    unsafe fn atomic_max(dest: *mut Self, value: Self);

    /// Atomically store `min(*dest, value)`.
    ///
    /// # Safety
    ///
    /// Same contract as [`AtomicAccumulate::atomic_add`].
    unsafe fn atomic_min(dest: *mut Self, value: Self);
}

macro_rules! impl_atomic_float {
    ($float:ty, $atomic:ty, $bits:ty) => {
        impl $crate::dtype::atomic::FloatCas for $float {
            #[inline]
            unsafe fn update(dest: *mut Self, f: impl Fn(Self) -> Self) {
                // SAFETY: caller guarantees `dest` is valid and aligned; the float
                // and its bit-pattern integer have identical size and alignment.
                let cell = unsafe { <$atomic>::from_ptr(dest.cast::<$bits>()) };
                let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |bits| {
                    Some(f(<$float>::from_bits(bits)).to_bits())
                });
            }
        }

        impl AtomicAccumulate for $float {
            #[inline]
            unsafe fn atomic_add(dest: *mut Self, value: Self) {
                unsafe { <$float as FloatCas>::update(dest, |cur| cur + value) }
            }
        }

        impl AtomicOrdered for $float {
            const LOWEST: Self = <$float>::MIN;
            const HIGHEST: Self = <$float>::MAX;

            #[inline]
            unsafe fn atomic_mul(dest: *mut Self, value: Self) {
                unsafe { <$float as FloatCas>::update(dest, |cur| cur * value) }
            }

            #[inline]
            unsafe fn atomic_max(dest: *mut Self, value: Self) {
                unsafe { <$float as FloatCas>::update(dest, |cur| if value > cur { value } else { cur }) }
            }

            #[inline]
            unsafe fn atomic_min(dest: *mut Self, value: Self) {
                unsafe { <$float as FloatCas>::update(dest, |cur| if value < cur { value } else { cur }) }
            }
        }
    };
}

/// Compare-and-swap update of a float through its bit pattern.
pub(crate) trait FloatCas: Sized {
    /// # Safety
    ///
    /// Same contract as [`AtomicAccumulate::atomic_add`].
    unsafe fn update(dest: *mut Self, f: impl Fn(Self) -> Self);
}

impl_atomic_float!(f32, AtomicU32, u32);
impl_atomic_float!(f64, AtomicU64, u64);

macro_rules! impl_atomic_complex {
    ($name:ty, $float:ty) => {
        impl AtomicAccumulate for $name {
            #[inline]
            unsafe fn atomic_add(dest: *mut Self, value: Self) {
                // The struct is #[repr(C)] { re, im }, so it can be addressed as
                // two consecutive scalars.
                let scalars = dest.cast::<$float>();
                unsafe {
                    <$float>::atomic_add(scalars, value.re);
                    <$float>::atomic_add(scalars.add(1), value.im);
                }
            }
        }
    };
}

impl_atomic_complex!(Complex64, f32);
impl_atomic_complex!(Complex128, f64);
