//! Complex number element types
//!
//! `Complex64` and `Complex128` are stored in interleaved format (re, im),
//! matching the layout of CUDA's `float2` / `double2`. Because the layout is two
//! consecutive scalars, a device buffer of `Complex64` can be addressed as a
//! buffer of `f32` with twice the length, which is what the segment kernels rely
//! on when accumulating the components independently.

use bytemuck::{Pod, Zeroable};

macro_rules! impl_complex {
    (
        $name:ident,
        $float:ty,
        $doc_bits:literal,
        $doc_float_bits:literal,
        $doc_gpu_type:literal
    ) => {
        #[doc = concat!($doc_bits, "-bit complex number with ", $doc_float_bits, " real and imaginary parts")]
        ///
        #[doc = concat!("Interleaved `", stringify!($float), "` pair, laid out like ", $doc_gpu_type, ".")]
        #[repr(C)]
        #[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
        pub struct $name {
            /// Real part
            pub re: $float,
            /// Imaginary part
            pub im: $float,
        }

        impl $name {
            /// Additive identity, the fill value of a complex segment sum
            pub const ZERO: Self = Self { re: 0.0, im: 0.0 };

            /// Create a new complex number
            #[inline]
            pub const fn new(re: $float, im: $float) -> Self {
                Self { re, im }
            }
        }
    };
}

impl_complex!(Complex64, f32, "64", "f32", "CUDA float2");
impl_complex!(Complex128, f64, "128", "f64", "CUDA double2");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complex_pod_layout() {
        let values = [Complex64::new(1.0, 2.0), Complex64::new(3.0, 4.0)];
        let scalars: &[f32] = bytemuck::cast_slice(&values);
        assert_eq!(scalars, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(std::mem::size_of::<Complex128>(), 16);
        assert_eq!(Complex128::ZERO, Complex128::default());
    }
}
