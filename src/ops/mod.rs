//! Device operations
//!
//! Launchers that drive the kernels in `runtime::host::kernels` and
//! `runtime/cuda/kernels` through the [`Driver`](crate::driver::Driver) facade.
//!
//! ```text
//! ops::segment_reduction
//!   └── Driver<B>          (scoped context activation, logging, typed errors)
//!         └── Backend      (host software device or CUDA)
//! ```

pub mod segment_reduction;

pub use segment_reduction::{
    Reduction, SEGMENT_REDUCTION_ABI_VERSION, SEGMENT_REDUCTION_IMAGE, SegmentReducible,
    launch_unsorted_segment_reduction, unsorted_segment_reduce, unsorted_segment_sum,
};
