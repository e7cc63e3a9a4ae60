//! Host-executable kernels
//!
//! One submodule per kernel image. Names and parameter layouts are identical to
//! the CUDA sources under `src/runtime/cuda/kernels/`.

pub mod segment_reduction;
