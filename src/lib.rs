//! # segdrv
//!
//! **Resource-safe accelerator driver facade with unsorted segment reduction kernels.**
//!
//! segdrv wraps a vendor GPU driver's device, context, stream, event, memory and
//! module primitives in owned handles with explicit release, and ships an
//! unsorted segment reduction (`sum`, `prod`, `max`, `min`) built on top of it.
//!
//! ## Layers
//!
//! - [`runtime`]: the `Backend` trait (raw handles, raw statuses) with a CUDA
//!   implementation and a host software device
//! - [`driver`]: `Driver<B>` facade, `Context`, `ScopedActivateContext`, owned
//!   streams, events, modules and buffers, logging on every failure path
//! - [`ops`]: kernel launchers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use segdrv::prelude::*;
//!
//! Driver::<HostBackend>::init()?;
//! let device = Device::<HostBackend>::get(0)?;
//! let ctx = Context::create(&device, ContextOptions::default())?;
//!
//! let data = DeviceBuffer::from_slice(&ctx, &[1.0f32, 2.0, 3.0, 4.0])?;
//! let ids = DeviceBuffer::from_slice(&ctx, &[0i32, 1, 0, 1])?;
//! let mut out = DeviceBuffer::<HostBackend, f32>::alloc(&ctx, 2)?;
//!
//! unsorted_segment_sum(&ctx, &Stream::null(), &data, &ids, 2, &mut out)?;
//! assert_eq!(out.to_vec()?, vec![4.0, 6.0]);
//! ```
//!
//! ## Feature Flags
//!
//! - `cuda`: NVIDIA CUDA backend (compiles kernels with nvcc at build time)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod runtime;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::driver::{
        Context, Device, DeviceBuffer, Driver, Event, ScopedActivateContext, Stream,
    };
    pub use crate::dtype::{Complex64, Complex128, DType};
    pub use crate::error::{Error, Result};
    pub use crate::ops::{Reduction, unsorted_segment_reduce, unsorted_segment_sum};
    pub use crate::runtime::host::HostBackend;
    pub use crate::runtime::{Backend, ContextOptions, EventFlags, EventStatus, Status};

    #[cfg(feature = "cuda")]
    pub use crate::runtime::cuda::CudaBackend;
}
