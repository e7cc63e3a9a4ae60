//! Resource-safe driver facade
//!
//! `Driver<B>` is the single entry point through which the rest of the crate
//! talks to an accelerator. It is written once against [`Backend`] and adds
//! what the raw driver API lacks:
//!
//! - every context-bound call runs under a [`ScopedActivateContext`], so the
//!   caller's context is current for the duration of the call and whatever was
//!   current before (possibly nothing) is restored afterwards
//! - every failure is logged with the operation name and the numeric status,
//!   then reported as a typed [`Error`](crate::error::Error)
//! - streams, events, modules and buffers are owned wrappers with explicit
//!   release; destroying one nulls the caller's handle and dropping one that was
//!   never released only logs the leak, it never calls into the driver
//!
//! # Return conventions
//!
//! Allocation that fails returns an empty result (`None` / `false`), with a
//! `try_*` variant that exposes the error. Synchronous transfers and
//! synchronization return `Result`. Stream-ordered (asynchronous) operations
//! return `bool`: `true` only means the work was queued, execution errors
//! surface at the next synchronization or poll.

mod context;
mod device;
mod memory;
mod module;
mod scoped;
mod stream;

pub use context::Context;
pub use device::{Device, DeviceProperties};
pub use memory::DeviceBuffer;
pub use module::{Function, Module};
pub use scoped::ScopedActivateContext;
pub use stream::{Event, Stream};

use crate::error::{Error, Result};
use crate::runtime::{Backend, DriverResult, RawContext, Status};
use std::marker::PhantomData;

/// Driver operation facade over backend `B`.
///
/// A zero-sized namespace: all operations are associated functions, the state
/// lives in the driver itself and in the handles passed in.
#[derive(Debug)]
pub struct Driver<B: Backend>(PhantomData<B>);

// ============================================================================
// Diagnostics
// ============================================================================

/// Log a failed driver call.
#[cold]
#[inline(never)]
pub(crate) fn log_failure(backend: &'static str, op: &'static str, status: Status) {
    tracing::error!(
        backend,
        op,
        code = status.code(),
        "driver call {} failed: {}",
        op,
        status
    );
}

/// Pass a raw driver result through, logging it if it failed.
#[inline]
pub(crate) fn logged<B: Backend, T>(op: &'static str, result: DriverResult<T>) -> DriverResult<T> {
    if let Err(status) = &result {
        log_failure(B::NAME, op, *status);
    }
    result
}

// ============================================================================
// Context-independent operations
// ============================================================================

impl<B: Backend> Driver<B> {
    /// Initialize the driver. Idempotent.
    pub fn init() -> Result<()> {
        logged::<B, _>("init", B::init()).map_err(|status| Error::Initialization {
            op: "init",
            status,
        })?;
        tracing::debug!(backend = B::NAME, "driver initialized");
        Ok(())
    }

    /// Driver version, e.g. `12040` for 12.4.
    pub fn driver_version() -> Result<i32> {
        logged::<B, _>("driver_version", B::driver_version()).map_err(|status| Error::Query {
            op: "driver_version",
            status,
        })
    }

    /// Raw context current on the calling thread, null if none.
    pub fn current_context() -> RawContext {
        match logged::<B, _>("current_context", B::ctx_get_current()) {
            Ok(ctx) => ctx,
            Err(_) => RawContext::NULL,
        }
    }
}
