//! Common test utilities
#![allow(dead_code)]

use segdrv::driver::{Context, Device, DeviceBuffer, Driver};
use segdrv::runtime::host::HostBackend;
use segdrv::runtime::{Backend, ContextOptions, RawContext};
use std::sync::Arc;

/// Initialize the host driver and create a context on device `ordinal`.
///
/// The context is not left current on the calling thread.
pub fn create_host_context(ordinal: i32) -> Arc<Context<HostBackend>> {
    Driver::<HostBackend>::init().expect("host driver init");
    let device = Device::get(ordinal).expect("host device");
    Context::create(&device, ContextOptions::default()).expect("host context")
}

/// Unbind whatever context is current on this thread.
pub fn clear_current_context() {
    HostBackend::ctx_set_current(RawContext::NULL).expect("unbind current context");
}

/// Upload `data` into a new buffer on `ctx`.
pub fn upload<T: bytemuck::Pod>(
    ctx: &Arc<Context<HostBackend>>,
    data: &[T],
) -> DeviceBuffer<HostBackend, T> {
    DeviceBuffer::from_slice(ctx, data).expect("upload")
}

/// Download and free `buffer`.
pub fn download<T: bytemuck::Pod>(buffer: DeviceBuffer<HostBackend, T>) -> Vec<T> {
    let data = buffer.to_vec().expect("download");
    buffer.free().expect("free");
    data
}

/// Assert two f64 slices are close within tolerance
///
/// Uses the formula: |a - b| <= atol + rtol * |b|
pub fn assert_allclose_f64(a: &[f64], b: &[f64], rtol: f64, atol: f64, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Assert two f32 slices are close within tolerance
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Host reference for an unsorted segment sum over `[ids.len(), inner]` rows.
pub fn reference_segment_sum(data: &[f64], ids: &[i64], inner: usize, output_rows: usize) -> Vec<f64> {
    let mut out = vec![0.0; output_rows * inner];
    for (row, &id) in ids.iter().enumerate() {
        if id < 0 || id as usize >= output_rows {
            continue;
        }
        for j in 0..inner {
            out[id as usize * inner + j] += data[row * inner + j];
        }
    }
    out
}
