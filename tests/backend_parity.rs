//! Backend parity: the CUDA kernels must agree with the host device.
//!
//! Requires the `cuda` feature and a visible CUDA device.
#![cfg(feature = "cuda")]

mod common;

use common::assert_allclose_f64;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use segdrv::driver::{Context, Device, DeviceBuffer, Driver, Stream};
use segdrv::dtype::{Complex64, DType, Element, SegmentIndex};
use segdrv::ops::segment_reduction::{SegmentReducible, supports};
use segdrv::ops::{Reduction, unsorted_segment_reduce};
use segdrv::runtime::cuda::CudaBackend;
use segdrv::runtime::host::HostBackend;
use segdrv::runtime::{Backend, ContextOptions};
use std::sync::{Arc, Mutex, OnceLock};

// CUDA contexts are heavy; run the parity cases one at a time.
static CUDA_BACKEND_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn with_cuda_backend<F: FnOnce(&Arc<Context<CudaBackend>>)>(f: F) {
    let _guard = CUDA_BACKEND_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if Driver::<CudaBackend>::init().is_err() {
        eprintln!("skipping: no CUDA driver");
        return;
    }
    let device = Device::<CudaBackend>::get(0).expect("cuda device 0");
    let ctx = Context::create(&device, ContextOptions::default()).expect("cuda context");
    f(&ctx);
    ctx.destroy().expect("destroy cuda context");
}

fn host_context() -> Arc<Context<HostBackend>> {
    Driver::<HostBackend>::init().expect("host driver init");
    let device = Device::get(0).expect("host device");
    Context::create(&device, ContextOptions::default()).expect("host context")
}

fn run<B, T, I>(
    ctx: &Arc<Context<B>>,
    reduction: Reduction,
    data: &[T],
    ids: &[I],
    output_rows: usize,
    inner: usize,
) -> Vec<T>
where
    B: Backend,
    T: SegmentReducible,
    I: SegmentIndex,
{
    let d_data = DeviceBuffer::from_slice(ctx, data).unwrap();
    let d_ids = DeviceBuffer::from_slice(ctx, ids).unwrap();
    let mut out = DeviceBuffer::<B, T>::alloc(ctx, output_rows * inner).unwrap();
    unsorted_segment_reduce(ctx, &Stream::null(), reduction, &d_data, &d_ids, output_rows, &mut out)
        .unwrap();
    Driver::synchronize_context(ctx).unwrap();
    let result = out.to_vec().unwrap();
    out.free().unwrap();
    d_data.free().unwrap();
    d_ids.free().unwrap();
    result
}

fn random_case(seed: u64, outer: usize, inner: usize, rows: usize) -> (Vec<f64>, Vec<i64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let ids = (0..outer)
        .map(|_| rng.random_range(-2..rows as i64 + 2))
        .collect();
    let data = (0..outer * inner).map(|_| rng.random_range(-4.0..4.0)).collect();
    (data, ids)
}

#[test]
fn test_segment_reductions_f64_parity() {
    let host = host_context();
    let (data, ids) = random_case(7, 4096, 5, 33);
    with_cuda_backend(|cuda| {
        for reduction in [Reduction::Sum, Reduction::Max, Reduction::Min] {
            assert!(supports(reduction, f64::DTYPE));
            let expected = run(&host, reduction, &data, &ids, 33, 5);
            let actual = run(cuda, reduction, &data, &ids, 33, 5);
            assert_allclose_f64(&actual, &expected, 1e-12, 1e-12, reduction.name());
        }
    });
    host.destroy().unwrap();
}

#[test]
fn test_segment_sum_f32_i32_parity() {
    let host = host_context();
    let (data, ids) = random_case(11, 1000, 3, 10);
    let data: Vec<f32> = data.iter().map(|&x| x as f32).collect();
    let ids: Vec<i32> = ids.iter().map(|&i| i as i32).collect();
    with_cuda_backend(|cuda| {
        let expected = run(&host, Reduction::Sum, &data, &ids, 10, 3);
        let actual = run(cuda, Reduction::Sum, &data, &ids, 10, 3);
        // Atomic accumulation order differs between devices.
        common::assert_allclose_f32(&actual, &expected, 1e-4, 1e-4, "sum f32");
    });
    host.destroy().unwrap();
}

#[test]
fn test_complex_sum_parity() {
    assert_eq!(Complex64::DTYPE, DType::Complex64);
    let host = host_context();
    let data: Vec<Complex64> = (0..64)
        .map(|i| Complex64::new(i as f32 * 0.5, -(i as f32)))
        .collect();
    let ids: Vec<i32> = (0..32).map(|i| (i * 7) % 5).collect();
    with_cuda_backend(|cuda| {
        let expected = run(&host, Reduction::Sum, &data, &ids, 5, 2);
        let actual = run(cuda, Reduction::Sum, &data, &ids, 5, 2);
        assert_eq!(actual, expected);
    });
    host.destroy().unwrap();
}
