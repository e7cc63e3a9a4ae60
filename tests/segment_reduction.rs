//! Integration tests for unsorted segment reduction on the host device
//!
//! Tests verify:
//! - Sum of contributions per segment, including unsorted and repeated ids
//! - Negative and out-of-range ids are dropped without touching memory
//! - The identity fill makes reuse of an output buffer idempotent
//! - Empty input, empty ids and empty output
//! - Complex, product, max and min variants, 32- and 64-bit ids

mod common;

use common::{
    assert_allclose_f32, assert_allclose_f64, create_host_context, download,
    reference_segment_sum, upload,
};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use segdrv::driver::{Context, DeviceBuffer, Driver, Stream};
use segdrv::dtype::{Complex64, Complex128, SegmentIndex};
use segdrv::error::Error;
use segdrv::ops::{
    Reduction, launch_unsorted_segment_reduction, unsorted_segment_reduce, unsorted_segment_sum,
};
use segdrv::runtime::host::HostBackend;
use std::sync::Arc;

// ============================================================================
// Concrete scenarios
// ============================================================================

#[test]
fn test_sum_basic_scenario() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[1.0f32, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]);
    let ids = upload(&ctx, &[0i32, 1, 0, 2]);
    let mut out = DeviceBuffer::<HostBackend, f32>::alloc(&ctx, 6).unwrap();

    unsorted_segment_sum(&ctx, &stream, &data, &ids, 3, &mut out).unwrap();
    Driver::synchronize_stream(&ctx, &stream).unwrap();

    assert_eq!(download(out), vec![4.0, 4.0, 2.0, 2.0, 4.0, 4.0]);
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_out_of_range_ids_are_dropped() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[10.0f64, 20.0, 30.0, 40.0]);
    let ids = upload(&ctx, &[0i32, -1, 5, 1]);
    let mut out = DeviceBuffer::<HostBackend, f64>::alloc(&ctx, 2).unwrap();

    unsorted_segment_sum(&ctx, &stream, &data, &ids, 2, &mut out).unwrap();
    // The context stays healthy: no illegal address was raised.
    Driver::synchronize_context(&ctx).unwrap();

    assert_eq!(download(out), vec![10.0, 40.0]);
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_zero_output_rows_is_trivial() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[1.0f32, 2.0]);
    let ids = upload(&ctx, &[0i32, 0]);
    let mut out = DeviceBuffer::<HostBackend, f32>::alloc(&ctx, 0).unwrap();

    unsorted_segment_sum(&ctx, &stream, &data, &ids, 0, &mut out).unwrap();
    assert!(download(out).is_empty());
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn test_random_ids_match_reference() {
    let ctx = create_host_context(0);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let outer = 1000;
    let inner = 7;
    let output_rows = 13;
    let ids: Vec<i64> = (0..outer).map(|_| rng.random_range(-3..16)).collect();
    let data: Vec<f64> = (0..outer * inner).map(|_| rng.random_range(-1.0..1.0)).collect();
    let expected = reference_segment_sum(&data, &ids, inner, output_rows);

    let d_data = upload(&ctx, &data);
    let d_ids = upload(&ctx, &ids);
    let mut out = DeviceBuffer::<HostBackend, f64>::alloc(&ctx, output_rows * inner).unwrap();

    Driver::with_stream(&ctx, |stream| {
        unsorted_segment_sum(&ctx, stream, &d_data, &d_ids, output_rows, &mut out)
    })
    .unwrap();

    assert_allclose_f64(&download(out), &expected, 1e-12, 1e-12, "random segment sum");
    d_data.free().unwrap();
    d_ids.free().unwrap();
    ctx.destroy().unwrap();
}

/// Sum `data` into `output_rows` rows on a fresh stream and download the result.
fn segment_sum_rows<I: SegmentIndex>(
    ctx: &Arc<Context<HostBackend>>,
    data: &[f64],
    ids: &[I],
    output_rows: usize,
    inner: usize,
) -> Vec<f64> {
    let d_data = upload(ctx, data);
    let d_ids = upload(ctx, ids);
    let mut out = DeviceBuffer::<HostBackend, f64>::alloc(ctx, output_rows * inner).unwrap();
    Driver::with_stream(ctx, |stream| {
        unsorted_segment_sum(ctx, stream, &d_data, &d_ids, output_rows, &mut out)
    })
    .unwrap();
    d_data.free().unwrap();
    d_ids.free().unwrap();
    download(out)
}

/// Rows whose id is out of range must contribute nothing, whatever the id.
fn check_extreme_ids_are_dropped<I: SegmentIndex>(extremes: [I; 4], in_range: [I; 4]) {
    let ctx = create_host_context(0);
    let inner = 3;
    let output_rows = 4;

    // Interleave in-range and extreme ids so dropped rows sit between kept ones.
    let ids: Vec<I> = in_range
        .iter()
        .zip(extremes.iter())
        .flat_map(|(&keep, &drop)| [keep, drop])
        .collect();
    let data: Vec<f64> = (0..ids.len() * inner).map(|i| i as f64 + 1.0).collect();

    let kept_ids: Vec<I> = ids.iter().step_by(2).copied().collect();
    let kept_data: Vec<f64> = data
        .chunks(inner)
        .step_by(2)
        .flatten()
        .copied()
        .collect();

    let with_extremes = segment_sum_rows(&ctx, &data, &ids, output_rows, inner);
    let filtered = segment_sum_rows(&ctx, &kept_data, &kept_ids, output_rows, inner);
    assert_eq!(with_extremes, filtered);
    // Row 0 receives kept rows 0 and 2 (data rows 0 and 4).
    assert_eq!(&with_extremes[..inner], &[14.0, 16.0, 18.0]);
    ctx.destroy().unwrap();
}

#[test]
fn test_extreme_i64_ids_match_filtered_input() {
    check_extreme_ids_are_dropped::<i64>([i64::MAX, i64::MIN, 4, -1], [0, 1, 0, 3]);
}

#[test]
fn test_extreme_i32_ids_match_filtered_input() {
    check_extreme_ids_are_dropped::<i32>([i32::MIN, i32::MAX, -2, 4], [0, 1, 0, 3]);
}

#[test]
fn test_reused_output_is_refilled() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[1.0f32, 2.0, 3.0]);
    let ids = upload(&ctx, &[1i32, 1, 0]);
    let mut out = DeviceBuffer::<HostBackend, f32>::alloc(&ctx, 2).unwrap();
    out.copy_from_host(&[100.0, 100.0]).unwrap();

    for _ in 0..3 {
        unsorted_segment_sum(&ctx, &stream, &data, &ids, 2, &mut out).unwrap();
        Driver::synchronize_stream(&ctx, &stream).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![3.0, 3.0]);
    }

    out.free().unwrap();
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_empty_input_leaves_zero_output() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = DeviceBuffer::<HostBackend, f64>::alloc(&ctx, 0).unwrap();
    let ids = DeviceBuffer::<HostBackend, i32>::alloc(&ctx, 0).unwrap();
    let mut out = upload(&ctx, &[7.0f64; 6]);

    unsorted_segment_sum(&ctx, &stream, &data, &ids, 3, &mut out).unwrap();
    Driver::synchronize_stream(&ctx, &stream).unwrap();

    assert_eq!(download(out), vec![0.0; 6]);
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_all_ids_out_of_range() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[1.0f32; 8]);
    let ids = upload(&ctx, &[-5i64, 4, 9, i64::MAX]);
    let mut out = DeviceBuffer::<HostBackend, f32>::alloc(&ctx, 8).unwrap();

    unsorted_segment_sum(&ctx, &stream, &data, &ids, 4, &mut out).unwrap();
    Driver::synchronize_stream(&ctx, &stream).unwrap();

    assert_eq!(download(out), vec![0.0; 8]);
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_dimension_too_wide_for_ids_leaves_output_untouched() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[1.0f32]);
    let ids = upload(&ctx, &[0i32]);
    let out = upload(&ctx, &[7.0f32, 7.0]);

    // SAFETY: the dimensions are rejected before any kernel is queued.
    let err = unsafe {
        launch_unsorted_segment_reduction::<HostBackend, f32, i32>(
            &ctx,
            &stream,
            Reduction::Sum,
            1,
            1,
            i32::MAX as usize + 1,
            ids.ptr(),
            data.ptr(),
            out.ptr(),
        )
    }
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { arg: "output_rows", .. }));

    Driver::synchronize_context(&ctx).unwrap();
    assert_eq!(download(out), vec![7.0, 7.0]);
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_mismatched_shapes_are_rejected() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[1.0f32; 5]);
    let ids = upload(&ctx, &[0i32, 1]);
    let mut out = DeviceBuffer::<HostBackend, f32>::alloc(&ctx, 4).unwrap();

    let err = unsorted_segment_sum(&ctx, &stream, &data, &ids, 2, &mut out).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { arg: "data", .. }));

    let err = unsorted_segment_sum(&ctx, &stream, &data, &ids, 3, &mut out).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { arg: "output_rows", .. }));

    out.free().unwrap();
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

// ============================================================================
// Element types and reductions
// ============================================================================

#[test]
fn test_complex64_sum_is_componentwise() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(
        &ctx,
        &[
            Complex64::new(1.0, -1.0),
            Complex64::new(2.0, 0.5),
            Complex64::new(-3.0, 4.0),
            Complex64::new(0.25, 0.25),
        ],
    );
    let ids = upload(&ctx, &[1i32, 0, 1, 1]);
    let mut out = DeviceBuffer::<HostBackend, Complex64>::alloc(&ctx, 2).unwrap();

    unsorted_segment_sum(&ctx, &stream, &data, &ids, 2, &mut out).unwrap();
    Driver::synchronize_stream(&ctx, &stream).unwrap();

    assert_eq!(
        download(out),
        vec![Complex64::new(2.0, 0.5), Complex64::new(-1.75, 3.25)]
    );
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_complex128_many_contributions() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let n = 4096;
    let data = upload(&ctx, &vec![Complex128::new(0.5, -2.0); n]);
    let ids = upload(&ctx, &(0..n as i64).map(|i| i % 3).collect::<Vec<_>>());
    let mut out = DeviceBuffer::<HostBackend, Complex128>::alloc(&ctx, 3).unwrap();

    unsorted_segment_sum(&ctx, &stream, &data, &ids, 3, &mut out).unwrap();
    Driver::synchronize_stream(&ctx, &stream).unwrap();

    let counts = [1366.0, 1365.0, 1365.0];
    let expected: Vec<_> = counts
        .iter()
        .map(|&c| Complex128::new(0.5 * c, -2.0 * c))
        .collect();
    assert_eq!(download(out), expected);
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_prod_max_min() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[2.0f32, -1.0, 3.0, 4.0, 0.5, 8.0]);
    let ids = upload(&ctx, &[0i32, 0, 1, 0, 1, 1]);

    let run = |reduction: Reduction| {
        let mut out = DeviceBuffer::<HostBackend, f32>::alloc(&ctx, 3).unwrap();
        unsorted_segment_reduce(&ctx, &stream, reduction, &data, &ids, 3, &mut out).unwrap();
        Driver::synchronize_stream(&ctx, &stream).unwrap();
        download(out)
    };

    assert_allclose_f32(&run(Reduction::Prod), &[-8.0, 12.0, 1.0], 1e-6, 0.0, "prod");
    assert_eq!(run(Reduction::Max), vec![4.0, 8.0, f32::MIN]);
    assert_eq!(run(Reduction::Min), vec![-1.0, 0.5, f32::MAX]);

    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_complex_max_is_unsupported() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let data = upload(&ctx, &[Complex64::new(1.0, 1.0)]);
    let ids = upload(&ctx, &[0i32]);
    let mut out = DeviceBuffer::<HostBackend, Complex64>::alloc(&ctx, 1).unwrap();

    let err = unsorted_segment_reduce(&ctx, &stream, Reduction::Max, &data, &ids, 1, &mut out)
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedDType { .. }));

    out.free().unwrap();
    data.free().unwrap();
    ids.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_i64_ids_and_wide_rows() {
    let ctx = create_host_context(1);
    let stream = Driver::create_stream(&ctx).unwrap();

    let inner = 300;
    let ids: Vec<i64> = vec![2, 0, 2];
    let data: Vec<f64> = (0..3 * inner).map(|i| i as f64).collect();
    let expected = reference_segment_sum(&data, &ids, inner, 3);

    let d_data = upload(&ctx, &data);
    let d_ids = upload(&ctx, &ids);
    let mut out = DeviceBuffer::<HostBackend, f64>::alloc(&ctx, 3 * inner).unwrap();

    unsorted_segment_sum(&ctx, &stream, &d_data, &d_ids, 3, &mut out).unwrap();
    Driver::synchronize_stream(&ctx, &stream).unwrap();
    assert_eq!(download(out), expected);

    let mut stream = stream;
    Driver::destroy_stream(&ctx, &mut stream).unwrap();
    d_data.free().unwrap();
    d_ids.free().unwrap();
    ctx.destroy().unwrap();
}
