//! Integration tests for the driver facade on the host device
//!
//! Tests verify:
//! - Scoped context activation restores the previous binding on every exit path
//! - Streams, events and callbacks honour queue order
//! - Driver calls from inside a callback are refused
//! - Peer access and pointer queries
//! - Execution faults are deferred to the next synchronization point

mod common;

use common::{clear_current_context, create_host_context, download, upload};
use parking_lot::Mutex;
use segdrv::driver::{Context, DeviceBuffer, Driver, ScopedActivateContext, Stream};
use segdrv::error::{Error, Result};
use segdrv::ops::{
    Reduction, SEGMENT_REDUCTION_ABI_VERSION, SEGMENT_REDUCTION_IMAGE,
    launch_unsorted_segment_reduction, unsorted_segment_sum,
};
use segdrv::runtime::host::HostBackend;
use segdrv::runtime::{EventFlags, EventStatus, MemorySpace, RawContext, Status};
use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::mpsc;

type HostDriver = Driver<HostBackend>;

/// Park `stream` until the returned sender fires.
fn block_stream(ctx: &Context<HostBackend>, stream: &Stream<HostBackend>) -> mpsc::Sender<()> {
    let (release, gate) = mpsc::channel::<()>();
    assert!(HostDriver::add_stream_callback(ctx, stream, move |_| {
        let _ = gate.recv();
    }));
    release
}

// ============================================================================
// Scoped activation
// ============================================================================

#[test]
fn test_scoped_activation_nests_and_restores_none() {
    let a = create_host_context(0);
    let b = create_host_context(1);
    clear_current_context();

    {
        let outer = ScopedActivateContext::new(&a).unwrap();
        assert!(outer.previous().is_null());
        assert_eq!(HostDriver::current_context(), a.raw());
        {
            let inner = ScopedActivateContext::new(&b).unwrap();
            assert_eq!(inner.previous(), a.raw());
            assert_eq!(HostDriver::current_context(), b.raw());
            assert_eq!(ScopedActivateContext::<HostBackend>::depth(), 2);
        }
        assert_eq!(HostDriver::current_context(), a.raw());
        {
            let _same = ScopedActivateContext::new(&a).unwrap();
            assert_eq!(HostDriver::current_context(), a.raw());
        }
        assert_eq!(HostDriver::current_context(), a.raw());
    }
    assert_eq!(HostDriver::current_context(), RawContext::NULL);
    assert_eq!(ScopedActivateContext::<HostBackend>::depth(), 0);

    a.destroy().unwrap();
    b.destroy().unwrap();
}

#[test]
fn test_scoped_activation_restores_on_error_exit() {
    let a = create_host_context(0);
    let b = create_host_context(0);

    fn fails_inside(ctx: &Context<HostBackend>) -> Result<()> {
        let _scope = ScopedActivateContext::new(ctx)?;
        Err(Error::invalid_argument("ctx", "always fails"))
    }

    let _outer = ScopedActivateContext::new(&a).unwrap();
    assert!(fails_inside(&b).is_err());
    assert_eq!(HostDriver::current_context(), a.raw());

    // Facade calls on another context leave the caller's binding alone.
    let buffer = DeviceBuffer::<HostBackend, f32>::zeroed(&b, 4).unwrap();
    assert_eq!(HostDriver::current_context(), a.raw());
    buffer.free().unwrap();
    assert_eq!(HostDriver::current_context(), a.raw());

    drop(_outer);
    a.destroy().unwrap();
    b.destroy().unwrap();
}

#[test]
fn test_destroyed_context_cannot_be_activated() {
    let ctx = create_host_context(0);
    ctx.destroy().unwrap();
    assert!(ctx.is_destroyed());

    let err = ScopedActivateContext::new(&ctx).err().unwrap();
    assert_eq!(err.status(), Some(Status::INVALID_CONTEXT));
    assert!(HostDriver::create_stream(&ctx).is_err());
}

#[test]
fn test_context_ids_are_unique_across_threads() {
    let handles: Vec<_> = (0..8)
        .map(|i| {
            std::thread::spawn(move || {
                let ctx = create_host_context(i % 2);
                let id = ctx.id();
                ctx.destroy().unwrap();
                id
            })
        })
        .collect();
    let ids: HashSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), 8);
}

// ============================================================================
// Streams, events and callbacks
// ============================================================================

#[test]
fn test_event_tracks_stream_progress() {
    let ctx = create_host_context(0);
    let mut stream = HostDriver::create_stream(&ctx).unwrap();
    let mut start = HostDriver::init_event(&ctx, EventFlags::Default).unwrap();
    let mut stop = HostDriver::init_event(&ctx, EventFlags::Default).unwrap();

    HostDriver::record_event(&ctx, &start, &stream).unwrap();
    let release = block_stream(&ctx, &stream);
    HostDriver::record_event(&ctx, &stop, &stream).unwrap();

    assert_eq!(HostDriver::query_event(&ctx, &stop).unwrap(), EventStatus::Pending);
    assert!(!HostDriver::is_stream_idle(&ctx, &stream));

    release.send(()).unwrap();
    HostDriver::synchronize_event(&ctx, &stop).unwrap();
    assert_eq!(HostDriver::query_event(&ctx, &stop).unwrap(), EventStatus::Complete);
    HostDriver::synchronize_stream(&ctx, &stream).unwrap();
    assert!(HostDriver::is_stream_idle(&ctx, &stream));

    let elapsed = HostDriver::event_elapsed_time(&ctx, &start, &stop).unwrap();
    assert!(elapsed >= 0.0);

    HostDriver::destroy_event(&ctx, &mut start).unwrap();
    HostDriver::destroy_event(&ctx, &mut stop).unwrap();
    HostDriver::destroy_stream(&ctx, &mut stream).unwrap();
    assert!(stream.is_null());
    ctx.destroy().unwrap();
}

#[test]
fn test_untimed_event_has_no_elapsed_time() {
    let ctx = create_host_context(0);
    let stream = Stream::null();
    let mut a = HostDriver::init_event(&ctx, EventFlags::DisableTiming).unwrap();
    let mut b = HostDriver::init_event(&ctx, EventFlags::DisableTiming).unwrap();
    HostDriver::record_event(&ctx, &a, &stream).unwrap();
    HostDriver::record_event(&ctx, &b, &stream).unwrap();
    HostDriver::synchronize_event(&ctx, &b).unwrap();

    let err = HostDriver::event_elapsed_time(&ctx, &a, &b).unwrap_err();
    assert!(matches!(err, Error::Query { op: "event_elapsed_time", .. }));

    HostDriver::destroy_event(&ctx, &mut a).unwrap();
    HostDriver::destroy_event(&ctx, &mut b).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_stream_waits_on_event_from_another_stream() {
    let ctx = create_host_context(0);
    let mut producer = HostDriver::create_stream(&ctx).unwrap();
    let mut consumer = HostDriver::create_stream(&ctx).unwrap();
    let mut ready = HostDriver::init_event(&ctx, EventFlags::DisableTiming).unwrap();

    let release = block_stream(&ctx, &producer);
    HostDriver::record_event(&ctx, &ready, &producer).unwrap();
    assert!(HostDriver::wait_stream_on_event(&ctx, &consumer, &ready));

    let ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran);
    assert!(HostDriver::add_stream_callback(&ctx, &consumer, move |status| {
        assert!(status.is_ok());
        *flag.lock() = true;
    }));

    assert!(!HostDriver::is_stream_idle(&ctx, &consumer));
    assert!(!*ran.lock());

    release.send(()).unwrap();
    HostDriver::synchronize_stream(&ctx, &consumer).unwrap();
    assert!(*ran.lock());

    HostDriver::destroy_event(&ctx, &mut ready).unwrap();
    HostDriver::destroy_stream(&ctx, &mut producer).unwrap();
    HostDriver::destroy_stream(&ctx, &mut consumer).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_callbacks_run_in_queue_order_after_prior_work() {
    let ctx = create_host_context(0);
    let values = vec![0u32; 256];
    let mut buffer = upload(&ctx, &values);

    let seen = Arc::new(Mutex::new(Vec::new()));
    HostDriver::with_stream(&ctx, |stream| {
        for step in 1..=4u32 {
            // SAFETY: the buffer outlives the stream, which is synchronized
            // before `with_stream` returns.
            assert!(unsafe {
                HostDriver::async_memset_u32(&ctx, buffer.ptr(), step, values.len(), stream)
            });
            let seen = Arc::clone(&seen);
            assert!(HostDriver::add_stream_callback(&ctx, stream, move |status| {
                assert_eq!(status, Ok(()));
                seen.lock().push(step);
            }));
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
    assert_eq!(buffer.to_vec().unwrap(), vec![4u32; 256]);
    buffer.copy_from_host(&values).unwrap();
    buffer.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_driver_calls_from_callback_are_refused() {
    let ctx = create_host_context(0);
    let stream = Stream::null();

    let (tx, rx) = mpsc::channel();
    assert!(HostDriver::add_stream_callback(&ctx, &stream, move |_| {
        let count = HostDriver::device_count().map_err(|e| e.status());
        let current = HostDriver::current_context();
        tx.send((count, current)).unwrap();
    }));
    HostDriver::synchronize_stream(&ctx, &stream).unwrap();

    let (count, current) = rx.recv().unwrap();
    assert_eq!(count, Err(Some(Status::NOT_PERMITTED)));
    assert!(current.is_null());

    // The stream is still usable afterwards.
    assert!(HostDriver::is_stream_idle(&ctx, &stream));
    ctx.destroy().unwrap();
}

#[test]
fn test_with_stream_releases_stream_on_error() {
    let ctx = create_host_context(0);
    let mut captured = None;
    let result: Result<()> = HostDriver::with_stream(&ctx, |stream| {
        captured = Some(stream.raw());
        Err(Error::invalid_argument("stream", "closure failed"))
    });
    assert!(matches!(result, Err(Error::InvalidArgument { arg: "stream", .. })));

    assert!(captured.is_some_and(|raw| !raw.is_null()));
    HostDriver::synchronize_stream(&ctx, &Stream::null()).unwrap();
    ctx.destroy().unwrap();
}

// ============================================================================
// Memory
// ============================================================================

#[test]
fn test_memset_and_copies() {
    let ctx = create_host_context(0);
    let buffer = DeviceBuffer::<HostBackend, u32>::alloc(&ctx, 16).unwrap();
    let other = DeviceBuffer::<HostBackend, u32>::alloc(&ctx, 16).unwrap();

    // SAFETY: both buffers hold 16 u32 values in `ctx`.
    unsafe {
        HostDriver::synchronous_memset_u32(&ctx, buffer.ptr(), 0xDEAD_BEEF, 16).unwrap();
        HostDriver::synchronous_memset_u8(&ctx, buffer.ptr(), 0, 4).unwrap();
        HostDriver::synchronous_memcpy_d2d(&ctx, other.ptr(), buffer.ptr(), 64).unwrap();
    }

    let mut expected = vec![0xDEAD_BEEFu32; 16];
    expected[0] = 0;
    assert_eq!(other.to_vec().unwrap(), expected);

    let mut host = vec![0u32; 16];
    // SAFETY: `host` is 64 writable bytes.
    unsafe {
        HostDriver::synchronous_memcpy_d2h(&ctx, host.as_mut_ptr() as *mut c_void, other.ptr(), 64)
            .unwrap();
    }
    assert_eq!(host, expected);

    // Unaligned word fills are rejected.
    let err = unsafe { HostDriver::synchronous_memset_u32(&ctx, buffer.ptr() + 2, 1, 2) }
        .unwrap_err();
    assert!(matches!(err, Error::Transfer { op: "memset_d32", .. }));

    buffer.free().unwrap();
    other.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_word_fill_with_overflowing_count_is_rejected() {
    let ctx = create_host_context(0);
    let buffer = DeviceBuffer::<HostBackend, u32>::alloc(&ctx, 4).unwrap();
    let mut stream = HostDriver::create_stream(&ctx).unwrap();
    // SAFETY: `buffer` holds 4 u32 values in `ctx`.
    unsafe { HostDriver::synchronous_memset_u32(&ctx, buffer.ptr(), 9, 4).unwrap() };

    // SAFETY: the oversized fills are rejected before any byte is written.
    let err = unsafe { HostDriver::synchronous_memset_u32(&ctx, buffer.ptr(), 1, usize::MAX / 2) }
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Transfer { op: "memset_d32", bytes: usize::MAX, status } if status == Status::INVALID_VALUE
    ));
    assert!(!unsafe {
        HostDriver::async_memset_u32(&ctx, buffer.ptr(), 1, usize::MAX / 2, &stream)
    });

    HostDriver::synchronize_stream(&ctx, &stream).unwrap();
    assert_eq!(buffer.to_vec().unwrap(), vec![9u32; 4]);

    HostDriver::destroy_stream(&ctx, &mut stream).unwrap();
    buffer.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_async_copies_through_registered_host_memory() {
    let ctx = create_host_context(0);
    let mut staging = vec![0.0f64; 8];
    let bytes = staging.len() * std::mem::size_of::<f64>();
    let host_ptr = staging.as_mut_ptr() as *mut c_void;

    // SAFETY: `staging` stays alive until after `host_unregister`.
    assert!(unsafe { HostDriver::host_register(&ctx, host_ptr, bytes) });
    assert!(!unsafe { HostDriver::host_register(&ctx, host_ptr, bytes) });
    assert_eq!(
        HostDriver::get_pointer_memory_space(host_ptr as u64).unwrap(),
        MemorySpace::Host
    );

    let device = upload(&ctx, &[1.5f64, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5]);
    HostDriver::with_stream(&ctx, |stream| {
        // SAFETY: both ranges are `bytes` long and outlive the stream.
        assert!(unsafe { HostDriver::async_memcpy_d2h(&ctx, host_ptr, device.ptr(), bytes, stream) });
        Ok(())
    })
    .unwrap();
    assert_eq!(staging, vec![1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5]);

    assert!(unsafe { HostDriver::host_unregister(&ctx, host_ptr) });
    assert!(!unsafe { HostDriver::host_unregister(&ctx, host_ptr) });
    device.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_pinned_host_allocation() {
    let ctx = create_host_context(1);
    let ptr = HostDriver::host_allocate(&ctx, 128).unwrap();
    assert_eq!(
        HostDriver::get_pointer_memory_space(ptr as u64).unwrap(),
        MemorySpace::Host
    );
    assert_eq!(HostDriver::get_pointer_device(ptr as u64).unwrap().ordinal(), 1);
    // SAFETY: `ptr` came from `host_allocate` and is not used afterwards.
    assert!(unsafe { HostDriver::host_deallocate(&ctx, ptr) });
    ctx.destroy().unwrap();
}

#[test]
fn test_pointer_queries() {
    let a = create_host_context(0);
    let b = create_host_context(1);
    let buffer = DeviceBuffer::<HostBackend, f32>::zeroed(&b, 32).unwrap();
    let inner = buffer.ptr() + 16;

    let owner = HostDriver::get_pointer_context(inner).unwrap();
    assert_eq!(owner.id(), b.id());
    assert!(Arc::ptr_eq(&owner, &b));
    assert_eq!(HostDriver::get_pointer_device(inner).unwrap(), *b.device());
    assert_eq!(
        HostDriver::get_pointer_memory_space(inner).unwrap(),
        MemorySpace::Device
    );
    assert_eq!(
        HostDriver::get_pointer_address_range(inner).unwrap(),
        (buffer.ptr(), 128)
    );

    buffer.free().unwrap();
    let err = HostDriver::get_pointer_address_range(0x10).unwrap_err();
    assert!(matches!(err, Error::Query { op: "pointer_address_range", .. }));
    assert!(HostDriver::get_pointer_context(0x10).is_err());

    a.destroy().unwrap();
    b.destroy().unwrap();
}

#[test]
fn test_device_memory_info_tracks_allocations() {
    let ctx = create_host_context(0);
    let (free_before, total) = HostDriver::device_memory_info(&ctx).unwrap();
    assert!(free_before <= total);

    let ptr = HostDriver::device_allocate(&ctx, 1 << 20).unwrap();
    let (free_during, _) = HostDriver::device_memory_info(&ctx).unwrap();
    assert!(free_during < total);

    // SAFETY: `ptr` came from `device_allocate` in `ctx`.
    assert!(unsafe { HostDriver::device_deallocate(&ctx, ptr) });
    ctx.destroy().unwrap();
}

// ============================================================================
// Peer access
// ============================================================================

#[test]
fn test_peer_access_between_devices() {
    let a = create_host_context(0);
    let b = create_host_context(1);
    let same_device = create_host_context(0);

    assert!(HostDriver::can_enable_peer_access(&a, &b));
    assert!(!HostDriver::can_enable_peer_access(&a, &same_device));

    HostDriver::enable_peer_access(&a, &b).unwrap();
    // Enabling twice is not an error.
    HostDriver::enable_peer_access(&a, &b).unwrap();
    HostDriver::enable_peer_access(&a, &a).unwrap();

    let err = HostDriver::enable_peer_access(&a, &same_device).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation { .. }));

    // A kernel in `a` may now write memory owned by `b`.
    let data = upload(&a, &[1.0f32, 2.0, 3.0]);
    let ids = upload(&a, &[0i32, 0, 1]);
    let mut out = DeviceBuffer::<HostBackend, f32>::alloc(&b, 2).unwrap();
    unsorted_segment_sum(&a, &Stream::null(), &data, &ids, 2, &mut out).unwrap();
    HostDriver::synchronize_context(&a).unwrap();
    assert_eq!(download(out), vec![3.0, 3.0]);

    data.free().unwrap();
    ids.free().unwrap();
    a.destroy().unwrap();
    b.destroy().unwrap();
    same_device.destroy().unwrap();
}

// ============================================================================
// Deferred faults
// ============================================================================

#[test]
fn test_kernel_fault_surfaces_at_synchronize() {
    let ctx = create_host_context(0);
    let mut stream = HostDriver::create_stream(&ctx).unwrap();
    let ids = upload(&ctx, &[0i32, 1]);
    let data = upload(&ctx, &[1.0f32, 2.0]);

    // Enqueue succeeds; the bad output address is only noticed when the
    // kernel runs.
    let release = block_stream(&ctx, &stream);
    let bogus_output = 0xDEAD_0000u64;
    let queued = unsafe {
        launch_unsorted_segment_reduction::<HostBackend, f32, i32>(
            &ctx,
            &stream,
            Reduction::Sum,
            2,
            1,
            2,
            ids.ptr(),
            data.ptr(),
            bogus_output,
        )
    };
    assert!(queued.is_ok());
    release.send(()).unwrap();

    let err = HostDriver::synchronize_stream(&ctx, &stream).unwrap_err();
    assert_eq!(err.status(), Some(Status::ILLEGAL_ADDRESS));
    assert!(err.is_fatal());

    // The fault is sticky.
    let err = HostDriver::synchronize_context(&ctx).unwrap_err();
    assert!(matches!(
        err,
        Error::Synchronization {
            status: Status::ILLEGAL_ADDRESS,
            ..
        }
    ));
    assert!(HostDriver::device_allocate(&ctx, 64).is_none());

    HostDriver::destroy_stream(&ctx, &mut stream).unwrap();
    ids.free().unwrap();
    data.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_callback_observes_fault_of_prior_work() {
    let ctx = create_host_context(1);
    let stream = Stream::null();
    let ids = upload(&ctx, &[0i64]);
    let data = upload(&ctx, &[1.0f64]);

    let release = block_stream(&ctx, &stream);
    // SAFETY: only the output address is bad, and the fault is the point.
    unsafe {
        launch_unsorted_segment_reduction::<HostBackend, f64, i64>(
            &ctx,
            &stream,
            Reduction::Max,
            1,
            1,
            1,
            ids.ptr(),
            data.ptr(),
            0xBAD_0008,
        )
    }
    .unwrap();
    let (tx, rx) = mpsc::channel();
    assert!(HostDriver::add_stream_callback(&ctx, &stream, move |status| {
        tx.send(status).unwrap();
    }));
    release.send(()).unwrap();

    assert_eq!(rx.recv().unwrap(), Err(Status::ILLEGAL_ADDRESS));
    // Work queued after the fault is refused at enqueue.
    assert!(!HostDriver::add_stream_callback(&ctx, &stream, |_| {}));

    ids.free().unwrap();
    data.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_async_copy_outside_allocation_is_rejected() {
    let ctx = create_host_context(0);
    let buffer = DeviceBuffer::<HostBackend, u8>::alloc(&ctx, 64).unwrap();
    let mut host = vec![0u8; 128];

    // SAFETY: the device range is invalid, so nothing is queued.
    let queued = unsafe {
        HostDriver::async_memcpy_d2h(
            &ctx,
            host.as_mut_ptr() as *mut c_void,
            buffer.ptr(),
            128,
            &Stream::null(),
        )
    };
    assert!(!queued);
    // A rejected enqueue does not poison the context.
    HostDriver::synchronize_context(&ctx).unwrap();

    buffer.free().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_panicking_callback_poisons_context_instead_of_hanging() {
    let ctx = create_host_context(0);
    let mut stream = HostDriver::create_stream(&ctx).unwrap();

    assert!(HostDriver::add_stream_callback(&ctx, &stream, |_| {
        panic!("callback failure");
    }));

    let (tx, rx) = mpsc::channel();
    let waiter = Arc::clone(&ctx);
    std::thread::spawn(move || {
        let _ = tx.send(HostDriver::synchronize_context(&waiter));
    });
    let result = rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("synchronize_context returned");
    let err = result.unwrap_err();
    assert_eq!(err.status(), Some(Status::LAUNCH_FAILED));
    assert!(err.is_fatal());

    // The stream worker survived and the handle still releases.
    assert!(!HostDriver::is_stream_idle(&ctx, &stream));
    HostDriver::destroy_stream(&ctx, &mut stream).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_module_symbol_resolves_device_global() {
    let ctx = create_host_context(0);
    let mut module = HostDriver::load_module(&ctx, &SEGMENT_REDUCTION_IMAGE).unwrap();

    let (ptr, bytes) =
        HostDriver::get_module_symbol(&ctx, &module, "segment_reduction_abi_version").unwrap();
    assert_eq!(bytes, 4);
    assert_eq!(HostDriver::get_pointer_address_range(ptr).unwrap(), (ptr, 4));
    assert!(Arc::ptr_eq(&HostDriver::get_pointer_context(ptr).unwrap(), &ctx));

    let mut version = 0u32;
    // SAFETY: the global is exactly four bytes.
    unsafe {
        HostDriver::synchronous_memcpy_d2h(
            &ctx,
            &mut version as *mut u32 as *mut c_void,
            ptr,
            bytes,
        )
    }
    .unwrap();
    assert_eq!(version, SEGMENT_REDUCTION_ABI_VERSION);

    let err = HostDriver::get_module_symbol(&ctx, &module, "no_such_global").unwrap_err();
    assert!(matches!(
        err,
        Error::Module {
            op: "module_get_global",
            status: Status::NOT_FOUND,
            ..
        }
    ));

    HostDriver::unload_module(&ctx, &mut module).unwrap();
    let err = HostDriver::get_module_symbol(&ctx, &module, "segment_reduction_abi_version")
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::INVALID_HANDLE));
    ctx.destroy().unwrap();
}
