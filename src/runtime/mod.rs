//! Accelerator backends
//!
//! This module defines the `Backend` trait (the vendor driver boundary) and
//! provides implementations for the supported accelerator APIs.
//!
//! # Architecture
//!
//! ```text
//! Backend (vendor driver boundary, raw handles + Status codes)
//! ├── HostBackend   software device in the host process (always built)
//! └── CudaBackend   NVIDIA driver API via cudarc (feature "cuda")
//! ```
//!
//! Everything above this layer (`crate::driver`) is written once against the
//! trait. Backends do not interpret statuses; they report the raw
//! driver result and leave classification and logging to the facade.
//!
//! # Current context
//!
//! Operations that are not explicitly context-independent act on the context
//! that is current on the calling thread, exactly like the vendor driver. The
//! only sanctioned way to change it from outside this module is
//! `driver::ScopedActivateContext`.

pub mod host;
pub mod kernel;
mod status;
mod types;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use kernel::{HostGlobal, KernelImage};
pub use status::Status;
pub use types::{
    CacheConfig, ContextOptions, DeviceAttribute, DevicePtr, Dim3, EventFlags, EventStatus,
    FunctionAttribute, MemorySpace, RawContext, RawDevice, RawEvent, RawFunction, RawModule,
    RawStream, ScheduleMode, SharedMemConfig,
};

use std::ffi::c_void;

/// Callback enqueued onto a stream.
///
/// Receives the stream's status at the time the callback fires. The callback
/// must not call back into the driver.
pub type StreamCallback = Box<dyn FnOnce(Result<(), Status>) + Send + 'static>;

/// Result of a raw driver call
pub type DriverResult<T> = std::result::Result<T, Status>;

/// Vendor driver boundary
///
/// `Backend` abstracts over accelerator driver APIs. It uses static dispatch via
/// generics; implementors are zero-sized markers. The parameter order of every
/// call mirrors the underlying driver API.
///
/// Calls marked `unsafe` take raw host or device addresses whose validity the
/// caller must guarantee.
pub trait Backend: Clone + Send + Sync + 'static {
    /// Human-readable name of this backend
    const NAME: &'static str;

    // ------------------------------------------------------------------
    // Context- and device-independent calls
    // ------------------------------------------------------------------

    /// Initialize the driver. Idempotent.
    fn init() -> DriverResult<()>;

    /// Toolkit version the driver is compatible with (e.g. 12040).
    fn driver_version() -> DriverResult<i32>;

    /// Number of visible devices
    fn device_count() -> DriverResult<i32>;

    /// Resolve a device ordinal
    fn device_get(ordinal: i32) -> DriverResult<RawDevice>;

    /// Name reported by the driver
    fn device_name(device: RawDevice) -> DriverResult<String>;

    /// Integer device attribute
    fn device_attribute(device: RawDevice, attr: DeviceAttribute) -> DriverResult<i32>;

    /// Total global memory in bytes
    fn device_total_memory(device: RawDevice) -> DriverResult<u64>;

    /// PCI bus id, `[domain]:[bus]:[device].[function]`
    fn device_pci_bus_id(device: RawDevice) -> DriverResult<String>;

    /// Whether `device` can address memory on `peer`
    fn device_can_access_peer(device: RawDevice, peer: RawDevice) -> DriverResult<bool>;

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    /// Create a context; it becomes current on the calling thread.
    fn ctx_create(device: RawDevice, flags: u32) -> DriverResult<RawContext>;

    /// Destroy a context. Must not be in use by any thread.
    fn ctx_destroy(ctx: RawContext) -> DriverResult<()>;

    /// Context current on the calling thread, null if none
    fn ctx_get_current() -> DriverResult<RawContext>;

    /// Make `ctx` current on the calling thread (null unbinds)
    fn ctx_set_current(ctx: RawContext) -> DriverResult<()>;

    /// Device of the current context
    fn ctx_get_device() -> DriverResult<RawDevice>;

    /// Block until all work in the current context has completed
    fn ctx_synchronize() -> DriverResult<()>;

    /// Cache preference of the current context
    fn ctx_set_cache_config(config: CacheConfig) -> DriverResult<()>;

    /// Shared memory bank configuration of the current context
    fn ctx_get_shared_mem_config() -> DriverResult<SharedMemConfig>;

    /// Set the shared memory bank configuration of the current context
    fn ctx_set_shared_mem_config(config: SharedMemConfig) -> DriverResult<()>;

    /// Let the current context access memory owned by `peer`
    fn ctx_enable_peer_access(peer: RawContext) -> DriverResult<()>;

    /// `(free, total)` bytes of the current context's device
    fn mem_get_info() -> DriverResult<(u64, u64)>;

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Allocate device memory in the current context
    fn mem_alloc(bytes: usize) -> DriverResult<DevicePtr>;

    /// Free device memory
    ///
    /// # Safety
    ///
    /// `ptr` must come from `mem_alloc` and must not be used afterwards.
    unsafe fn mem_free(ptr: DevicePtr) -> DriverResult<()>;

    /// Allocate page-locked host memory
    fn mem_alloc_host(bytes: usize) -> DriverResult<*mut c_void>;

    /// Free page-locked host memory
    ///
    /// # Safety
    ///
    /// `ptr` must come from `mem_alloc_host` and must not be used afterwards.
    unsafe fn mem_free_host(ptr: *mut c_void) -> DriverResult<()>;

    /// Page-lock and register an existing host range
    ///
    /// # Safety
    ///
    /// `ptr..ptr+bytes` must be a live host allocation for as long as it stays registered.
    unsafe fn mem_host_register(ptr: *mut c_void, bytes: usize) -> DriverResult<()>;

    /// Unregister a range registered by `mem_host_register`
    ///
    /// # Safety
    ///
    /// No in-flight operation may still reference the range.
    unsafe fn mem_host_unregister(ptr: *mut c_void) -> DriverResult<()>;

    /// Synchronous 8-bit fill of `count` bytes
    ///
    /// # Safety
    ///
    /// `dst..dst+count` must be valid device memory.
    unsafe fn memset_d8(dst: DevicePtr, value: u8, count: usize) -> DriverResult<()>;

    /// Synchronous 32-bit fill of `count` words
    ///
    /// # Safety
    ///
    /// `dst..dst+4*count` must be valid, 4-byte aligned device memory.
    unsafe fn memset_d32(dst: DevicePtr, value: u32, count: usize) -> DriverResult<()>;

    /// Stream-ordered 8-bit fill
    ///
    /// # Safety
    ///
    /// As `memset_d8`, and the range must stay valid until the fill completes.
    unsafe fn memset_d8_async(
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: RawStream,
    ) -> DriverResult<()>;

    /// Stream-ordered 32-bit fill
    ///
    /// # Safety
    ///
    /// As `memset_d32`, and the range must stay valid until the fill completes.
    unsafe fn memset_d32_async(
        dst: DevicePtr,
        value: u32,
        count: usize,
        stream: RawStream,
    ) -> DriverResult<()>;

    /// Blocking device-to-host copy
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `bytes` bytes.
    unsafe fn memcpy_dtoh(dst: *mut c_void, src: DevicePtr, bytes: usize) -> DriverResult<()>;

    /// Blocking host-to-device copy
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `bytes` bytes.
    unsafe fn memcpy_htod(dst: DevicePtr, src: *const c_void, bytes: usize) -> DriverResult<()>;

    /// Blocking device-to-device copy
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `bytes` bytes.
    unsafe fn memcpy_dtod(dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()>;

    /// Stream-ordered device-to-host copy
    ///
    /// # Safety
    ///
    /// Both ranges must stay valid until the copy completes.
    unsafe fn memcpy_dtoh_async(
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()>;

    /// Stream-ordered host-to-device copy
    ///
    /// # Safety
    ///
    /// Both ranges must stay valid until the copy completes.
    unsafe fn memcpy_htod_async(
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()>;

    /// Stream-ordered device-to-device copy
    ///
    /// # Safety
    ///
    /// Both ranges must stay valid until the copy completes.
    unsafe fn memcpy_dtod_async(
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()>;

    /// Context in which `ptr` was allocated or registered
    fn pointer_context(ptr: DevicePtr) -> DriverResult<RawContext>;

    /// Memory space addressed by `ptr`
    fn pointer_memory_space(ptr: DevicePtr) -> DriverResult<MemorySpace>;

    /// Base address and size of the allocation containing `ptr`
    fn pointer_address_range(ptr: DevicePtr) -> DriverResult<(DevicePtr, usize)>;

    // ------------------------------------------------------------------
    // Streams and events
    // ------------------------------------------------------------------

    /// Create a stream in the current context
    fn stream_create() -> DriverResult<RawStream>;

    /// Destroy a stream; pending work still completes
    fn stream_destroy(stream: RawStream) -> DriverResult<()>;

    /// Block until all work on the stream has completed
    fn stream_synchronize(stream: RawStream) -> DriverResult<()>;

    /// `Ok` if the stream is idle, `Err(NOT_READY)` if work is pending
    fn stream_query(stream: RawStream) -> DriverResult<()>;

    /// Make future work on `stream` wait for `event`
    fn stream_wait_event(stream: RawStream, event: RawEvent) -> DriverResult<()>;

    /// Run `callback` on a driver thread once prior work on `stream` completes
    fn stream_add_callback(stream: RawStream, callback: StreamCallback) -> DriverResult<()>;

    /// Create an event in the current context
    fn event_create(flags: EventFlags) -> DriverResult<RawEvent>;

    /// Destroy an event
    fn event_destroy(event: RawEvent) -> DriverResult<()>;

    /// Record `event` at the current tail of `stream`
    fn event_record(event: RawEvent, stream: RawStream) -> DriverResult<()>;

    /// `Ok` if complete, `Err(NOT_READY)` if pending
    fn event_query(event: RawEvent) -> DriverResult<()>;

    /// Block until the event completes
    fn event_synchronize(event: RawEvent) -> DriverResult<()>;

    /// Milliseconds between two completed, timing-enabled events
    fn event_elapsed_time(start: RawEvent, stop: RawEvent) -> DriverResult<f32>;

    // ------------------------------------------------------------------
    // Modules and launches
    // ------------------------------------------------------------------

    /// Load a kernel image into the current context
    fn module_load(image: &'static KernelImage) -> DriverResult<RawModule>;

    /// Unload a module; its functions become invalid
    fn module_unload(module: RawModule) -> DriverResult<()>;

    /// Look up a kernel by name
    fn module_get_function(module: RawModule, name: &str) -> DriverResult<RawFunction>;

    /// Device address and size in bytes of a module-scope global
    fn module_get_global(module: RawModule, name: &str) -> DriverResult<(DevicePtr, usize)>;

    /// Integer function attribute
    fn func_get_attribute(func: RawFunction, attr: FunctionAttribute) -> DriverResult<i32>;

    /// Per-function cache preference
    fn func_set_cache_config(func: RawFunction, config: CacheConfig) -> DriverResult<()>;

    /// Maximum resident blocks per multiprocessor for a launch shape
    fn occupancy_max_active_blocks(
        func: RawFunction,
        block_size: u32,
        dynamic_shared_mem: usize,
    ) -> DriverResult<i32>;

    /// Enqueue a kernel launch
    ///
    /// `params[i]` points at the value of the i-th kernel parameter. Values are
    /// copied before this call returns.
    ///
    /// # Safety
    ///
    /// Parameter pointers must reference values of the types the kernel
    /// expects, and any device addresses among them must stay valid until the
    /// kernel completes.
    unsafe fn launch_kernel(
        func: RawFunction,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: RawStream,
        params: &[*mut c_void],
    ) -> DriverResult<()>;
}
