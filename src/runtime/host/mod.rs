//! Host backend
//!
//! A software accelerator that lives in the calling process and honours the same
//! driver contract as a real device:
//!
//! - one current context per thread, kept in a thread-local
//! - streams are in-order queues drained by one worker thread each; the null
//!   stream names the current context's default stream
//! - launches, async copies and fills return as soon as they are queued, and
//!   execution faults are sticky: they poison the context and surface at the
//!   next synchronization or poll
//! - device memory is host memory tracked by an allocation registry, so bad
//!   addresses fault instead of corrupting the process
//! - kernel grids run on the rayon pool
//!
//! The device shape comes from [`HostConfig`], read from the environment on
//! first use unless [`HostBackend::install`] ran earlier.

mod config;
pub mod kernels;
mod launch;
mod memory;
mod stream;

pub use config::HostConfig;
pub use launch::{GlobalPtr, HostEntry, HostKernel, HostLaunch, ThreadIdx};

use super::{
    Backend, CacheConfig, DeviceAttribute, DevicePtr, Dim3, DriverResult, EventFlags,
    FunctionAttribute, KernelImage, MemorySpace, RawContext, RawDevice, RawEvent, RawFunction,
    RawModule, RawStream, SharedMemConfig, Status, StreamCallback,
};
use memory::MemoryRegistry;
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use stream::{Fault, HostEvent, HostStream, Job};

/// Driver version reported by the host backend
pub const HOST_DRIVER_VERSION: i32 = 12040;

/// Accepted context creation flags: scheduling bits, map-host, local memory resize
const CONTEXT_FLAG_MASK: u32 = 0x1F;

/// Upper bound on resident blocks per multiprocessor
const MAX_BLOCKS_PER_MULTIPROCESSOR: i32 = 32;

static DRIVER: OnceLock<HostDriver> = OnceLock::new();
static INJECTED_INIT_ERROR: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static CURRENT: Cell<RawContext> = const { Cell::new(RawContext::NULL) };
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a stream callback.
pub(crate) struct CallbackGuard {
    previous: bool,
}

impl CallbackGuard {
    pub(crate) fn enter() -> Self {
        Self {
            previous: IN_CALLBACK.replace(true),
        }
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        IN_CALLBACK.set(self.previous);
    }
}

// ============================================================================
// Driver state
// ============================================================================

#[derive(Debug)]
struct HostContext {
    handle: RawContext,
    device: RawDevice,
    cache_config: Mutex<CacheConfig>,
    shared_mem_config: Mutex<SharedMemConfig>,
    peers: Mutex<Vec<RawContext>>,
    default_stream: Arc<HostStream>,
    fault: Arc<Fault>,
}

#[derive(Debug)]
struct HostModule {
    context: RawContext,
    image: &'static KernelImage,
    /// `(name, address, bytes)` of every materialized global
    globals: Vec<(&'static str, DevicePtr, usize)>,
}

#[derive(Debug)]
struct HostFunction {
    module: RawModule,
    context: RawContext,
    kernel: &'static HostKernel,
    // The host has no L1/shared split; kept so the setter round-trips.
    #[allow(dead_code)]
    cache_config: CacheConfig,
}

struct HostDriver {
    config: HostConfig,
    initialized: AtomicBool,
    next_handle: AtomicUsize,
    contexts: RwLock<HashMap<RawContext, Arc<HostContext>>>,
    streams: RwLock<HashMap<RawStream, Arc<HostStream>>>,
    events: RwLock<HashMap<RawEvent, Arc<HostEvent>>>,
    modules: RwLock<HashMap<RawModule, HostModule>>,
    functions: RwLock<HashMap<RawFunction, HostFunction>>,
    memory: MemoryRegistry,
}

impl HostDriver {
    fn new(config: HostConfig) -> Self {
        Self {
            config,
            initialized: AtomicBool::new(false),
            next_handle: AtomicUsize::new(0x1000),
            contexts: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            modules: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            memory: MemoryRegistry::default(),
        }
    }

    fn next_handle(&self) -> usize {
        self.next_handle.fetch_add(0x10, Ordering::Relaxed)
    }

    fn device(&self, device: RawDevice) -> DriverResult<RawDevice> {
        if device.0 >= 0 && (device.0 as u32) < self.config.device_count {
            Ok(device)
        } else {
            Err(Status::INVALID_DEVICE)
        }
    }

    fn context(&self, handle: RawContext) -> DriverResult<Arc<HostContext>> {
        self.contexts
            .read()
            .get(&handle)
            .cloned()
            .ok_or(Status::INVALID_CONTEXT)
    }

    /// Context current on this thread, faulted or not.
    fn current(&self) -> DriverResult<Arc<HostContext>> {
        let handle = CURRENT.get();
        if handle.is_null() {
            return Err(Status::INVALID_CONTEXT);
        }
        self.contexts
            .read()
            .get(&handle)
            .cloned()
            .ok_or(Status::CONTEXT_IS_DESTROYED)
    }

    /// Current context, failing with its fault if one was raised.
    fn active(&self) -> DriverResult<Arc<HostContext>> {
        let ctx = self.current()?;
        ctx.fault.check()?;
        Ok(ctx)
    }

    fn stream(&self, ctx: &HostContext, stream: RawStream) -> DriverResult<Arc<HostStream>> {
        if stream.is_null() {
            return Ok(Arc::clone(&ctx.default_stream));
        }
        let stream = self
            .streams
            .read()
            .get(&stream)
            .cloned()
            .ok_or(Status::INVALID_HANDLE)?;
        if stream.context != ctx.handle {
            return Err(Status::INVALID_CONTEXT);
        }
        Ok(stream)
    }

    fn event(&self, event: RawEvent) -> DriverResult<Arc<HostEvent>> {
        self.events
            .read()
            .get(&event)
            .cloned()
            .ok_or(Status::INVALID_HANDLE)
    }

    fn context_streams(&self, ctx: &HostContext) -> Vec<Arc<HostStream>> {
        let mut streams: Vec<_> = self
            .streams
            .read()
            .values()
            .filter(|s| s.context == ctx.handle)
            .cloned()
            .collect();
        streams.push(Arc::clone(&ctx.default_stream));
        streams
    }

    /// Drain every stream of `ctx`, reporting its fault if any.
    fn synchronize_context(&self, ctx: &HostContext) -> DriverResult<()> {
        for stream in self.context_streams(ctx) {
            // Fault is reported once below; keep draining the other streams.
            let _ = stream.synchronize();
        }
        ctx.fault.check()
    }

    /// Drain the context that owns `ptr` before its memory goes away.
    fn quiesce_owner(&self, ptr: DevicePtr) {
        let owner = self.memory.lookup(ptr).map(|r| r.context);
        if let Some(ctx) = owner.and_then(|c| self.context(c).ok()) {
            let _ = self.synchronize_context(&ctx);
        }
    }

    /// Allocate and initialize the globals of `image` in `ctx`.
    fn load_globals(
        &self,
        ctx: &HostContext,
        image: &KernelImage,
    ) -> DriverResult<Vec<(&'static str, DevicePtr, usize)>> {
        let mut globals = Vec::with_capacity(image.globals.len());
        for global in image.globals {
            let allocated = self.memory.allocate(
                global.init.len(),
                ctx.handle,
                ctx.device,
                MemorySpace::Device,
                self.config.memory_bytes,
            );
            let ptr = match allocated {
                Ok(ptr) => ptr,
                Err(status) => {
                    self.free_globals(&globals);
                    return Err(status);
                }
            };
            // SAFETY: `ptr` is a fresh allocation of exactly `init.len()` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    global.init.as_ptr(),
                    ptr as *mut u8,
                    global.init.len(),
                )
            };
            globals.push((global.name, ptr, global.init.len()));
        }
        Ok(globals)
    }

    fn free_globals(&self, globals: &[(&'static str, DevicePtr, usize)]) {
        for &(_, ptr, _) in globals {
            self.quiesce_owner(ptr);
            // SAFETY: the owning context has drained, so no kernel still reads it.
            let _ = unsafe { self.memory.free(ptr, MemorySpace::Device) };
        }
    }

    fn checked_range(&self, ptr: DevicePtr, bytes: usize) -> DriverResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.memory
            .lookup_range(ptr, bytes)
            .map(|_| ())
            .ok_or(Status::INVALID_VALUE)
    }

    fn function(&self, func: RawFunction) -> DriverResult<(RawContext, &'static HostKernel)> {
        self.functions
            .read()
            .get(&func)
            .map(|f| (f.context, f.kernel))
            .ok_or(Status::INVALID_HANDLE)
    }
}

fn driver() -> &'static HostDriver {
    DRIVER.get_or_init(|| {
        let config = HostConfig::from_env().unwrap_or_else(|e| {
            tracing::warn!("Ignoring host device environment: {}", e);
            HostConfig::default()
        });
        HostDriver::new(config)
    })
}

/// Driver state for a call from application code.
fn entered() -> DriverResult<&'static HostDriver> {
    if IN_CALLBACK.get() {
        return Err(Status::NOT_PERMITTED);
    }
    let driver = driver();
    if !driver.initialized.load(Ordering::Acquire) {
        return Err(Status::NOT_INITIALIZED);
    }
    Ok(driver)
}

// ============================================================================
// Memory helpers
// ============================================================================

/// Fill `count` elements of `width` bytes at `dst` with `pattern`.
///
/// # Safety
///
/// The range must be valid, writable memory.
unsafe fn fill(dst: DevicePtr, pattern: u32, width: usize, count: usize) {
    unsafe {
        if width == 1 {
            std::ptr::write_bytes(dst as *mut u8, pattern as u8, count);
        } else {
            let words = dst as *mut u32;
            for i in 0..count {
                words.add(i).write(pattern);
            }
        }
    }
}

/// Byte length of `count` elements of `width` bytes.
fn fill_bytes(width: usize, count: usize) -> DriverResult<usize> {
    width.checked_mul(count).ok_or(Status::INVALID_VALUE)
}

fn fill_job(dst: DevicePtr, pattern: u32, width: usize, count: usize, bytes: usize) -> Job {
    Box::new(move |status: DriverResult<()>| {
        status?;
        let memory = &driver().memory;
        memory
            .lookup_range(dst, bytes)
            .ok_or(Status::ILLEGAL_ADDRESS)?;
        // SAFETY: the range was revalidated against live allocations.
        unsafe { fill(dst, pattern, width, count) };
        Ok(())
    })
}

fn copy_job(dst: usize, src: usize, bytes: usize, check_dst: bool, check_src: bool) -> Job {
    Box::new(move |status: DriverResult<()>| {
        status?;
        let memory = &driver().memory;
        if check_dst && memory.lookup_range(dst as DevicePtr, bytes).is_none() {
            return Err(Status::ILLEGAL_ADDRESS);
        }
        if check_src && memory.lookup_range(src as DevicePtr, bytes).is_none() {
            return Err(Status::ILLEGAL_ADDRESS);
        }
        // SAFETY: device ranges were revalidated; host ranges are the caller's
        // responsibility until the copy completes.
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
        Ok(())
    })
}

impl HostDriver {
    unsafe fn memset(&self, dst: DevicePtr, pattern: u32, width: usize, count: usize) -> DriverResult<()> {
        let ctx = self.active()?;
        if width == 4 && dst % 4 != 0 {
            return Err(Status::INVALID_VALUE);
        }
        self.checked_range(dst, fill_bytes(width, count)?)?;
        // Blocking streams: a synchronous transfer waits for all of them.
        self.synchronize_context(&ctx)?;
        unsafe { fill(dst, pattern, width, count) };
        Ok(())
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        pattern: u32,
        width: usize,
        count: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        let ctx = self.active()?;
        if width == 4 && dst % 4 != 0 {
            return Err(Status::INVALID_VALUE);
        }
        let bytes = fill_bytes(width, count)?;
        self.checked_range(dst, bytes)?;
        self.stream(&ctx, stream)?
            .enqueue(fill_job(dst, pattern, width, count, bytes))
    }

    unsafe fn memcpy(
        &self,
        dst: usize,
        src: usize,
        bytes: usize,
        check_dst: bool,
        check_src: bool,
    ) -> DriverResult<()> {
        let ctx = self.active()?;
        if check_dst {
            self.checked_range(dst as DevicePtr, bytes)?;
        }
        if check_src {
            self.checked_range(src as DevicePtr, bytes)?;
        }
        // Blocking streams: a synchronous transfer waits for all of them.
        self.synchronize_context(&ctx)?;
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
        Ok(())
    }

    fn memcpy_async(
        &self,
        dst: usize,
        src: usize,
        bytes: usize,
        check_dst: bool,
        check_src: bool,
        stream: RawStream,
    ) -> DriverResult<()> {
        let ctx = self.active()?;
        if check_dst {
            self.checked_range(dst as DevicePtr, bytes)?;
        }
        if check_src {
            self.checked_range(src as DevicePtr, bytes)?;
        }
        self.stream(&ctx, stream)?
            .enqueue(copy_job(dst, src, bytes, check_dst, check_src))
    }
}

// ============================================================================
// Public surface
// ============================================================================

/// Software accelerator running in the host process.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostBackend;

impl HostBackend {
    /// Use `config` for the host devices.
    ///
    /// Must run before the first driver call; returns false if the devices
    /// were already created with another configuration.
    pub fn install(config: HostConfig) -> bool {
        let mut installed = false;
        let driver = DRIVER.get_or_init(|| {
            installed = true;
            HostDriver::new(config.clone())
        });
        installed || driver.config == config
    }

    /// Configuration of the host devices
    pub fn config() -> HostConfig {
        driver().config.clone()
    }

    /// Make the next `init` calls fail with `status`, or succeed again with `None`.
    ///
    /// Has no effect once the driver is initialized.
    pub fn inject_init_error(status: Option<Status>) {
        INJECTED_INIT_ERROR.store(status.map_or(0, Status::code), Ordering::SeqCst);
    }
}

impl Backend for HostBackend {
    const NAME: &'static str = "host";

    fn init() -> DriverResult<()> {
        if IN_CALLBACK.get() {
            return Err(Status::NOT_PERMITTED);
        }
        let driver = driver();
        if driver.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let injected = INJECTED_INIT_ERROR.load(Ordering::SeqCst);
        if injected != 0 {
            return Err(Status(injected));
        }
        if driver.config.device_count == 0 {
            return Err(Status::NO_DEVICE);
        }
        driver.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn driver_version() -> DriverResult<i32> {
        Ok(HOST_DRIVER_VERSION)
    }

    fn device_count() -> DriverResult<i32> {
        Ok(entered()?.config.device_count as i32)
    }

    fn device_get(ordinal: i32) -> DriverResult<RawDevice> {
        entered()?.device(RawDevice(ordinal))
    }

    fn device_name(device: RawDevice) -> DriverResult<String> {
        let device = entered()?.device(device)?;
        Ok(format!("segdrv host device {}", device.0))
    }

    fn device_attribute(device: RawDevice, attr: DeviceAttribute) -> DriverResult<i32> {
        let driver = entered()?;
        driver.device(device)?;
        let value = match attr {
            DeviceAttribute::MaxThreadsPerBlock => HostConfig::MAX_THREADS_PER_BLOCK,
            DeviceAttribute::MaxGridDimX => HostConfig::MAX_GRID_DIM_X,
            DeviceAttribute::MaxGridDimY | DeviceAttribute::MaxGridDimZ => {
                HostConfig::MAX_GRID_DIM_YZ
            }
            DeviceAttribute::MaxSharedMemoryPerBlock => HostConfig::MAX_SHARED_MEMORY_PER_BLOCK,
            DeviceAttribute::WarpSize => HostConfig::WARP_SIZE,
            DeviceAttribute::MaxRegistersPerBlock => HostConfig::MAX_REGISTERS_PER_BLOCK,
            DeviceAttribute::MultiprocessorCount => driver.config.multiprocessor_count as i32,
            DeviceAttribute::EccEnabled => 0,
            DeviceAttribute::MaxThreadsPerMultiprocessor => {
                HostConfig::MAX_THREADS_PER_MULTIPROCESSOR
            }
            DeviceAttribute::MaxSharedMemoryPerMultiprocessor => {
                HostConfig::MAX_SHARED_MEMORY_PER_MULTIPROCESSOR
            }
            DeviceAttribute::ComputeCapabilityMajor => HostConfig::COMPUTE_CAPABILITY.0,
            DeviceAttribute::ComputeCapabilityMinor => HostConfig::COMPUTE_CAPABILITY.1,
        };
        Ok(value)
    }

    fn device_total_memory(device: RawDevice) -> DriverResult<u64> {
        let driver = entered()?;
        driver.device(device)?;
        Ok(driver.config.memory_bytes)
    }

    fn device_pci_bus_id(device: RawDevice) -> DriverResult<String> {
        let device = entered()?.device(device)?;
        Ok(format!("0000:{:02x}:00.0", device.0 + 1))
    }

    fn device_can_access_peer(device: RawDevice, peer: RawDevice) -> DriverResult<bool> {
        let driver = entered()?;
        driver.device(device)?;
        driver.device(peer)?;
        Ok(driver.config.peer_access && device != peer)
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    fn ctx_create(device: RawDevice, flags: u32) -> DriverResult<RawContext> {
        let driver = entered()?;
        driver.device(device)?;
        let sched = flags & 0x7;
        if flags & !CONTEXT_FLAG_MASK != 0 || !matches!(sched, 0 | 1 | 2 | 4) {
            return Err(Status::INVALID_VALUE);
        }

        let handle = RawContext(driver.next_handle());
        let fault = Arc::new(Fault::default());
        let default_stream = HostStream::spawn(
            RawStream(driver.next_handle()),
            handle,
            Arc::clone(&fault),
        )?;
        let ctx = HostContext {
            handle,
            device,
            cache_config: Mutex::new(CacheConfig::default()),
            shared_mem_config: Mutex::new(SharedMemConfig::default()),
            peers: Mutex::new(Vec::new()),
            default_stream: Arc::new(default_stream),
            fault,
        };
        driver.contexts.write().insert(handle, Arc::new(ctx));
        CURRENT.set(handle);
        Ok(handle)
    }

    fn ctx_destroy(ctx: RawContext) -> DriverResult<()> {
        let driver = entered()?;
        let context = driver
            .contexts
            .write()
            .remove(&ctx)
            .ok_or(Status::INVALID_CONTEXT)?;

        let _ = driver.synchronize_context(&context);
        for stream in driver.context_streams(&context) {
            stream.close();
        }
        driver.streams.write().retain(|_, s| s.context != ctx);
        driver.events.write().retain(|_, e| e.context != ctx);
        driver.modules.write().retain(|_, m| m.context != ctx);
        driver.functions.write().retain(|_, f| f.context != ctx);
        for other in driver.contexts.read().values() {
            other.peers.lock().retain(|&p| p != ctx);
        }
        // SAFETY: every stream of the context has been drained and closed.
        unsafe { driver.memory.release_context(ctx) };

        if CURRENT.get() == ctx {
            CURRENT.set(RawContext::NULL);
        }
        Ok(())
    }

    fn ctx_get_current() -> DriverResult<RawContext> {
        entered()?;
        Ok(CURRENT.get())
    }

    fn ctx_set_current(ctx: RawContext) -> DriverResult<()> {
        let driver = entered()?;
        if !ctx.is_null() {
            driver.context(ctx)?;
        }
        CURRENT.set(ctx);
        Ok(())
    }

    fn ctx_get_device() -> DriverResult<RawDevice> {
        Ok(entered()?.current()?.device)
    }

    fn ctx_synchronize() -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.current()?;
        driver.synchronize_context(&ctx)
    }

    fn ctx_set_cache_config(config: CacheConfig) -> DriverResult<()> {
        *entered()?.active()?.cache_config.lock() = config;
        Ok(())
    }

    fn ctx_get_shared_mem_config() -> DriverResult<SharedMemConfig> {
        Ok(*entered()?.active()?.shared_mem_config.lock())
    }

    fn ctx_set_shared_mem_config(config: SharedMemConfig) -> DriverResult<()> {
        *entered()?.active()?.shared_mem_config.lock() = config;
        Ok(())
    }

    fn ctx_enable_peer_access(peer: RawContext) -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.active()?;
        let peer_ctx = driver.context(peer)?;
        if !driver.config.peer_access || peer_ctx.device == ctx.device {
            return Err(Status::PEER_ACCESS_UNSUPPORTED);
        }
        let mut peers = ctx.peers.lock();
        if peers.contains(&peer) {
            return Err(Status::PEER_ACCESS_ALREADY_ENABLED);
        }
        peers.push(peer);
        Ok(())
    }

    fn mem_get_info() -> DriverResult<(u64, u64)> {
        let driver = entered()?;
        let ctx = driver.active()?;
        let total = driver.config.memory_bytes;
        Ok((total.saturating_sub(driver.memory.used(ctx.device)), total))
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    fn mem_alloc(bytes: usize) -> DriverResult<DevicePtr> {
        let driver = entered()?;
        let ctx = driver.active()?;
        driver.memory.allocate(
            bytes,
            ctx.handle,
            ctx.device,
            MemorySpace::Device,
            driver.config.memory_bytes,
        )
    }

    unsafe fn mem_free(ptr: DevicePtr) -> DriverResult<()> {
        let driver = entered()?;
        driver.quiesce_owner(ptr);
        unsafe { driver.memory.free(ptr, MemorySpace::Device) }
    }

    fn mem_alloc_host(bytes: usize) -> DriverResult<*mut c_void> {
        let driver = entered()?;
        let ctx = driver.active()?;
        let ptr = driver
            .memory
            .allocate(bytes, ctx.handle, ctx.device, MemorySpace::Host, u64::MAX)?;
        Ok(ptr as *mut c_void)
    }

    unsafe fn mem_free_host(ptr: *mut c_void) -> DriverResult<()> {
        let driver = entered()?;
        driver.quiesce_owner(ptr as DevicePtr);
        unsafe { driver.memory.free(ptr as DevicePtr, MemorySpace::Host) }
    }

    unsafe fn mem_host_register(ptr: *mut c_void, bytes: usize) -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.active()?;
        driver
            .memory
            .register(ptr as DevicePtr, bytes, ctx.handle, ctx.device)
    }

    unsafe fn mem_host_unregister(ptr: *mut c_void) -> DriverResult<()> {
        let driver = entered()?;
        driver.quiesce_owner(ptr as DevicePtr);
        driver.memory.unregister(ptr as DevicePtr)
    }

    unsafe fn memset_d8(dst: DevicePtr, value: u8, count: usize) -> DriverResult<()> {
        unsafe { entered()?.memset(dst, u32::from(value), 1, count) }
    }

    unsafe fn memset_d32(dst: DevicePtr, value: u32, count: usize) -> DriverResult<()> {
        unsafe { entered()?.memset(dst, value, 4, count) }
    }

    unsafe fn memset_d8_async(
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        entered()?.memset_async(dst, u32::from(value), 1, count, stream)
    }

    unsafe fn memset_d32_async(
        dst: DevicePtr,
        value: u32,
        count: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        entered()?.memset_async(dst, value, 4, count, stream)
    }

    unsafe fn memcpy_dtoh(dst: *mut c_void, src: DevicePtr, bytes: usize) -> DriverResult<()> {
        unsafe { entered()?.memcpy(dst as usize, src as usize, bytes, false, true) }
    }

    unsafe fn memcpy_htod(dst: DevicePtr, src: *const c_void, bytes: usize) -> DriverResult<()> {
        unsafe { entered()?.memcpy(dst as usize, src as usize, bytes, true, false) }
    }

    unsafe fn memcpy_dtod(dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()> {
        unsafe { entered()?.memcpy(dst as usize, src as usize, bytes, true, true) }
    }

    unsafe fn memcpy_dtoh_async(
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        entered()?.memcpy_async(dst as usize, src as usize, bytes, false, true, stream)
    }

    unsafe fn memcpy_htod_async(
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        entered()?.memcpy_async(dst as usize, src as usize, bytes, true, false, stream)
    }

    unsafe fn memcpy_dtod_async(
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        entered()?.memcpy_async(dst as usize, src as usize, bytes, true, true, stream)
    }

    fn pointer_context(ptr: DevicePtr) -> DriverResult<RawContext> {
        let driver = entered()?;
        driver
            .memory
            .lookup(ptr)
            .map(|r| r.context)
            .ok_or(Status::INVALID_VALUE)
    }

    fn pointer_memory_space(ptr: DevicePtr) -> DriverResult<MemorySpace> {
        let driver = entered()?;
        driver
            .memory
            .lookup(ptr)
            .map(|r| r.space)
            .ok_or(Status::INVALID_VALUE)
    }

    fn pointer_address_range(ptr: DevicePtr) -> DriverResult<(DevicePtr, usize)> {
        let driver = entered()?;
        driver
            .memory
            .lookup(ptr)
            .map(|r| (r.base, r.len))
            .ok_or(Status::NOT_FOUND)
    }

    // ------------------------------------------------------------------
    // Streams and events
    // ------------------------------------------------------------------

    fn stream_create() -> DriverResult<RawStream> {
        let driver = entered()?;
        let ctx = driver.active()?;
        let handle = RawStream(driver.next_handle());
        let stream = HostStream::spawn(handle, ctx.handle, Arc::clone(&ctx.fault))?;
        driver.streams.write().insert(handle, Arc::new(stream));
        Ok(handle)
    }

    fn stream_destroy(stream: RawStream) -> DriverResult<()> {
        let driver = entered()?;
        let removed = driver
            .streams
            .write()
            .remove(&stream)
            .ok_or(Status::INVALID_HANDLE)?;
        removed.close();
        Ok(())
    }

    fn stream_synchronize(stream: RawStream) -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.current()?;
        driver.stream(&ctx, stream)?.synchronize()
    }

    fn stream_query(stream: RawStream) -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.current()?;
        driver.stream(&ctx, stream)?.query()
    }

    fn stream_wait_event(stream: RawStream, event: RawEvent) -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.active()?;
        let stream = driver.stream(&ctx, stream)?;
        let event = driver.event(event)?;
        let ticket = event.recorded();
        if ticket == 0 {
            return Ok(());
        }
        stream.enqueue(Box::new(move |_: DriverResult<()>| {
            event.wait_for(ticket);
            Ok(())
        }))
    }

    fn stream_add_callback(stream: RawStream, callback: StreamCallback) -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.active()?;
        driver.stream(&ctx, stream)?.enqueue_callback(callback)
    }

    fn event_create(flags: EventFlags) -> DriverResult<RawEvent> {
        let driver = entered()?;
        let ctx = driver.active()?;
        let handle = RawEvent(driver.next_handle());
        driver
            .events
            .write()
            .insert(handle, Arc::new(HostEvent::new(ctx.handle, flags)));
        Ok(handle)
    }

    fn event_destroy(event: RawEvent) -> DriverResult<()> {
        entered()?
            .events
            .write()
            .remove(&event)
            .map(|_| ())
            .ok_or(Status::INVALID_HANDLE)
    }

    fn event_record(event: RawEvent, stream: RawStream) -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.active()?;
        let event = driver.event(event)?;
        if event.context != ctx.handle {
            return Err(Status::INVALID_HANDLE);
        }
        let stream = driver.stream(&ctx, stream)?;
        let ticket = event.next_ticket();
        let marker = Arc::clone(&event);
        let queued = stream.enqueue(Box::new(move |_: DriverResult<()>| {
            marker.complete(ticket);
            Ok(())
        }));
        if queued.is_err() {
            event.complete(ticket);
        }
        queued
    }

    fn event_query(event: RawEvent) -> DriverResult<()> {
        let driver = entered()?;
        let event = driver.event(event)?;
        driver.context(event.context)?.fault.check()?;
        if event.is_complete() {
            Ok(())
        } else {
            Err(Status::NOT_READY)
        }
    }

    fn event_synchronize(event: RawEvent) -> DriverResult<()> {
        let driver = entered()?;
        let event = driver.event(event)?;
        event.wait_for(event.recorded());
        driver.context(event.context)?.fault.check()
    }

    fn event_elapsed_time(start: RawEvent, stop: RawEvent) -> DriverResult<f32> {
        let driver = entered()?;
        let start = driver.event(start)?.timestamp()?;
        let stop = driver.event(stop)?.timestamp()?;
        let ms = if stop >= start {
            stop.duration_since(start).as_secs_f64() * 1e3
        } else {
            -(start.duration_since(stop).as_secs_f64() * 1e3)
        };
        Ok(ms as f32)
    }

    // ------------------------------------------------------------------
    // Modules and launches
    // ------------------------------------------------------------------

    fn module_load(image: &'static KernelImage) -> DriverResult<RawModule> {
        let driver = entered()?;
        let ctx = driver.active()?;
        if image.host.is_empty() {
            return Err(Status::NO_BINARY_FOR_GPU);
        }
        let globals = driver.load_globals(&ctx, image)?;
        let handle = RawModule(driver.next_handle());
        driver.modules.write().insert(
            handle,
            HostModule {
                context: ctx.handle,
                image,
                globals,
            },
        );
        Ok(handle)
    }

    fn module_unload(module: RawModule) -> DriverResult<()> {
        let driver = entered()?;
        let removed = driver
            .modules
            .write()
            .remove(&module)
            .ok_or(Status::INVALID_HANDLE)?;
        driver.functions.write().retain(|_, f| f.module != module);
        driver.free_globals(&removed.globals);
        Ok(())
    }

    fn module_get_function(module: RawModule, name: &str) -> DriverResult<RawFunction> {
        let driver = entered()?;
        let (context, kernel) = {
            let modules = driver.modules.read();
            let module = modules.get(&module).ok_or(Status::INVALID_HANDLE)?;
            let kernel = module.image.host_kernel(name).ok_or(Status::NOT_FOUND)?;
            (module.context, kernel)
        };
        let handle = RawFunction(driver.next_handle());
        driver.functions.write().insert(
            handle,
            HostFunction {
                module,
                context,
                kernel,
                cache_config: CacheConfig::default(),
            },
        );
        Ok(handle)
    }

    fn module_get_global(module: RawModule, name: &str) -> DriverResult<(DevicePtr, usize)> {
        let driver = entered()?;
        let modules = driver.modules.read();
        let module = modules.get(&module).ok_or(Status::INVALID_HANDLE)?;
        module
            .globals
            .iter()
            .find(|(global, _, _)| *global == name)
            .map(|&(_, ptr, bytes)| (ptr, bytes))
            .ok_or(Status::NOT_FOUND)
    }

    fn func_get_attribute(func: RawFunction, attr: FunctionAttribute) -> DriverResult<i32> {
        entered()?.function(func)?;
        Ok(match attr {
            FunctionAttribute::MaxThreadsPerBlock => HostConfig::MAX_THREADS_PER_BLOCK,
            FunctionAttribute::SharedSizeBytes => 0,
            FunctionAttribute::NumRegs => 32,
        })
    }

    fn func_set_cache_config(func: RawFunction, config: CacheConfig) -> DriverResult<()> {
        let driver = entered()?;
        let mut functions = driver.functions.write();
        let function = functions.get_mut(&func).ok_or(Status::INVALID_HANDLE)?;
        function.cache_config = config;
        Ok(())
    }

    fn occupancy_max_active_blocks(
        func: RawFunction,
        block_size: u32,
        dynamic_shared_mem: usize,
    ) -> DriverResult<i32> {
        entered()?.function(func)?;
        if block_size == 0 {
            return Err(Status::INVALID_VALUE);
        }
        if block_size > HostConfig::MAX_THREADS_PER_BLOCK as u32
            || dynamic_shared_mem > HostConfig::MAX_SHARED_MEMORY_PER_BLOCK as usize
        {
            return Ok(0);
        }
        let warp = HostConfig::WARP_SIZE as u32;
        let threads = block_size.div_ceil(warp) * warp;
        let mut blocks = HostConfig::MAX_THREADS_PER_MULTIPROCESSOR / threads as i32;
        if dynamic_shared_mem > 0 {
            let by_shared =
                HostConfig::MAX_SHARED_MEMORY_PER_MULTIPROCESSOR as usize / dynamic_shared_mem;
            blocks = blocks.min(by_shared as i32);
        }
        Ok(blocks.min(MAX_BLOCKS_PER_MULTIPROCESSOR))
    }

    unsafe fn launch_kernel(
        func: RawFunction,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: RawStream,
        params: &[*mut c_void],
    ) -> DriverResult<()> {
        let driver = entered()?;
        let ctx = driver.active()?;
        let (context, kernel) = driver.function(func)?;
        if context != ctx.handle {
            return Err(Status::INVALID_CONTEXT);
        }

        if grid.volume() == 0 || block.volume() == 0 {
            return Err(Status::INVALID_VALUE);
        }
        if block.volume() > HostConfig::MAX_THREADS_PER_BLOCK as u64 || block.z > 64 {
            return Err(Status::INVALID_VALUE);
        }
        if grid.y > HostConfig::MAX_GRID_DIM_YZ as u32 || grid.z > HostConfig::MAX_GRID_DIM_YZ as u32 {
            return Err(Status::INVALID_VALUE);
        }
        if shared_mem_bytes > HostConfig::MAX_SHARED_MEMORY_PER_BLOCK as u32 {
            return Err(Status::LAUNCH_OUT_OF_RESOURCES);
        }
        if params.len() != kernel.params.len() || params.iter().any(|p| p.is_null()) {
            return Err(Status::INVALID_VALUE);
        }

        // Parameter values are captured now; the caller's storage may go away
        // as soon as this returns.
        let values = params
            .iter()
            .zip(kernel.params)
            .map(|(&p, &size)| {
                // SAFETY: caller guarantees `p` points at a value of the kernel's
                // parameter type, whose size is `size`.
                unsafe { std::slice::from_raw_parts(p as *const u8, size) }.to_vec()
            })
            .collect();

        let stream = driver.stream(&ctx, stream)?;
        let peers = ctx.peers.lock().clone();
        let launch = HostLaunch::new(grid, block, values, ctx.handle, peers, &driver.memory);
        let entry = kernel.entry;
        stream.enqueue(Box::new(move |status: DriverResult<()>| {
            status?;
            entry(&launch)
        }))
    }
}
