//! CUDA backend
//!
//! Thin translation of the `Backend` contract onto the CUDA driver API through
//! `cudarc::driver::sys`. Handles are the driver's own pointers, statuses are the
//! driver's own `CUresult` values, and kernels come from the PTX that `build.rs`
//! compiled into `$CUDA_KERNEL_DIR`.

use super::{
    Backend, CacheConfig, DeviceAttribute, DevicePtr, Dim3, DriverResult, EventFlags,
    FunctionAttribute, KernelImage, MemorySpace, RawContext, RawDevice, RawEvent, RawFunction,
    RawModule, RawStream, SharedMemConfig, Status, StreamCallback,
};
use cudarc::driver::sys;
use std::ffi::{CStr, CString, c_char, c_int, c_uint, c_void};

/// Directory containing compiled PTX files (set by build.rs)
const KERNEL_DIR: &str = env!("CUDA_KERNEL_DIR");

/// Length of the buffer used for device names and PCI bus ids
const NAME_LEN: usize = 256;

/// CUDA driver API backend
#[derive(Clone, Copy, Debug, Default)]
pub struct CudaBackend;

// ============================================================================
// Translation helpers
// ============================================================================

#[inline]
fn check(result: sys::CUresult) -> DriverResult<()> {
    Status(result as u32).into_result()
}

#[inline]
fn cu_ctx(ctx: RawContext) -> sys::CUcontext {
    ctx.0 as sys::CUcontext
}

#[inline]
fn cu_stream(stream: RawStream) -> sys::CUstream {
    stream.0 as sys::CUstream
}

#[inline]
fn cu_event(event: RawEvent) -> sys::CUevent {
    event.0 as sys::CUevent
}

#[inline]
fn cu_module(module: RawModule) -> sys::CUmodule {
    module.0 as sys::CUmodule
}

#[inline]
fn cu_function(func: RawFunction) -> sys::CUfunction {
    func.0 as sys::CUfunction
}

fn cu_device_attribute(attr: DeviceAttribute) -> sys::CUdevice_attribute {
    use sys::CUdevice_attribute as A;
    match attr {
        DeviceAttribute::MaxThreadsPerBlock => A::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
        DeviceAttribute::MaxGridDimX => A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X,
        DeviceAttribute::MaxGridDimY => A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y,
        DeviceAttribute::MaxGridDimZ => A::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z,
        DeviceAttribute::MaxSharedMemoryPerBlock => {
            A::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK
        }
        DeviceAttribute::WarpSize => A::CU_DEVICE_ATTRIBUTE_WARP_SIZE,
        DeviceAttribute::MaxRegistersPerBlock => A::CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_BLOCK,
        DeviceAttribute::MultiprocessorCount => A::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
        DeviceAttribute::EccEnabled => A::CU_DEVICE_ATTRIBUTE_ECC_ENABLED,
        DeviceAttribute::MaxThreadsPerMultiprocessor => {
            A::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_MULTIPROCESSOR
        }
        DeviceAttribute::MaxSharedMemoryPerMultiprocessor => {
            A::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_MULTIPROCESSOR
        }
        DeviceAttribute::ComputeCapabilityMajor => {
            A::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR
        }
        DeviceAttribute::ComputeCapabilityMinor => {
            A::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR
        }
    }
}

fn cu_cache_config(config: CacheConfig) -> sys::CUfunc_cache {
    use sys::CUfunc_cache as C;
    match config {
        CacheConfig::PreferNone => C::CU_FUNC_CACHE_PREFER_NONE,
        CacheConfig::PreferShared => C::CU_FUNC_CACHE_PREFER_SHARED,
        CacheConfig::PreferL1 => C::CU_FUNC_CACHE_PREFER_L1,
        CacheConfig::PreferEqual => C::CU_FUNC_CACHE_PREFER_EQUAL,
    }
}

fn cu_shared_config(config: SharedMemConfig) -> sys::CUsharedconfig {
    use sys::CUsharedconfig as S;
    match config {
        SharedMemConfig::DefaultBankSize => S::CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE,
        SharedMemConfig::FourByteBankSize => S::CU_SHARED_MEM_CONFIG_FOUR_BYTE_BANK_SIZE,
        SharedMemConfig::EightByteBankSize => S::CU_SHARED_MEM_CONFIG_EIGHT_BYTE_BANK_SIZE,
    }
}

/// Read a NUL-terminated string written by the driver into `buf`.
fn driver_string(buf: &[c_char]) -> String {
    // SAFETY: the buffer is zero-initialized, so it is NUL-terminated even if
    // the driver filled it completely except for the last byte.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Fires a boxed `StreamCallback` registered by `stream_add_callback`.
unsafe extern "C" fn stream_callback_trampoline(
    _stream: sys::CUstream,
    status: sys::CUresult,
    data: *mut c_void,
) {
    // SAFETY: `data` is the box leaked by `stream_add_callback`; the driver
    // invokes each callback exactly once.
    let callback = unsafe { Box::from_raw(data as *mut StreamCallback) };
    callback(Status(status as u32).into_result());
}

// ============================================================================
// Backend implementation
// ============================================================================

impl Backend for CudaBackend {
    const NAME: &'static str = "cuda";

    fn init() -> DriverResult<()> {
        unsafe { check(sys::cuInit(0)) }
    }

    fn driver_version() -> DriverResult<i32> {
        let mut version: c_int = 0;
        unsafe { check(sys::cuDriverGetVersion(&mut version))? };
        Ok(version)
    }

    fn device_count() -> DriverResult<i32> {
        let mut count: c_int = 0;
        unsafe { check(sys::cuDeviceGetCount(&mut count))? };
        Ok(count)
    }

    fn device_get(ordinal: i32) -> DriverResult<RawDevice> {
        let mut device: sys::CUdevice = 0;
        unsafe { check(sys::cuDeviceGet(&mut device, ordinal))? };
        Ok(RawDevice(device))
    }

    fn device_name(device: RawDevice) -> DriverResult<String> {
        let mut buf = [0 as c_char; NAME_LEN];
        unsafe {
            check(sys::cuDeviceGetName(
                buf.as_mut_ptr(),
                (NAME_LEN - 1) as c_int,
                device.0,
            ))?
        };
        Ok(driver_string(&buf))
    }

    fn device_attribute(device: RawDevice, attr: DeviceAttribute) -> DriverResult<i32> {
        let mut value: c_int = 0;
        unsafe {
            check(sys::cuDeviceGetAttribute(
                &mut value,
                cu_device_attribute(attr),
                device.0,
            ))?
        };
        Ok(value)
    }

    fn device_total_memory(device: RawDevice) -> DriverResult<u64> {
        let mut bytes: usize = 0;
        unsafe { check(sys::cuDeviceTotalMem_v2(&mut bytes, device.0))? };
        Ok(bytes as u64)
    }

    fn device_pci_bus_id(device: RawDevice) -> DriverResult<String> {
        let mut buf = [0 as c_char; NAME_LEN];
        unsafe {
            check(sys::cuDeviceGetPCIBusId(
                buf.as_mut_ptr(),
                (NAME_LEN - 1) as c_int,
                device.0,
            ))?
        };
        Ok(driver_string(&buf))
    }

    fn device_can_access_peer(device: RawDevice, peer: RawDevice) -> DriverResult<bool> {
        let mut can_access: c_int = 0;
        unsafe { check(sys::cuDeviceCanAccessPeer(&mut can_access, device.0, peer.0))? };
        Ok(can_access != 0)
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    fn ctx_create(device: RawDevice, flags: u32) -> DriverResult<RawContext> {
        let mut ctx: sys::CUcontext = std::ptr::null_mut();
        unsafe { check(sys::cuCtxCreate_v2(&mut ctx, flags as c_uint, device.0))? };
        Ok(RawContext(ctx as usize))
    }

    fn ctx_destroy(ctx: RawContext) -> DriverResult<()> {
        unsafe { check(sys::cuCtxDestroy_v2(cu_ctx(ctx))) }
    }

    fn ctx_get_current() -> DriverResult<RawContext> {
        let mut ctx: sys::CUcontext = std::ptr::null_mut();
        unsafe { check(sys::cuCtxGetCurrent(&mut ctx))? };
        Ok(RawContext(ctx as usize))
    }

    fn ctx_set_current(ctx: RawContext) -> DriverResult<()> {
        unsafe { check(sys::cuCtxSetCurrent(cu_ctx(ctx))) }
    }

    fn ctx_get_device() -> DriverResult<RawDevice> {
        let mut device: sys::CUdevice = 0;
        unsafe { check(sys::cuCtxGetDevice(&mut device))? };
        Ok(RawDevice(device))
    }

    fn ctx_synchronize() -> DriverResult<()> {
        unsafe { check(sys::cuCtxSynchronize()) }
    }

    fn ctx_set_cache_config(config: CacheConfig) -> DriverResult<()> {
        unsafe { check(sys::cuCtxSetCacheConfig(cu_cache_config(config))) }
    }

    fn ctx_get_shared_mem_config() -> DriverResult<SharedMemConfig> {
        let mut config = sys::CUsharedconfig::CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE;
        unsafe { check(sys::cuCtxGetSharedMemConfig(&mut config))? };
        SharedMemConfig::from_raw(config as u32).ok_or(Status::UNKNOWN)
    }

    fn ctx_set_shared_mem_config(config: SharedMemConfig) -> DriverResult<()> {
        unsafe { check(sys::cuCtxSetSharedMemConfig(cu_shared_config(config))) }
    }

    fn ctx_enable_peer_access(peer: RawContext) -> DriverResult<()> {
        unsafe { check(sys::cuCtxEnablePeerAccess(cu_ctx(peer), 0)) }
    }

    fn mem_get_info() -> DriverResult<(u64, u64)> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        unsafe { check(sys::cuMemGetInfo_v2(&mut free, &mut total))? };
        Ok((free as u64, total as u64))
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    fn mem_alloc(bytes: usize) -> DriverResult<DevicePtr> {
        let mut ptr: sys::CUdeviceptr = 0;
        unsafe { check(sys::cuMemAlloc_v2(&mut ptr, bytes))? };
        Ok(ptr)
    }

    unsafe fn mem_free(ptr: DevicePtr) -> DriverResult<()> {
        unsafe { check(sys::cuMemFree_v2(ptr)) }
    }

    fn mem_alloc_host(bytes: usize) -> DriverResult<*mut c_void> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        unsafe { check(sys::cuMemAllocHost_v2(&mut ptr, bytes))? };
        Ok(ptr)
    }

    unsafe fn mem_free_host(ptr: *mut c_void) -> DriverResult<()> {
        unsafe { check(sys::cuMemFreeHost(ptr)) }
    }

    unsafe fn mem_host_register(ptr: *mut c_void, bytes: usize) -> DriverResult<()> {
        unsafe { check(sys::cuMemHostRegister_v2(ptr, bytes, 0)) }
    }

    unsafe fn mem_host_unregister(ptr: *mut c_void) -> DriverResult<()> {
        unsafe { check(sys::cuMemHostUnregister(ptr)) }
    }

    unsafe fn memset_d8(dst: DevicePtr, value: u8, count: usize) -> DriverResult<()> {
        unsafe { check(sys::cuMemsetD8_v2(dst, value, count)) }
    }

    unsafe fn memset_d32(dst: DevicePtr, value: u32, count: usize) -> DriverResult<()> {
        unsafe { check(sys::cuMemsetD32_v2(dst, value, count)) }
    }

    unsafe fn memset_d8_async(
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        unsafe { check(sys::cuMemsetD8Async(dst, value, count, cu_stream(stream))) }
    }

    unsafe fn memset_d32_async(
        dst: DevicePtr,
        value: u32,
        count: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        unsafe { check(sys::cuMemsetD32Async(dst, value, count, cu_stream(stream))) }
    }

    unsafe fn memcpy_dtoh(dst: *mut c_void, src: DevicePtr, bytes: usize) -> DriverResult<()> {
        unsafe { check(sys::cuMemcpyDtoH_v2(dst, src, bytes)) }
    }

    unsafe fn memcpy_htod(dst: DevicePtr, src: *const c_void, bytes: usize) -> DriverResult<()> {
        unsafe { check(sys::cuMemcpyHtoD_v2(dst, src, bytes)) }
    }

    unsafe fn memcpy_dtod(dst: DevicePtr, src: DevicePtr, bytes: usize) -> DriverResult<()> {
        unsafe { check(sys::cuMemcpyDtoD_v2(dst, src, bytes)) }
    }

    unsafe fn memcpy_dtoh_async(
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        unsafe { check(sys::cuMemcpyDtoHAsync_v2(dst, src, bytes, cu_stream(stream))) }
    }

    unsafe fn memcpy_htod_async(
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        unsafe { check(sys::cuMemcpyHtoDAsync_v2(dst, src, bytes, cu_stream(stream))) }
    }

    unsafe fn memcpy_dtod_async(
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        unsafe { check(sys::cuMemcpyDtoDAsync_v2(dst, src, bytes, cu_stream(stream))) }
    }

    fn pointer_context(ptr: DevicePtr) -> DriverResult<RawContext> {
        let mut ctx: sys::CUcontext = std::ptr::null_mut();
        unsafe {
            check(sys::cuPointerGetAttribute(
                &mut ctx as *mut sys::CUcontext as *mut c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_CONTEXT,
                ptr,
            ))?
        };
        Ok(RawContext(ctx as usize))
    }

    fn pointer_memory_space(ptr: DevicePtr) -> DriverResult<MemorySpace> {
        let mut memory_type: c_uint = 0;
        unsafe {
            check(sys::cuPointerGetAttribute(
                &mut memory_type as *mut c_uint as *mut c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
                ptr,
            ))?
        };
        // CU_MEMORYTYPE_HOST = 1; device, array and unified all live on the device
        Ok(if memory_type == 1 {
            MemorySpace::Host
        } else {
            MemorySpace::Device
        })
    }

    fn pointer_address_range(ptr: DevicePtr) -> DriverResult<(DevicePtr, usize)> {
        let mut base: sys::CUdeviceptr = 0;
        let mut size: usize = 0;
        unsafe { check(sys::cuMemGetAddressRange_v2(&mut base, &mut size, ptr))? };
        Ok((base, size))
    }

    // ------------------------------------------------------------------
    // Streams and events
    // ------------------------------------------------------------------

    fn stream_create() -> DriverResult<RawStream> {
        let mut stream: sys::CUstream = std::ptr::null_mut();
        unsafe { check(sys::cuStreamCreate(&mut stream, 0))? };
        Ok(RawStream(stream as usize))
    }

    fn stream_destroy(stream: RawStream) -> DriverResult<()> {
        unsafe { check(sys::cuStreamDestroy_v2(cu_stream(stream))) }
    }

    fn stream_synchronize(stream: RawStream) -> DriverResult<()> {
        unsafe { check(sys::cuStreamSynchronize(cu_stream(stream))) }
    }

    fn stream_query(stream: RawStream) -> DriverResult<()> {
        unsafe { check(sys::cuStreamQuery(cu_stream(stream))) }
    }

    fn stream_wait_event(stream: RawStream, event: RawEvent) -> DriverResult<()> {
        unsafe { check(sys::cuStreamWaitEvent(cu_stream(stream), cu_event(event), 0)) }
    }

    fn stream_add_callback(stream: RawStream, callback: StreamCallback) -> DriverResult<()> {
        let data = Box::into_raw(Box::new(callback)) as *mut c_void;
        let result = unsafe {
            check(sys::cuStreamAddCallback(
                cu_stream(stream),
                Some(stream_callback_trampoline),
                data,
                0,
            ))
        };
        if result.is_err() {
            // SAFETY: the driver rejected the callback, so it will never fire.
            drop(unsafe { Box::from_raw(data as *mut StreamCallback) });
        }
        result
    }

    fn event_create(flags: EventFlags) -> DriverResult<RawEvent> {
        let raw_flags = match flags {
            EventFlags::Default => 0,
            EventFlags::DisableTiming => sys::CUevent_flags::CU_EVENT_DISABLE_TIMING as c_uint,
        };
        let mut event: sys::CUevent = std::ptr::null_mut();
        unsafe { check(sys::cuEventCreate(&mut event, raw_flags))? };
        Ok(RawEvent(event as usize))
    }

    fn event_destroy(event: RawEvent) -> DriverResult<()> {
        unsafe { check(sys::cuEventDestroy_v2(cu_event(event))) }
    }

    fn event_record(event: RawEvent, stream: RawStream) -> DriverResult<()> {
        unsafe { check(sys::cuEventRecord(cu_event(event), cu_stream(stream))) }
    }

    fn event_query(event: RawEvent) -> DriverResult<()> {
        unsafe { check(sys::cuEventQuery(cu_event(event))) }
    }

    fn event_synchronize(event: RawEvent) -> DriverResult<()> {
        unsafe { check(sys::cuEventSynchronize(cu_event(event))) }
    }

    fn event_elapsed_time(start: RawEvent, stop: RawEvent) -> DriverResult<f32> {
        let mut ms: f32 = 0.0;
        unsafe { check(sys::cuEventElapsedTime(&mut ms, cu_event(start), cu_event(stop)))? };
        Ok(ms)
    }

    // ------------------------------------------------------------------
    // Modules and launches
    // ------------------------------------------------------------------

    fn module_load(image: &'static KernelImage) -> DriverResult<RawModule> {
        let path = format!("{}/{}.ptx", KERNEL_DIR, image.name);
        let ptx = std::fs::read(&path).map_err(|_| Status::FILE_NOT_FOUND)?;
        let ptx = CString::new(ptx).map_err(|_| Status::INVALID_IMAGE)?;
        let mut module: sys::CUmodule = std::ptr::null_mut();
        unsafe { check(sys::cuModuleLoadData(&mut module, ptx.as_ptr() as *const c_void))? };
        Ok(RawModule(module as usize))
    }

    fn module_unload(module: RawModule) -> DriverResult<()> {
        unsafe { check(sys::cuModuleUnload(cu_module(module))) }
    }

    fn module_get_function(module: RawModule, name: &str) -> DriverResult<RawFunction> {
        let name = CString::new(name).map_err(|_| Status::INVALID_VALUE)?;
        let mut func: sys::CUfunction = std::ptr::null_mut();
        unsafe {
            check(sys::cuModuleGetFunction(
                &mut func,
                cu_module(module),
                name.as_ptr(),
            ))?
        };
        Ok(RawFunction(func as usize))
    }

    fn module_get_global(module: RawModule, name: &str) -> DriverResult<(DevicePtr, usize)> {
        let name = CString::new(name).map_err(|_| Status::INVALID_VALUE)?;
        let mut ptr: sys::CUdeviceptr = 0;
        let mut bytes: usize = 0;
        unsafe {
            check(sys::cuModuleGetGlobal_v2(
                &mut ptr,
                &mut bytes,
                cu_module(module),
                name.as_ptr(),
            ))?
        };
        Ok((ptr, bytes))
    }

    fn func_get_attribute(func: RawFunction, attr: FunctionAttribute) -> DriverResult<i32> {
        use sys::CUfunction_attribute as F;
        let attrib = match attr {
            FunctionAttribute::MaxThreadsPerBlock => F::CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
            FunctionAttribute::SharedSizeBytes => F::CU_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES,
            FunctionAttribute::NumRegs => F::CU_FUNC_ATTRIBUTE_NUM_REGS,
        };
        let mut value: c_int = 0;
        unsafe { check(sys::cuFuncGetAttribute(&mut value, attrib, cu_function(func)))? };
        Ok(value)
    }

    fn func_set_cache_config(func: RawFunction, config: CacheConfig) -> DriverResult<()> {
        unsafe {
            check(sys::cuFuncSetCacheConfig(
                cu_function(func),
                cu_cache_config(config),
            ))
        }
    }

    fn occupancy_max_active_blocks(
        func: RawFunction,
        block_size: u32,
        dynamic_shared_mem: usize,
    ) -> DriverResult<i32> {
        let mut blocks: c_int = 0;
        unsafe {
            check(sys::cuOccupancyMaxActiveBlocksPerMultiprocessor(
                &mut blocks,
                cu_function(func),
                block_size as c_int,
                dynamic_shared_mem,
            ))?
        };
        Ok(blocks)
    }

    unsafe fn launch_kernel(
        func: RawFunction,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: RawStream,
        params: &[*mut c_void],
    ) -> DriverResult<()> {
        // The driver copies the parameter values during the call and never
        // writes through the array itself.
        let mut params = params.to_vec();
        unsafe {
            check(sys::cuLaunchKernel(
                cu_function(func),
                grid.x,
                grid.y,
                grid.z,
                block.x,
                block.y,
                block.z,
                shared_mem_bytes,
                cu_stream(stream),
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            ))
        }
    }
}
