//! Memory allocation, fills, transfers and pointer queries

use super::{Context, Device, Driver, ScopedActivateContext, Stream, logged};
use crate::error::{Error, Result};
use crate::runtime::{Backend, DevicePtr, MemorySpace, Status};
use bytemuck::Pod;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

// ============================================================================
// Allocation
// ============================================================================

impl<B: Backend> Driver<B> {
    /// Allocate `bytes` of device memory in `context`, `None` on failure.
    pub fn device_allocate(context: &Context<B>, bytes: usize) -> Option<DevicePtr> {
        Self::try_device_allocate(context, bytes).ok()
    }

    /// Allocate `bytes` of device memory in `context`.
    pub fn try_device_allocate(context: &Context<B>, bytes: usize) -> Result<DevicePtr> {
        let _scope = ScopedActivateContext::new(context)?;
        let ptr = logged::<B, _>("device_allocate", B::mem_alloc(bytes)).map_err(|status| {
            Error::Allocation {
                op: "device_allocate",
                bytes,
                status,
            }
        })?;
        tracing::trace!(
            backend = B::NAME,
            context = context.id(),
            "allocated {} bytes at 0x{:x}",
            bytes,
            ptr
        );
        Ok(ptr)
    }

    /// Free device memory. Returns false (after logging) on failure.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Driver::device_allocate`] in `context` and must not
    /// be used afterwards.
    pub unsafe fn device_deallocate(context: &Context<B>, ptr: DevicePtr) -> bool {
        unsafe { Self::try_device_deallocate(context, ptr) }.is_ok()
    }

    /// Free device memory.
    ///
    /// # Safety
    ///
    /// Same contract as [`Driver::device_deallocate`].
    pub unsafe fn try_device_deallocate(context: &Context<B>, ptr: DevicePtr) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("device_deallocate", unsafe { B::mem_free(ptr) }).map_err(|status| {
            Error::Allocation {
                op: "device_deallocate",
                bytes: 0,
                status,
            }
        })
    }

    /// Allocate page-locked host memory, `None` on failure.
    pub fn host_allocate(context: &Context<B>, bytes: usize) -> Option<*mut c_void> {
        Self::try_host_allocate(context, bytes).ok()
    }

    /// Allocate page-locked host memory.
    pub fn try_host_allocate(context: &Context<B>, bytes: usize) -> Result<*mut c_void> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("host_allocate", B::mem_alloc_host(bytes)).map_err(|status| {
            Error::Allocation {
                op: "host_allocate",
                bytes,
                status,
            }
        })
    }

    /// Free page-locked host memory. Returns false (after logging) on failure.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Driver::host_allocate`] and must not be used
    /// afterwards.
    pub unsafe fn host_deallocate(context: &Context<B>, ptr: *mut c_void) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("host_deallocate", unsafe { B::mem_free_host(ptr) }).is_ok()
    }

    /// Page-lock an existing host range so the device can access it.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + bytes` must stay allocated until [`Driver::host_unregister`].
    pub unsafe fn host_register(context: &Context<B>, ptr: *mut c_void, bytes: usize) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("host_register", unsafe { B::mem_host_register(ptr, bytes) }).is_ok()
    }

    /// Undo [`Driver::host_register`].
    ///
    /// # Safety
    ///
    /// No queued operation may still reference the range.
    pub unsafe fn host_unregister(context: &Context<B>, ptr: *mut c_void) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("host_unregister", unsafe { B::mem_host_unregister(ptr) }).is_ok()
    }
}

// ============================================================================
// Fills and transfers
// ============================================================================

impl<B: Backend> Driver<B> {
    /// Fill `count` bytes at `dst` with `value` and wait for completion.
    ///
    /// # Safety
    ///
    /// `dst..dst + count` must be device memory of `context`.
    pub unsafe fn synchronous_memset_u8(
        context: &Context<B>,
        dst: DevicePtr,
        value: u8,
        count: usize,
    ) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("memset_d8", unsafe { B::memset_d8(dst, value, count) }).map_err(
            |status| Error::Transfer {
                op: "memset_d8",
                bytes: count,
                status,
            },
        )
    }

    /// Fill `count` 32-bit words at `dst` with `value` and wait for completion.
    ///
    /// # Safety
    ///
    /// `dst..dst + 4 * count` must be 4-byte aligned device memory of `context`.
    pub unsafe fn synchronous_memset_u32(
        context: &Context<B>,
        dst: DevicePtr,
        value: u32,
        count: usize,
    ) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("memset_d32", unsafe { B::memset_d32(dst, value, count) }).map_err(
            |status| Error::Transfer {
                op: "memset_d32",
                bytes: count.saturating_mul(4),
                status,
            },
        )
    }

    /// Queue an 8-bit fill on `stream`.
    ///
    /// # Safety
    ///
    /// As [`Driver::synchronous_memset_u8`], and the range must stay valid until
    /// the fill has run.
    pub unsafe fn async_memset_u8(
        context: &Context<B>,
        dst: DevicePtr,
        value: u8,
        count: usize,
        stream: &Stream<B>,
    ) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("memset_d8_async", unsafe {
            B::memset_d8_async(dst, value, count, stream.raw())
        })
        .is_ok()
    }

    /// Queue a 32-bit fill on `stream`.
    ///
    /// # Safety
    ///
    /// As [`Driver::synchronous_memset_u32`], and the range must stay valid
    /// until the fill has run.
    pub unsafe fn async_memset_u32(
        context: &Context<B>,
        dst: DevicePtr,
        value: u32,
        count: usize,
        stream: &Stream<B>,
    ) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("memset_d32_async", unsafe {
            B::memset_d32_async(dst, value, count, stream.raw())
        })
        .is_ok()
    }

    /// Copy `bytes` from device to host and wait for completion.
    ///
    /// # Safety
    ///
    /// `dst` must be writable for `bytes`; `src..src + bytes` must be device
    /// memory visible to `context`.
    pub unsafe fn synchronous_memcpy_d2h(
        context: &Context<B>,
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
    ) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("memcpy_d2h", unsafe { B::memcpy_dtoh(dst, src, bytes) }).map_err(
            |status| Error::Transfer {
                op: "memcpy_d2h",
                bytes,
                status,
            },
        )
    }

    /// Copy `bytes` from host to device and wait for completion.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `bytes`; `dst..dst + bytes` must be device
    /// memory visible to `context`.
    pub unsafe fn synchronous_memcpy_h2d(
        context: &Context<B>,
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
    ) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("memcpy_h2d", unsafe { B::memcpy_htod(dst, src, bytes) }).map_err(
            |status| Error::Transfer {
                op: "memcpy_h2d",
                bytes,
                status,
            },
        )
    }

    /// Copy `bytes` between device ranges and wait for completion.
    ///
    /// # Safety
    ///
    /// Both ranges must be device memory visible to `context`.
    pub unsafe fn synchronous_memcpy_d2d(
        context: &Context<B>,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    ) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("memcpy_d2d", unsafe { B::memcpy_dtod(dst, src, bytes) }).map_err(
            |status| Error::Transfer {
                op: "memcpy_d2d",
                bytes,
                status,
            },
        )
    }

    /// Queue a device-to-host copy on `stream`.
    ///
    /// # Safety
    ///
    /// As [`Driver::synchronous_memcpy_d2h`], and both ranges must stay valid
    /// until the copy has run.
    pub unsafe fn async_memcpy_d2h(
        context: &Context<B>,
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream<B>,
    ) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("memcpy_d2h_async", unsafe {
            B::memcpy_dtoh_async(dst, src, bytes, stream.raw())
        })
        .is_ok()
    }

    /// Queue a host-to-device copy on `stream`.
    ///
    /// # Safety
    ///
    /// As [`Driver::synchronous_memcpy_h2d`], and both ranges must stay valid
    /// until the copy has run.
    pub unsafe fn async_memcpy_h2d(
        context: &Context<B>,
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
        stream: &Stream<B>,
    ) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("memcpy_h2d_async", unsafe {
            B::memcpy_htod_async(dst, src, bytes, stream.raw())
        })
        .is_ok()
    }

    /// Queue a device-to-device copy on `stream`.
    ///
    /// # Safety
    ///
    /// As [`Driver::synchronous_memcpy_d2d`], and both ranges must stay valid
    /// until the copy has run.
    pub unsafe fn async_memcpy_d2d(
        context: &Context<B>,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream<B>,
    ) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("memcpy_d2d_async", unsafe {
            B::memcpy_dtod_async(dst, src, bytes, stream.raw())
        })
        .is_ok()
    }
}

// ============================================================================
// Pointer queries
// ============================================================================

impl<B: Backend> Driver<B> {
    /// Context that owns the allocation containing `ptr`.
    pub fn get_pointer_context(ptr: DevicePtr) -> Result<Arc<Context<B>>> {
        let raw = logged::<B, _>("pointer_context", B::pointer_context(ptr)).map_err(|status| {
            Error::Query {
                op: "pointer_context",
                status,
            }
        })?;
        Context::from_raw(raw).ok_or_else(|| {
            super::log_failure(B::NAME, "pointer_context", Status::INVALID_CONTEXT);
            Error::Query {
                op: "pointer_context",
                status: Status::INVALID_CONTEXT,
            }
        })
    }

    /// Device that owns the allocation containing `ptr`.
    pub fn get_pointer_device(ptr: DevicePtr) -> Result<Device<B>> {
        Ok(*Self::get_pointer_context(ptr)?.device())
    }

    /// Memory space of the allocation containing `ptr`.
    pub fn get_pointer_memory_space(ptr: DevicePtr) -> Result<MemorySpace> {
        logged::<B, _>("pointer_memory_space", B::pointer_memory_space(ptr)).map_err(|status| {
            Error::Query {
                op: "pointer_memory_space",
                status,
            }
        })
    }

    /// `(base, size)` of the allocation containing `ptr`.
    pub fn get_pointer_address_range(ptr: DevicePtr) -> Result<(DevicePtr, usize)> {
        logged::<B, _>("pointer_address_range", B::pointer_address_range(ptr)).map_err(
            |status| Error::Query {
                op: "pointer_address_range",
                status,
            },
        )
    }
}

// ============================================================================
// DeviceBuffer
// ============================================================================

/// An owned, typed device allocation.
///
/// Release with [`DeviceBuffer::free`]. A buffer dropped without `free` only
/// logs the leak; the memory is reclaimed when its context is destroyed.
pub struct DeviceBuffer<B: Backend, T: Pod> {
    ptr: DevicePtr,
    len: usize,
    context: Arc<Context<B>>,
    _elem: PhantomData<T>,
}

impl<B: Backend, T: Pod> fmt::Debug for DeviceBuffer<B, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &format_args!("0x{:x}", self.ptr))
            .field("len", &self.len)
            .field("context", &self.context.id())
            .finish()
    }
}

impl<B: Backend, T: Pod> DeviceBuffer<B, T> {
    /// Allocate room for `len` elements. Contents are unspecified.
    ///
    /// A zero-length buffer owns no device memory and has a null address.
    pub fn alloc(context: &Arc<Context<B>>, len: usize) -> Result<Self> {
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| Error::invalid_argument("len", format!("{} elements overflow", len)))?;
        let ptr = if bytes == 0 {
            0
        } else {
            Driver::try_device_allocate(context, bytes)?
        };
        Ok(Self {
            ptr,
            len,
            context: Arc::clone(context),
            _elem: PhantomData,
        })
    }

    /// Allocate `len` elements with every byte zero.
    pub fn zeroed(context: &Arc<Context<B>>, len: usize) -> Result<Self> {
        let buffer = Self::alloc(context, len)?;
        if buffer.ptr != 0 {
            // SAFETY: the range is the allocation we just made.
            let filled = unsafe {
                Driver::synchronous_memset_u8(context, buffer.ptr, 0, buffer.size_in_bytes())
            };
            if let Err(e) = filled {
                let _ = buffer.free();
                return Err(e);
            }
        }
        Ok(buffer)
    }

    /// Allocate and upload `data`.
    pub fn from_slice(context: &Arc<Context<B>>, data: &[T]) -> Result<Self> {
        let mut buffer = Self::alloc(context, data.len())?;
        if let Err(e) = buffer.copy_from_host(data) {
            let _ = buffer.free();
            return Err(e);
        }
        Ok(buffer)
    }

    /// Device address, null for an empty buffer
    #[inline]
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.len * size_of::<T>()
    }

    /// Owning context
    #[inline]
    pub fn context(&self) -> &Arc<Context<B>> {
        &self.context
    }

    fn check_len(&self, other: usize) -> Result<()> {
        if other != self.len {
            return Err(Error::invalid_argument(
                "data",
                format!("length {} does not match buffer length {}", other, self.len),
            ));
        }
        Ok(())
    }

    /// Overwrite the buffer with `data` and wait for completion.
    pub fn copy_from_host(&mut self, data: &[T]) -> Result<()> {
        self.check_len(data.len())?;
        if self.len == 0 {
            return Ok(());
        }
        // SAFETY: both ranges are exactly `size_in_bytes` long.
        unsafe {
            Driver::synchronous_memcpy_h2d(
                &self.context,
                self.ptr,
                data.as_ptr() as *const c_void,
                self.size_in_bytes(),
            )
        }
    }

    /// Download the buffer into `out` and wait for completion.
    pub fn copy_to_host(&self, out: &mut [T]) -> Result<()> {
        self.check_len(out.len())?;
        if self.len == 0 {
            return Ok(());
        }
        // SAFETY: both ranges are exactly `size_in_bytes` long.
        unsafe {
            Driver::synchronous_memcpy_d2h(
                &self.context,
                out.as_mut_ptr() as *mut c_void,
                self.ptr,
                self.size_in_bytes(),
            )
        }
    }

    /// Download the buffer into a new vector.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); self.len];
        self.copy_to_host(&mut out)?;
        Ok(out)
    }

    /// Release the device memory.
    pub fn free(mut self) -> Result<()> {
        let ptr = std::mem::replace(&mut self.ptr, 0);
        if ptr == 0 {
            return Ok(());
        }
        // SAFETY: `ptr` is our own allocation and the buffer is consumed.
        unsafe { Driver::try_device_deallocate(&self.context, ptr) }
    }
}

impl<B: Backend, T: Pod> Drop for DeviceBuffer<B, T> {
    fn drop(&mut self) {
        if self.ptr != 0 {
            tracing::warn!(
                backend = B::NAME,
                context = self.context.id(),
                "device buffer of {} bytes at 0x{:x} dropped without free; leaked",
                self.size_in_bytes(),
                self.ptr
            );
        }
    }
}
