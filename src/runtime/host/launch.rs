//! Kernel ABI of the host device
//!
//! A host kernel is a plain Rust function that receives the launch shape and
//! the packed parameter bytes, exactly what the device driver receives. The
//! kernel decodes its parameters, maps the buffers it needs through
//! [`HostLaunch::global`] (which validates them against the allocation
//! registry) and runs its body once per logical thread on the rayon pool.

use super::memory::MemoryRegistry;
use crate::runtime::{DevicePtr, Dim3, DriverResult, MemorySpace, RawContext, Status};
use bytemuck::Pod;
use rayon::prelude::*;
use std::fmt;
use std::marker::PhantomData;

/// Entry point of a host kernel
pub type HostEntry = fn(&HostLaunch) -> DriverResult<()>;

/// A kernel the host backend can execute.
#[derive(Clone, Copy)]
pub struct HostKernel {
    /// Kernel name, identical to the device symbol
    pub name: &'static str,
    /// Size in bytes of each parameter, in order
    pub params: &'static [usize],
    /// Kernel body
    pub entry: HostEntry,
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Coordinates of one logical thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThreadIdx {
    /// Block index within the grid
    pub block_idx: Dim3,
    /// Thread index within the block
    pub thread_idx: Dim3,
    /// Block extent
    pub block_dim: Dim3,
    /// Grid extent
    pub grid_dim: Dim3,
}

impl ThreadIdx {
    /// Global X index of this thread
    #[inline]
    pub fn global_x(&self) -> u64 {
        u64::from(self.block_idx.x) * u64::from(self.block_dim.x) + u64::from(self.thread_idx.x)
    }

    /// Total threads along X
    #[inline]
    pub fn stride_x(&self) -> u64 {
        u64::from(self.block_dim.x) * u64::from(self.grid_dim.x)
    }

    /// Indices `[0, n)` owned by this thread in a grid-stride loop
    #[inline]
    pub fn grid_stride(&self, n: u64) -> impl Iterator<Item = u64> {
        let stride = self.stride_x().max(1) as usize;
        (self.global_x()..n).step_by(stride)
    }
}

/// A launch as seen by a host kernel.
pub struct HostLaunch {
    grid: Dim3,
    block: Dim3,
    params: Vec<Vec<u8>>,
    context: RawContext,
    peers: Vec<RawContext>,
    memory: &'static MemoryRegistry,
}

impl HostLaunch {
    pub(crate) fn new(
        grid: Dim3,
        block: Dim3,
        params: Vec<Vec<u8>>,
        context: RawContext,
        peers: Vec<RawContext>,
        memory: &'static MemoryRegistry,
    ) -> Self {
        Self {
            grid,
            block,
            params,
            context,
            peers,
            memory,
        }
    }

    /// Grid extent
    pub fn grid(&self) -> Dim3 {
        self.grid
    }

    /// Block extent
    pub fn block(&self) -> Dim3 {
        self.block
    }

    /// Decode parameter `index` as `T`.
    pub fn param<T: Pod>(&self, index: usize) -> DriverResult<T> {
        let bytes = self.params.get(index).ok_or(Status::INVALID_VALUE)?;
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(Status::INVALID_VALUE);
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Map `len` elements of `T` at device address `addr`.
    ///
    /// The whole range must lie inside one live allocation that this launch's
    /// context may access; otherwise the kernel faults with `ILLEGAL_ADDRESS`.
    pub fn global<T: Pod>(&self, addr: DevicePtr, len: usize) -> DriverResult<GlobalPtr<T>> {
        if len == 0 {
            return Ok(GlobalPtr::new(std::ptr::null_mut(), 0));
        }
        if addr % std::mem::align_of::<T>() as u64 != 0 {
            return Err(Status::ILLEGAL_ADDRESS);
        }
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(Status::ILLEGAL_ADDRESS)?;
        let region = self
            .memory
            .lookup_range(addr, bytes)
            .ok_or(Status::ILLEGAL_ADDRESS)?;
        let accessible = region.space == MemorySpace::Host
            || region.context == self.context
            || self.peers.contains(&region.context);
        if !accessible {
            return Err(Status::ILLEGAL_ADDRESS);
        }
        Ok(GlobalPtr::new(addr as *mut T, len))
    }

    /// Run `body` once for every thread of the grid.
    ///
    /// The first error stops the grid and becomes the kernel's result.
    pub fn for_each_thread<F>(&self, body: F) -> DriverResult<()>
    where
        F: Fn(ThreadIdx) -> DriverResult<()> + Sync + Send,
    {
        let block_volume = self.block.volume();
        let total = self.grid.volume() * block_volume;
        (0..total).into_par_iter().try_for_each(|linear| {
            let block = linear / block_volume;
            let thread = linear % block_volume;
            body(ThreadIdx {
                block_idx: unflatten(block, self.grid),
                thread_idx: unflatten(thread, self.block),
                block_dim: self.block,
                grid_dim: self.grid,
            })
        })
    }
}

fn unflatten(linear: u64, extent: Dim3) -> Dim3 {
    let x = u64::from(extent.x);
    let xy = x * u64::from(extent.y);
    Dim3::new(
        (linear % x) as u32,
        ((linear % xy) / x) as u32,
        (linear / xy) as u32,
    )
}

/// Pointer into validated device memory.
///
/// Element accessors are bounds checked and report `ILLEGAL_ADDRESS` instead
/// of touching memory outside the mapped range.
pub struct GlobalPtr<T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for GlobalPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GlobalPtr<T> {}

// SAFETY: the pointee is device memory shared by every thread of the grid;
// concurrent access discipline is the kernel's responsibility, as on a device.
unsafe impl<T: Send> Send for GlobalPtr<T> {}
unsafe impl<T: Sync> Sync for GlobalPtr<T> {}

impl<T: Pod> GlobalPtr<T> {
    fn new(ptr: *mut T, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// Number of mapped elements
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of element `index`
    #[inline]
    pub fn element(&self, index: u64) -> DriverResult<*mut T> {
        if index >= self.len as u64 {
            return Err(Status::ILLEGAL_ADDRESS);
        }
        // SAFETY: index is within the mapped allocation.
        Ok(unsafe { self.ptr.add(index as usize) })
    }

    /// Read element `index`.
    ///
    /// # Safety
    ///
    /// No other thread may write the element concurrently.
    #[inline]
    pub unsafe fn load(&self, index: u64) -> DriverResult<T> {
        let p = self.element(index)?;
        Ok(unsafe { p.read() })
    }

    /// Write element `index`.
    ///
    /// # Safety
    ///
    /// No other thread may access the element concurrently.
    #[inline]
    pub unsafe fn store(&self, index: u64, value: T) -> DriverResult<()> {
        let p = self.element(index)?;
        unsafe { p.write(value) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_stride_covers_each_index_once() {
        let grid = Dim3::new(3, 1, 1);
        let block = Dim3::new(4, 1, 1);
        let mut seen = vec![0u32; 50];
        for b in 0..3 {
            for t in 0..4 {
                let idx = ThreadIdx {
                    block_idx: Dim3::new(b, 0, 0),
                    thread_idx: Dim3::new(t, 0, 0),
                    block_dim: block,
                    grid_dim: grid,
                };
                for i in idx.grid_stride(50) {
                    seen[i as usize] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn test_unflatten() {
        let extent = Dim3::new(4, 3, 2);
        assert_eq!(unflatten(0, extent), Dim3::new(0, 0, 0));
        assert_eq!(unflatten(5, extent), Dim3::new(1, 1, 0));
        assert_eq!(unflatten(23, extent), Dim3::new(3, 2, 1));
    }

    #[test]
    fn test_global_ptr_bounds() {
        let mut data = [1.0f32, 2.0, 3.0];
        let ptr = GlobalPtr::new(data.as_mut_ptr(), data.len());
        unsafe {
            assert_eq!(ptr.load(2), Ok(3.0));
            ptr.store(0, 9.0).unwrap();
            assert_eq!(ptr.load(3), Err(Status::ILLEGAL_ADDRESS));
        }
        assert_eq!(data[0], 9.0);
    }
}
