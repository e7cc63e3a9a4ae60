//! Allocation registry of the host device
//!
//! Device addresses handed out by the host backend are real addresses in this
//! process. The registry remembers every live allocation and registered host
//! range so that copies, fills and kernels can validate the ranges they touch
//! and pointer queries can answer "who owns this".

use crate::runtime::{DevicePtr, DriverResult, MemorySpace, RawContext, RawDevice, Status};
use parking_lot::RwLock;
use std::alloc::{self, Layout};
use std::collections::{BTreeMap, HashMap};

/// Alignment of every host-device allocation, matching the device allocator.
pub(crate) const ALLOCATION_ALIGN: usize = 256;

/// Who frees the bytes behind an entry.
#[derive(Debug)]
enum Backing {
    /// Allocated by the registry with this layout
    Owned(Layout),
    /// Caller memory registered with `mem_host_register`
    Registered,
}

#[derive(Debug)]
struct Region {
    len: usize,
    context: RawContext,
    device: RawDevice,
    space: MemorySpace,
    backing: Backing,
}

/// A validated view of one registry entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct RegionInfo {
    pub base: DevicePtr,
    pub len: usize,
    pub context: RawContext,
    pub space: MemorySpace,
}

/// Live allocations keyed by base address
#[derive(Debug, Default)]
pub(crate) struct MemoryRegistry {
    regions: RwLock<BTreeMap<DevicePtr, Region>>,
    used: RwLock<HashMap<RawDevice, u64>>,
}

impl MemoryRegistry {
    /// Allocate `bytes` of zeroed memory owned by `context`.
    pub fn allocate(
        &self,
        bytes: usize,
        context: RawContext,
        device: RawDevice,
        space: MemorySpace,
        capacity: u64,
    ) -> DriverResult<DevicePtr> {
        if bytes == 0 {
            return Err(Status::INVALID_VALUE);
        }
        let layout =
            Layout::from_size_align(bytes, ALLOCATION_ALIGN).map_err(|_| Status::OUT_OF_MEMORY)?;

        if space == MemorySpace::Device {
            let mut used = self.used.write();
            let entry = used.entry(device).or_insert(0);
            if *entry + bytes as u64 > capacity {
                return Err(Status::OUT_OF_MEMORY);
            }
            *entry += bytes as u64;
        }

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            self.release_quota(device, space, bytes);
            return Err(Status::OUT_OF_MEMORY);
        }

        let base = ptr as DevicePtr;
        self.regions.write().insert(
            base,
            Region {
                len: bytes,
                context,
                device,
                space,
                backing: Backing::Owned(layout),
            },
        );
        Ok(base)
    }

    /// Free an allocation made by [`MemoryRegistry::allocate`] in `space`.
    ///
    /// # Safety
    ///
    /// No pending operation may still access the allocation.
    pub unsafe fn free(&self, base: DevicePtr, space: MemorySpace) -> DriverResult<()> {
        let region = {
            let mut regions = self.regions.write();
            match regions.get(&base) {
                Some(r) if r.space == space && matches!(r.backing, Backing::Owned(_)) => {}
                _ => return Err(Status::INVALID_VALUE),
            }
            regions.remove(&base).ok_or(Status::INVALID_VALUE)?
        };
        if let Backing::Owned(layout) = region.backing {
            // SAFETY: `base` was returned by `alloc_zeroed` with this layout and
            // has just been removed from the registry, so it is freed once.
            unsafe { alloc::dealloc(base as *mut u8, layout) };
        }
        self.release_quota(region.device, region.space, region.len);
        Ok(())
    }

    /// Record a caller-owned host range.
    pub fn register(
        &self,
        base: DevicePtr,
        bytes: usize,
        context: RawContext,
        device: RawDevice,
    ) -> DriverResult<()> {
        if base == 0 || bytes == 0 {
            return Err(Status::INVALID_VALUE);
        }
        let mut regions = self.regions.write();
        let end = base.checked_add(bytes as u64).ok_or(Status::INVALID_VALUE)?;
        let overlaps = regions
            .range(..end)
            .next_back()
            .is_some_and(|(&start, r)| start + r.len as u64 > base);
        if overlaps {
            return Err(Status::HOST_MEMORY_ALREADY_REGISTERED);
        }
        regions.insert(
            base,
            Region {
                len: bytes,
                context,
                device,
                space: MemorySpace::Host,
                backing: Backing::Registered,
            },
        );
        Ok(())
    }

    /// Forget a range recorded by [`MemoryRegistry::register`].
    pub fn unregister(&self, base: DevicePtr) -> DriverResult<()> {
        let mut regions = self.regions.write();
        match regions.get(&base) {
            Some(r) if matches!(r.backing, Backing::Registered) => {
                regions.remove(&base);
                Ok(())
            }
            _ => Err(Status::HOST_MEMORY_NOT_REGISTERED),
        }
    }

    /// Entry containing `ptr`.
    pub fn lookup(&self, ptr: DevicePtr) -> Option<RegionInfo> {
        let regions = self.regions.read();
        let (&base, region) = regions.range(..=ptr).next_back()?;
        (ptr < base + region.len as u64).then_some(RegionInfo {
            base,
            len: region.len,
            context: region.context,
            space: region.space,
        })
    }

    /// Entry that wholly contains `[ptr, ptr + bytes)`.
    pub fn lookup_range(&self, ptr: DevicePtr, bytes: usize) -> Option<RegionInfo> {
        let info = self.lookup(ptr)?;
        let end = ptr.checked_add(bytes as u64)?;
        (end <= info.base + info.len as u64).then_some(info)
    }

    /// Bytes in use on `device`
    pub fn used(&self, device: RawDevice) -> u64 {
        self.used.read().get(&device).copied().unwrap_or(0)
    }

    /// Drop every owned allocation belonging to `context`.
    ///
    /// # Safety
    ///
    /// The context's streams must be idle.
    pub unsafe fn release_context(&self, context: RawContext) {
        let owned: Vec<(DevicePtr, MemorySpace)> = self
            .regions
            .read()
            .iter()
            .filter(|(_, r)| r.context == context)
            .map(|(&base, r)| (base, r.space))
            .collect();
        for (base, space) in owned {
            // SAFETY: forwarded from the caller.
            if unsafe { self.free(base, space) }.is_err() {
                let _ = self.unregister(base);
            }
        }
    }

    fn release_quota(&self, device: RawDevice, space: MemorySpace, bytes: usize) {
        if space == MemorySpace::Device {
            if let Some(used) = self.used.write().get_mut(&device) {
                *used = used.saturating_sub(bytes as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: RawContext = RawContext(0x100);
    const DEV: RawDevice = RawDevice(0);

    #[test]
    fn test_allocate_lookup_free() {
        let registry = MemoryRegistry::default();
        let ptr = registry
            .allocate(100, CTX, DEV, MemorySpace::Device, 1 << 20)
            .unwrap();
        assert_eq!(ptr as usize % ALLOCATION_ALIGN, 0);

        let info = registry.lookup(ptr + 99).unwrap();
        assert_eq!(info.base, ptr);
        assert_eq!(info.len, 100);
        assert_eq!(info.context, CTX);
        assert!(registry.lookup(ptr + 100).is_none());
        assert!(registry.lookup_range(ptr + 50, 51).is_none());
        assert_eq!(registry.used(DEV), 100);

        unsafe { registry.free(ptr, MemorySpace::Device).unwrap() };
        assert!(registry.lookup(ptr).is_none());
        assert_eq!(registry.used(DEV), 0);
        assert_eq!(
            unsafe { registry.free(ptr, MemorySpace::Device) },
            Err(Status::INVALID_VALUE)
        );
    }

    #[test]
    fn test_capacity_exhaustion() {
        let registry = MemoryRegistry::default();
        let a = registry
            .allocate(600, CTX, DEV, MemorySpace::Device, 1000)
            .unwrap();
        assert_eq!(
            registry.allocate(600, CTX, DEV, MemorySpace::Device, 1000),
            Err(Status::OUT_OF_MEMORY)
        );
        unsafe { registry.free(a, MemorySpace::Device).unwrap() };
        assert!(registry
            .allocate(600, CTX, DEV, MemorySpace::Device, 1000)
            .is_ok());
    }

    #[test]
    fn test_register_overlap() {
        let registry = MemoryRegistry::default();
        let buf = vec![0u8; 64];
        let base = buf.as_ptr() as DevicePtr;
        registry.register(base, 64, CTX, DEV).unwrap();
        assert_eq!(
            registry.register(base + 32, 8, CTX, DEV),
            Err(Status::HOST_MEMORY_ALREADY_REGISTERED)
        );
        assert_eq!(registry.lookup(base + 10).unwrap().space, MemorySpace::Host);
        registry.unregister(base).unwrap();
        assert_eq!(
            registry.unregister(base),
            Err(Status::HOST_MEMORY_NOT_REGISTERED)
        );
    }
}
