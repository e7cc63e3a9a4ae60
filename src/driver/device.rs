//! Device handles and attribute queries

use super::{Driver, logged};
use crate::error::{Error, Result};
use crate::runtime::{Backend, DeviceAttribute, RawDevice};
use std::fmt;
use std::marker::PhantomData;

/// A physical accelerator, resolved from an ordinal.
///
/// Devices have no explicit release; the handle stays valid for the life of
/// the process.
pub struct Device<B: Backend> {
    raw: RawDevice,
    ordinal: i32,
    _backend: PhantomData<B>,
}

impl<B: Backend> Clone for Device<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for Device<B> {}

impl<B: Backend> PartialEq for Device<B> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<B: Backend> Eq for Device<B> {}

impl<B: Backend> fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("backend", &B::NAME)
            .field("ordinal", &self.ordinal)
            .finish()
    }
}

/// Snapshot of the device limits used for launch configuration and reporting.
///
/// Either every field is populated or [`Device::properties`] fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Name reported by the driver
    pub name: String,
    /// Compute capability `(major, minor)`
    pub compute_capability: (i32, i32),
    /// Number of multiprocessors
    pub multiprocessor_count: i32,
    /// Maximum threads per block
    pub max_threads_per_block: i32,
    /// Maximum resident threads per multiprocessor
    pub max_threads_per_multiprocessor: i32,
    /// Shared memory per block, in bytes
    pub shared_memory_per_block: i32,
    /// Shared memory per multiprocessor, in bytes
    pub shared_memory_per_multiprocessor: i32,
    /// 32-bit registers per block
    pub registers_per_block: i32,
    /// Threads per warp
    pub warp_size: i32,
    /// Maximum grid extent `(x, y, z)`
    pub max_grid_dims: (i32, i32, i32),
    /// Total global memory in bytes
    pub total_memory: u64,
    /// Whether ECC is enabled
    pub ecc_enabled: bool,
    /// PCI bus id
    pub pci_bus_id: String,
}

impl<B: Backend> Device<B> {
    /// Resolve the device with the given ordinal.
    pub fn get(ordinal: i32) -> Result<Self> {
        let raw = logged::<B, _>("device_get", B::device_get(ordinal))
            .map_err(|status| Error::Query { op: "device_get", status })?;
        Ok(Self {
            raw,
            ordinal,
            _backend: PhantomData,
        })
    }

    pub(crate) fn from_raw(raw: RawDevice) -> Self {
        Self {
            raw,
            ordinal: raw.0,
            _backend: PhantomData,
        }
    }

    /// Raw driver handle
    #[inline]
    pub fn raw(&self) -> RawDevice {
        self.raw
    }

    /// Ordinal this device was resolved from
    #[inline]
    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    /// Name reported by the driver
    pub fn name(&self) -> Result<String> {
        logged::<B, _>("device_name", B::device_name(self.raw))
            .map_err(|status| Error::Query { op: "device_name", status })
    }

    /// Integer attribute of this device.
    pub fn attribute(&self, attr: DeviceAttribute) -> Result<i32> {
        logged::<B, _>("device_attribute", B::device_attribute(self.raw, attr)).map_err(
            |status| Error::Query {
                op: "device_attribute",
                status,
            },
        )
    }

    /// Compute capability `(major, minor)`, e.g. `(7, 5)` for Turing.
    pub fn compute_capability(&self) -> Result<(i32, i32)> {
        Ok((
            self.attribute(DeviceAttribute::ComputeCapabilityMajor)?,
            self.attribute(DeviceAttribute::ComputeCapabilityMinor)?,
        ))
    }

    /// Number of multiprocessors
    pub fn multiprocessor_count(&self) -> Result<i32> {
        self.attribute(DeviceAttribute::MultiprocessorCount)
    }

    /// Total global memory in bytes
    pub fn total_memory(&self) -> Result<u64> {
        logged::<B, _>("device_total_memory", B::device_total_memory(self.raw)).map_err(
            |status| Error::Query {
                op: "device_total_memory",
                status,
            },
        )
    }

    /// PCI bus id of this device
    pub fn pci_bus_id(&self) -> Result<String> {
        logged::<B, _>("device_pci_bus_id", B::device_pci_bus_id(self.raw)).map_err(|status| {
            Error::Query {
                op: "device_pci_bus_id",
                status,
            }
        })
    }

    /// Whether ECC is enabled
    pub fn ecc_enabled(&self) -> Result<bool> {
        Ok(self.attribute(DeviceAttribute::EccEnabled)? != 0)
    }

    /// Whether this device can address memory owned by `peer`.
    pub fn can_access_peer(&self, peer: &Device<B>) -> Result<bool> {
        logged::<B, _>(
            "device_can_access_peer",
            B::device_can_access_peer(self.raw, peer.raw),
        )
        .map_err(|status| Error::Query {
            op: "device_can_access_peer",
            status,
        })
    }

    /// Query every property at once.
    pub fn properties(&self) -> Result<DeviceProperties> {
        Ok(DeviceProperties {
            name: self.name()?,
            compute_capability: self.compute_capability()?,
            multiprocessor_count: self.multiprocessor_count()?,
            max_threads_per_block: self.attribute(DeviceAttribute::MaxThreadsPerBlock)?,
            max_threads_per_multiprocessor: self
                .attribute(DeviceAttribute::MaxThreadsPerMultiprocessor)?,
            shared_memory_per_block: self.attribute(DeviceAttribute::MaxSharedMemoryPerBlock)?,
            shared_memory_per_multiprocessor: self
                .attribute(DeviceAttribute::MaxSharedMemoryPerMultiprocessor)?,
            registers_per_block: self.attribute(DeviceAttribute::MaxRegistersPerBlock)?,
            warp_size: self.attribute(DeviceAttribute::WarpSize)?,
            max_grid_dims: (
                self.attribute(DeviceAttribute::MaxGridDimX)?,
                self.attribute(DeviceAttribute::MaxGridDimY)?,
                self.attribute(DeviceAttribute::MaxGridDimZ)?,
            ),
            total_memory: self.total_memory()?,
            ecc_enabled: self.ecc_enabled()?,
            pci_bus_id: self.pci_bus_id()?,
        })
    }
}

impl<B: Backend> Driver<B> {
    /// Number of visible devices
    pub fn device_count() -> Result<i32> {
        logged::<B, _>("device_count", B::device_count())
            .map_err(|status| Error::Query { op: "device_count", status })
    }

    /// Resolve a device by ordinal.
    pub fn get_device(ordinal: i32) -> Result<Device<B>> {
        Device::get(ordinal)
    }

    /// Every visible device, in ordinal order.
    pub fn devices() -> Result<Vec<Device<B>>> {
        (0..Self::device_count()?).map(Device::get).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Status;
    use crate::runtime::host::HostBackend;

    #[test]
    fn test_device_properties_snapshot() {
        Driver::<HostBackend>::init().unwrap();
        let device = Device::<HostBackend>::get(0).unwrap();
        let props = device.properties().unwrap();
        assert_eq!(props.warp_size, 32);
        assert_eq!(props.compute_capability, (7, 5));
        assert!(props.multiprocessor_count > 0);
        assert!(props.total_memory > 0);
        assert!(!props.pci_bus_id.is_empty());
    }

    #[test]
    fn test_invalid_ordinal_is_a_query_error() {
        Driver::<HostBackend>::init().unwrap();
        let err = Device::<HostBackend>::get(4096).unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_DEVICE));
        assert!(matches!(err, Error::Query { op: "device_get", .. }));
    }
}
