//! Host device configuration

use crate::error::{Error, Result};

/// Environment variable: number of host devices
pub const ENV_DEVICES: &str = "SEGDRV_HOST_DEVICES";
/// Environment variable: memory per host device, in MiB
pub const ENV_MEMORY_MB: &str = "SEGDRV_HOST_MEMORY_MB";
/// Environment variable: multiprocessors per host device
pub const ENV_SM_COUNT: &str = "SEGDRV_HOST_SM_COUNT";

/// Shape of the software devices exposed by `HostBackend`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// Number of devices
    pub device_count: u32,
    /// Global memory per device, in bytes
    pub memory_bytes: u64,
    /// Multiprocessors per device; bounds the resident grid size
    pub multiprocessor_count: u32,
    /// Whether distinct devices may enable peer access to each other
    pub peer_access: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            device_count: 2,
            memory_bytes: 256 << 20,
            multiprocessor_count: 4,
            peer_access: true,
        }
    }
}

impl HostConfig {
    /// Maximum threads per block
    pub const MAX_THREADS_PER_BLOCK: i32 = 1024;
    /// Maximum resident threads per multiprocessor
    pub const MAX_THREADS_PER_MULTIPROCESSOR: i32 = 2048;
    /// Shared memory per block, in bytes
    pub const MAX_SHARED_MEMORY_PER_BLOCK: i32 = 48 << 10;
    /// Shared memory per multiprocessor, in bytes
    pub const MAX_SHARED_MEMORY_PER_MULTIPROCESSOR: i32 = 64 << 10;
    /// Registers per block
    pub const MAX_REGISTERS_PER_BLOCK: i32 = 64 << 10;
    /// Warp size
    pub const WARP_SIZE: i32 = 32;
    /// Maximum grid extent in X
    pub const MAX_GRID_DIM_X: i32 = i32::MAX;
    /// Maximum grid extent in Y and Z
    pub const MAX_GRID_DIM_YZ: i32 = 65535;
    /// Reported compute capability
    pub const COMPUTE_CAPABILITY: (i32, i32) = (7, 5);

    /// Default configuration overridden by `SEGDRV_HOST_*` environment variables.
    ///
    /// Unset variables keep their defaults. A variable that is set but does not
    /// parse is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`HostConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(devices) = parse::<u32>(&lookup, ENV_DEVICES)? {
            config.device_count = devices;
        }
        if let Some(mb) = parse::<u64>(&lookup, ENV_MEMORY_MB)? {
            config.memory_bytes = mb << 20;
        }
        if let Some(sms) = parse::<u32>(&lookup, ENV_SM_COUNT)? {
            if sms == 0 {
                return Err(Error::invalid_argument(ENV_SM_COUNT, "must be at least 1"));
            }
            config.multiprocessor_count = sms;
        }
        Ok(config)
    }

    /// Set the device count
    pub fn devices(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    /// Set the memory per device
    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    /// Set the multiprocessor count
    pub fn multiprocessors(mut self, count: u32) -> Self {
        self.multiprocessor_count = count.max(1);
        self
    }

    /// Allow or forbid peer access between devices
    pub fn peer_access(mut self, enabled: bool) -> Self {
        self.peer_access = enabled;
        self
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::invalid_argument(key, format!("cannot parse {:?}", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = HostConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = HostConfig::from_lookup(lookup(&[
            (ENV_DEVICES, "3"),
            (ENV_MEMORY_MB, " 64 "),
            (ENV_SM_COUNT, "2"),
        ]))
        .unwrap();
        assert_eq!(config.device_count, 3);
        assert_eq!(config.memory_bytes, 64 << 20);
        assert_eq!(config.multiprocessor_count, 2);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = HostConfig::from_lookup(lookup(&[(ENV_MEMORY_MB, "lots")])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { arg: ENV_MEMORY_MB, .. }));
        assert!(HostConfig::from_lookup(lookup(&[(ENV_SM_COUNT, "0")])).is_err());
    }
}
