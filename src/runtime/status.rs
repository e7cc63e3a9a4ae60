//! Driver status codes
//!
//! `Status` is the raw numeric result of a driver call. The numeric values are
//! identical to the CUDA driver's `CUresult`, so the CUDA backend translates with
//! a plain cast and the host backend reports failures the same way a real device
//! would.

use std::fmt;

/// Raw driver status code.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Status(pub u32);

impl Status {
    /// Operation completed successfully
    pub const SUCCESS: Self = Self(0);
    /// One or more parameters were invalid
    pub const INVALID_VALUE: Self = Self(1);
    /// Device or host memory exhausted
    pub const OUT_OF_MEMORY: Self = Self(2);
    /// Driver has not been initialized
    pub const NOT_INITIALIZED: Self = Self(3);
    /// Driver is shutting down
    pub const DEINITIALIZED: Self = Self(4);
    /// No accelerator device detected
    pub const NO_DEVICE: Self = Self(100);
    /// Device ordinal does not name a device
    pub const INVALID_DEVICE: Self = Self(101);
    /// Kernel image is malformed
    pub const INVALID_IMAGE: Self = Self(200);
    /// No context current, or the context handle is invalid
    pub const INVALID_CONTEXT: Self = Self(201);
    /// Kernel image file could not be found
    pub const FILE_NOT_FOUND: Self = Self(301);
    /// Uncorrectable ECC error detected during execution
    pub const ECC_UNCORRECTABLE: Self = Self(214);
    /// Peer access is not supported between the devices
    pub const PEER_ACCESS_UNSUPPORTED: Self = Self(217);
    /// Kernel image contains no code for this device
    pub const NO_BINARY_FOR_GPU: Self = Self(209);
    /// Resource handle is invalid
    pub const INVALID_HANDLE: Self = Self(400);
    /// Named symbol was not found
    pub const NOT_FOUND: Self = Self(500);
    /// Asynchronous work has not completed yet
    pub const NOT_READY: Self = Self(600);
    /// Kernel accessed an invalid address
    pub const ILLEGAL_ADDRESS: Self = Self(700);
    /// Launch requested more resources than available
    pub const LAUNCH_OUT_OF_RESOURCES: Self = Self(701);
    /// Kernel exceeded the execution time limit
    pub const LAUNCH_TIMEOUT: Self = Self(702);
    /// Peer access was already enabled
    pub const PEER_ACCESS_ALREADY_ENABLED: Self = Self(704);
    /// Peer access has not been enabled
    pub const PEER_ACCESS_NOT_ENABLED: Self = Self(705);
    /// Context has been destroyed
    pub const CONTEXT_IS_DESTROYED: Self = Self(709);
    /// Device-side assertion triggered
    pub const ASSERT: Self = Self(710);
    /// Host range is already registered
    pub const HOST_MEMORY_ALREADY_REGISTERED: Self = Self(712);
    /// Host range was never registered
    pub const HOST_MEMORY_NOT_REGISTERED: Self = Self(713);
    /// Unspecified failure while executing a kernel
    pub const LAUNCH_FAILED: Self = Self(719);
    /// Operation not permitted (e.g. driver call from a stream callback)
    pub const NOT_PERMITTED: Self = Self(800);
    /// Operation not supported on this device
    pub const NOT_SUPPORTED: Self = Self(801);
    /// Unknown internal error
    pub const UNKNOWN: Self = Self(999);

    /// Numeric value of this status.
    #[inline]
    pub const fn code(self) -> u32 {
        self.0
    }

    /// Returns true for `SUCCESS`.
    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Convert into a `Result`, treating anything but `SUCCESS` as an error.
    #[inline]
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }

    /// Sticky statuses leave the context unusable: every subsequent call on it
    /// reports the same fault.
    pub const fn is_sticky(self) -> bool {
        matches!(
            self,
            Self::ILLEGAL_ADDRESS
                | Self::LAUNCH_FAILED
                | Self::LAUNCH_TIMEOUT
                | Self::ASSERT
                | Self::ECC_UNCORRECTABLE
        )
    }

    /// Symbolic name of the status, `"UNKNOWN_STATUS"` for unmapped codes.
    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "SUCCESS",
            1 => "ERROR_INVALID_VALUE",
            2 => "ERROR_OUT_OF_MEMORY",
            3 => "ERROR_NOT_INITIALIZED",
            4 => "ERROR_DEINITIALIZED",
            100 => "ERROR_NO_DEVICE",
            101 => "ERROR_INVALID_DEVICE",
            200 => "ERROR_INVALID_IMAGE",
            201 => "ERROR_INVALID_CONTEXT",
            209 => "ERROR_NO_BINARY_FOR_GPU",
            214 => "ERROR_ECC_UNCORRECTABLE",
            217 => "ERROR_PEER_ACCESS_UNSUPPORTED",
            301 => "ERROR_FILE_NOT_FOUND",
            400 => "ERROR_INVALID_HANDLE",
            500 => "ERROR_NOT_FOUND",
            600 => "ERROR_NOT_READY",
            700 => "ERROR_ILLEGAL_ADDRESS",
            701 => "ERROR_LAUNCH_OUT_OF_RESOURCES",
            702 => "ERROR_LAUNCH_TIMEOUT",
            704 => "ERROR_PEER_ACCESS_ALREADY_ENABLED",
            705 => "ERROR_PEER_ACCESS_NOT_ENABLED",
            709 => "ERROR_CONTEXT_IS_DESTROYED",
            710 => "ERROR_ASSERT",
            712 => "ERROR_HOST_MEMORY_ALREADY_REGISTERED",
            713 => "ERROR_HOST_MEMORY_NOT_REGISTERED",
            719 => "ERROR_LAUNCH_FAILED",
            800 => "ERROR_NOT_PERMITTED",
            801 => "ERROR_NOT_SUPPORTED",
            999 => "ERROR_UNKNOWN",
            _ => "UNKNOWN_STATUS",
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}
