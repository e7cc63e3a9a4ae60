//! Error types for segdrv

use crate::dtype::DType;
use crate::runtime::Status;
use thiserror::Error;

/// Result type alias using segdrv's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in driver and kernel operations
///
/// Every variant produced from a driver call names the failing operation and
/// carries the raw [`Status`] reported by the backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Driver missing, incompatible, or failed to initialize
    #[error("Driver initialization failed in {op}: {status}")]
    Initialization {
        /// Failing operation
        op: &'static str,
        /// Driver status
        status: Status,
    },

    /// Context creation, activation or destruction failed
    #[error("Context error in {op}: {status}")]
    Context {
        /// Failing operation
        op: &'static str,
        /// Driver status
        status: Status,
    },

    /// Device or page-locked host memory could not be allocated
    #[error("Allocation of {bytes} bytes failed in {op}: {status}")]
    Allocation {
        /// Failing operation
        op: &'static str,
        /// Requested size in bytes
        bytes: usize,
        /// Driver status
        status: Status,
    },

    /// Kernel launch was rejected at enqueue time
    #[error("Launch of kernel '{kernel}' failed: {status}")]
    Launch {
        /// Kernel name
        kernel: String,
        /// Driver status
        status: Status,
    },

    /// Device, context, pointer or function attribute query failed
    #[error("Query {op} failed: {status}")]
    Query {
        /// Failing operation
        op: &'static str,
        /// Driver status
        status: Status,
    },

    /// Device-side fault surfaced at a synchronization point
    #[error("Synchronization failed in {op}: {status}")]
    Synchronization {
        /// Failing operation
        op: &'static str,
        /// Driver status
        status: Status,
    },

    /// Operation is not supported by the device topology or backend
    #[error("Unsupported operation {op}: {status}")]
    UnsupportedOperation {
        /// Failing operation
        op: &'static str,
        /// Driver status
        status: Status,
    },

    /// Memory copy failed
    #[error("Transfer {op} of {bytes} bytes failed: {status}")]
    Transfer {
        /// Failing operation
        op: &'static str,
        /// Number of bytes requested
        bytes: usize,
        /// Driver status
        status: Status,
    },

    /// Kernel image could not be loaded or a function was not found in it
    #[error("Module error in {op} for '{name}': {status}")]
    Module {
        /// Failing operation
        op: &'static str,
        /// Module or function name
        name: String,
        /// Driver status
        status: Status,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Unsupported dtype for an operation
    #[error("Unsupported dtype {dtype:?} for operation '{op}'")]
    UnsupportedDType {
        /// The unsupported dtype
        dtype: DType,
        /// The operation name
        op: &'static str,
    },
}

impl Error {
    /// Raw driver status behind this error, if it came from a driver call.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Initialization { status, .. }
            | Self::Context { status, .. }
            | Self::Allocation { status, .. }
            | Self::Launch { status, .. }
            | Self::Query { status, .. }
            | Self::Synchronization { status, .. }
            | Self::UnsupportedOperation { status, .. }
            | Self::Transfer { status, .. }
            | Self::Module { status, .. } => Some(*status),
            Self::InvalidArgument { .. } | Self::UnsupportedDType { .. } => None,
        }
    }

    /// Transient failures that may succeed when retried (e.g. after freeing memory).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Allocation { status, .. } => *status == Status::OUT_OF_MEMORY,
            Self::Launch { status, .. } => *status == Status::LAUNCH_OUT_OF_RESOURCES,
            _ => false,
        }
    }

    /// Faults after which the owning context must not be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization { .. })
            || self.status().is_some_and(Status::is_sticky)
    }

    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create an unsupported dtype error
    pub fn unsupported_dtype(dtype: DType, op: &'static str) -> Self {
        Self::UnsupportedDType { dtype, op }
    }
}
