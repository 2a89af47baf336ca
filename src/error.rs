//! Unified error handling for nattenforge
//!
//! Every fallible operation in the crate returns [`NattenResult`]. Errors are
//! grouped into categories so callers can tell bad input apart from device
//! failures and from bugs:
//! - User errors (invalid shapes, strides, hyperparameters or configuration)
//! - Backend errors (compilation, device memory, command execution)
//! - Internal errors (poisoned locks, broken invariants)

use std::fmt;

pub use thiserror;

/// Unified error type for nattenforge
///
/// `Clone` because a failed compilation is memoized by the kernel cache and
/// handed to every later requester of the same program.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NattenError {
    // ========== User Errors ==========
    /// Shape, stride or hyperparameter rejected before any device work
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration value rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Backend Errors ==========
    /// Program could not be built for the device
    #[error("Compilation failed for {source_id}::{entry_point}: {reason}")]
    CompilationFailed {
        source_id: String,
        entry_point: String,
        reason: String,
    },

    /// Device allocator refused the request
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory { requested: usize, available: usize },

    /// Command stream reported an error
    #[error("Device execution failed: {0}")]
    DeviceExecutionFailed(String),

    /// Fixed-capacity resource is full
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // ========== I/O Errors ==========
    /// File I/O error (configuration loading)
    #[error("I/O error: {0}")]
    IoError(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (indicates a panic while holding a lock)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl NattenError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            NattenError::InvalidArgument(_)
            | NattenError::InvalidConfiguration(_)
            | NattenError::IoError(_) => ErrorCategory::User,

            NattenError::CompilationFailed { .. }
            | NattenError::OutOfDeviceMemory { .. }
            | NattenError::DeviceExecutionFailed(_)
            | NattenError::ResourceExhausted(_) => ErrorCategory::Backend,

            NattenError::InternalError(_) | NattenError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is a device-side failure
    pub fn is_backend_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Backend)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - User: fix the input and call again
/// - Backend: the device failed or ran out of a resource
/// - Internal: log and report as bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid input or configuration
    User,
    /// Backend error - device failure
    Backend,
    /// Internal error - indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for NattenError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        NattenError::LockPoisoned(err.to_string())
    }
}

impl From<std::io::Error> for NattenError {
    fn from(err: std::io::Error) -> Self {
        NattenError::IoError(err.to_string())
    }
}

/// Result alias used across the crate
pub type NattenResult<T> = std::result::Result<T, NattenError>;

/// Create an invalid-argument error with context
///
/// # Examples
/// ```ignore
/// return Err(invalid_argument!("kernel_size must be >= 1, got {}", k));
/// ```
#[macro_export]
macro_rules! invalid_argument {
    ($msg:expr) => {
        $crate::error::NattenError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NattenError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::NattenError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NattenError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a device execution error with context
#[macro_export]
macro_rules! execution_error {
    ($msg:expr) => {
        $crate::error::NattenError::DeviceExecutionFailed($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NattenError::DeviceExecutionFailed(format!($fmt, $($arg)*))
    };
}
