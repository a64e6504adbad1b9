//! Device driver error types

use thiserror::Error;

use crate::shape::Shape;

/// Errors reported by a [`DevicePlatform`](super::DevicePlatform)
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("Device {ordinal} does not exist ({device_count} devices present)")]
    InvalidDevice { ordinal: usize, device_count: usize },
    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),
    #[error("Memory copy failed: {0}")]
    MemoryCopyFailed(String),
    #[error("Address {address:#x} is not a live allocation on device {ordinal}")]
    InvalidAddress { ordinal: usize, address: u64 },
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Infeed rejected: {0}")]
    InfeedRejected(String),
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: Shape, actual: Shape },
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DriverError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DriverError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Driver result type
pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Whether retrying the same call may succeed.
    ///
    /// Allocation failures can clear once other buffers are released;
    /// everything else is deterministic for a given input.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DriverError::MemoryAllocationFailed(_))
    }
}
