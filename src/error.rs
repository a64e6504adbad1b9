//! Unified error handling for replicaforge
//!
//! Every public operation returns [`ForgeResult`]. Errors raised by the
//! external collaborators (driver, compiler, codec) keep their own typed
//! enums and are wrapped here together with the operation that failed.
//! [`ForgeError::code`] collapses everything into the status codes callers
//! branch on.

use std::sync::PoisonError;

use crate::codec::CodecError;
use crate::platform::DriverError;
use crate::program::CompileError;

/// Coarse status code of a [`ForgeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The named platform does not exist
    NotFound,
    /// The system is not in a state where the operation can run
    FailedPrecondition,
    /// The caller supplied something malformed or mismatched
    InvalidArgument,
    /// Driver, runtime or invariant failure
    Internal,
}

/// Unified error type for replicaforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Host value could not be encoded or decoded
    #[error("Invalid host value: {0}")]
    Codec(#[from] CodecError),

    /// Device platform failure, tagged with the operation that hit it
    #[error("Driver error while {context}: {source}")]
    Driver {
        context: String,
        #[source]
        source: DriverError,
    },

    /// Program compiler failure, tagged with the program being compiled
    #[error("Compilation failed for {context}: {source}")]
    Compile {
        context: String,
        #[source]
        source: CompileError,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ForgeError {
    pub fn driver(context: impl Into<String>, source: DriverError) -> Self {
        ForgeError::Driver {
            context: context.into(),
            source,
        }
    }

    pub fn compile(context: impl Into<String>, source: CompileError) -> Self {
        ForgeError::Compile {
            context: context.into(),
            source,
        }
    }

    /// Status code for handling decisions
    pub fn code(&self) -> ErrorCode {
        match self {
            ForgeError::NotFound(_) => ErrorCode::NotFound,
            ForgeError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            ForgeError::InvalidArgument(_) | ForgeError::Codec(_) => ErrorCode::InvalidArgument,
            ForgeError::Driver { source, .. } => match source {
                DriverError::InvalidDevice { .. } | DriverError::ShapeMismatch { .. } => {
                    ErrorCode::InvalidArgument
                }
                _ => ErrorCode::Internal,
            },
            ForgeError::Compile { source, .. } => match source {
                CompileError::InvalidProgram(_) | CompileError::InvalidOptions(_) => {
                    ErrorCode::InvalidArgument
                }
                _ => ErrorCode::Internal,
            },
            ForgeError::Internal(_) | ForgeError::LockPoisoned(_) => ErrorCode::Internal,
        }
    }
}

impl<T> From<PoisonError<T>> for ForgeError {
    fn from(err: PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Build a [`ForgeError::InvalidArgument`] from a format string
#[macro_export]
macro_rules! invalid_argument {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

/// Build a [`ForgeError::FailedPrecondition`] from a format string
#[macro_export]
macro_rules! failed_precondition {
    ($msg:expr) => {
        $crate::error::ForgeError::FailedPrecondition($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::FailedPrecondition(format!($fmt, $($arg)*))
    };
}

/// Build a [`ForgeError::Internal`] from a format string
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ForgeError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::Internal(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{ElementType, Shape};

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ForgeError::NotFound("tpu".to_string()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            ForgeError::FailedPrecondition("no devices".to_string()).code(),
            ErrorCode::FailedPrecondition
        );
        assert_eq!(
            ForgeError::from(CodecError::Unsupported("x".to_string())).code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            ForgeError::LockPoisoned("x".to_string()).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_driver_error_codes() {
        let err = ForgeError::driver(
            "allocating buffer",
            DriverError::MemoryAllocationFailed("out of memory".to_string()),
        );
        assert_eq!(err.code(), ErrorCode::Internal);

        let err = ForgeError::driver(
            "reading outfeed",
            DriverError::ShapeMismatch {
                expected: Shape::scalar(ElementType::F32),
                actual: Shape::scalar(ElementType::S32),
            },
        );
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_driver_error_display_names_operation() {
        let err = ForgeError::driver(
            "copying to device 3",
            DriverError::MemoryCopyFailed("bus error".to_string()),
        );
        let message = err.to_string();
        assert!(message.contains("copying to device 3"));
        assert!(message.contains("bus error"));
    }

    #[test]
    fn test_compile_error_codes() {
        let err = ForgeError::compile("add_one", CompileError::InvalidProgram("bad".to_string()));
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        let err = ForgeError::compile("add_one", CompileError::Unimplemented("op".to_string()));
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_macros() {
        let err = invalid_argument!("replica count {} != {}", 2, 3);
        assert!(matches!(err, ForgeError::InvalidArgument(_)));
        assert_eq!(err.to_string(), "Invalid argument: replica count 2 != 3");

        let err = failed_precondition!("deleted");
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);

        let err = internal_error!("worker gone");
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::{Arc, Mutex};

        let lock = Arc::new(Mutex::new(0));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err: ForgeError = lock.lock().unwrap_err().into();
        assert!(matches!(err, ForgeError::LockPoisoned(_)));
    }
}
