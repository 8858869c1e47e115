//! Error types shared by the handle arena and the task runner

use crate::Handle;

/// Result type for skein operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure category of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Null or malformed input
    InvalidArgument,
    /// Operation invalid for the current lifecycle phase
    State,
    /// Stale or unknown handle
    NotFound,
    /// Capacity exhausted or live resources block the operation
    Busy,
    /// Arithmetic overflow in a size, count, or time computation
    Overflow,
    /// Value outside the representable range
    Range,
    /// Allocator refused the request
    OutOfMemory,
    /// Operation not supported by the target object
    Unsupported,
    /// Work exists but is not due yet
    NotReady,
    /// Native primitive failure
    Platform,
    /// A user callback panicked
    Panicked,
    /// A task body reported failure
    Task,
}

/// Errors reported by skein operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Null or malformed input, rejected before any mutation
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation invalid given the current lifecycle phase
    #[error("Invalid state: {0}")]
    State(&'static str),

    /// Handle is stale, out of range, or was never issued
    #[error("Handle {0} not found")]
    NotFound(Handle),

    /// Capacity exhausted or live objects block teardown
    #[error("Busy: {0}")]
    Busy(&'static str),

    /// Checked arithmetic failed
    #[error("Overflow: {0}")]
    Overflow(&'static str),

    /// Capacity larger than the handle id field can address
    #[error("Capacity {0} exceeds the addressable handle range")]
    OutOfRange(usize),

    /// Allocator refused a reservation
    #[error("Out of memory (requested {requested} bytes)")]
    OutOfMemory {
        /// Size of the failed request in bytes
        requested: usize,
    },

    /// Operation is not supported by the resolved object
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Earliest queued task becomes due in `wait_ms` milliseconds
    #[error("Not ready for {wait_ms}ms")]
    NotReady {
        /// Milliseconds until the earliest task is due
        wait_ms: u64,
    },

    /// Native thread or OS primitive failure
    #[error("Platform error: {0}")]
    Platform(String),

    /// Panic caught at a task, thread, or worker boundary
    #[error("Panicked: {0}")]
    Panicked(String),

    /// Failure reported by a task body
    #[error("Task failed: {0}")]
    Task(String),
}

impl Error {
    /// Get the failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::State(_) => ErrorKind::State,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Overflow(_) => ErrorKind::Overflow,
            Error::OutOfRange(_) => ErrorKind::Range,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::NotReady { .. } => ErrorKind::NotReady,
            Error::Platform(_) => ErrorKind::Platform,
            Error::Panicked(_) => ErrorKind::Panicked,
            Error::Task(_) => ErrorKind::Task,
        }
    }

    /// Build an error from a caught panic payload
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked(message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Platform(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::Busy("queue full").kind(), ErrorKind::Busy);
        assert_eq!(Error::NotFound(Handle::NULL).kind(), ErrorKind::NotFound);
        assert_eq!(Error::OutOfRange(7).kind(), ErrorKind::Range);
        assert_eq!(Error::NotReady { wait_ms: 3 }.kind(), ErrorKind::NotReady);
    }

    #[test]
    fn test_error_display() {
        let err = Error::NotFound(Handle::new(3, 2));
        assert_eq!(err.to_string(), "Handle #3@2 not found");

        let err = Error::OutOfMemory { requested: 64 };
        assert_eq!(err.to_string(), "Out of memory (requested 64 bytes)");
    }

    #[test]
    fn test_error_from_panic_payload() {
        let err = Error::from_panic(Box::new("boom"));
        assert_eq!(err, Error::Panicked("boom".to_string()));

        let err = Error::from_panic(Box::new(String::from("bang")));
        assert_eq!(err, Error::Panicked("bang".to_string()));

        let err = Error::from_panic(Box::new(42u32));
        assert_eq!(err.kind(), ErrorKind::Panicked);
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "spawn failed");
        assert_eq!(Error::from(io), Error::Platform("spawn failed".to_string()));
    }
}
