//! IPC error types
//!
//! Every fallible operation of the core returns [`IpcError`]. The variants map
//! onto a small taxonomy ([`ErrorClass`]) that callers can branch on without
//! matching every variant.

use relay_platform::{PlatformError, TaskId};
use thiserror::Error;

/// Errors returned by the IPC core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Authority already registered")]
    AlreadyExists,

    #[error("Already bound")]
    AlreadyBound,

    #[error("IPC pool is not mapped")]
    PoolNotBound,

    #[error("Out of pool memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Out of service handles")]
    OutOfHandles,

    #[error("Size {requested} exceeds limit {limit}")]
    SizeExceeded { requested: usize, limit: usize },

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Invalid handle {0}")]
    InvalidHandle(u32),

    #[error("Not found")]
    NotFound,

    #[error("Address {addr:#x} outside the IPC pool")]
    OutOfRange { addr: usize },

    #[error("Target {0} is gone")]
    TargetGone(TaskId),

    #[error("Protocol error: {0}")]
    ProtocolError(&'static str),

    #[error("Timed out")]
    TimedOut,

    #[error("Cancelled")]
    Cancelled,

    #[error("Peer rejected the request")]
    PeerRejected,

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Coarse error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Caller passed something malformed or the subsystem is not set up
    Configuration,
    /// A bounded resource ran out
    Exhaustion,
    /// Caller lacks the right to do this
    Access,
    /// Message sequencing was violated
    Protocol,
    /// A deadline passed or a wait was interrupted
    Timing,
    /// The other side is gone or refused
    PeerFailure,
    /// A kernel collaborator failed
    Platform,
}

impl IpcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IpcError::InvalidArgument(_)
            | IpcError::AlreadyExists
            | IpcError::AlreadyBound
            | IpcError::PoolNotBound => ErrorClass::Configuration,
            IpcError::OutOfMemory { .. } | IpcError::OutOfHandles | IpcError::SizeExceeded { .. } => {
                ErrorClass::Exhaustion
            }
            IpcError::PermissionDenied
            | IpcError::InvalidHandle(_)
            | IpcError::NotFound
            | IpcError::OutOfRange { .. } => ErrorClass::Access,
            IpcError::ProtocolError(_) => ErrorClass::Protocol,
            IpcError::TimedOut | IpcError::Cancelled => ErrorClass::Timing,
            IpcError::TargetGone(_) | IpcError::PeerRejected => ErrorClass::PeerFailure,
            IpcError::Platform(_) => ErrorClass::Platform,
        }
    }
}

/// Result type for IPC operations
pub type Result<T> = core::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(IpcError::PoolNotBound.class(), ErrorClass::Configuration);
        assert_eq!(IpcError::OutOfHandles.class(), ErrorClass::Exhaustion);
        assert_eq!(IpcError::InvalidHandle(3).class(), ErrorClass::Access);
        assert_eq!(IpcError::ProtocolError("x").class(), ErrorClass::Protocol);
        assert_eq!(IpcError::Cancelled.class(), ErrorClass::Timing);
        assert_eq!(IpcError::TargetGone(TaskId(1)).class(), ErrorClass::PeerFailure);
    }

    #[test]
    fn test_platform_conversion() {
        let err: IpcError = PlatformError::BadDescriptor(9).into();
        assert_eq!(err, IpcError::Platform(PlatformError::BadDescriptor(9)));
        assert_eq!(err.class(), ErrorClass::Platform);
        assert_eq!(err.to_string(), "Platform error: Bad file descriptor 9");
    }
}
