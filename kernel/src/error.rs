//! Kernel error types.
//!
//! Structured errors replace bare integer codes inside the kernel; the
//! syscall layer converts them to the negative values user space sees.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frames or heap exhausted.
    OutOfMemory,
    /// An address failed validation.
    InvalidAddress { addr: usize },
    /// A syscall or driver argument failed validation.
    InvalidArgument { name: &'static str },
    /// A fixed-size kernel table is full.
    ResourceExhausted { resource: &'static str },
    /// File descriptor out of range or not open.
    BadFileDescriptor,
    /// Hardware reported an error or a transfer timed out.
    Io,
    /// The requested device or operation is not available.
    NotSupported,
    /// The operation was aborted because the process was killed.
    Interrupted,
    /// A bounded wait expired.
    Timeout { operation: &'static str },
    /// Path or object lookup failed.
    NotFound,
    /// Path already exists.
    AlreadyExists,
    /// Write end or read end of a pipe is closed.
    BrokenPipe,
    /// Operation not permitted on this object.
    PermissionDenied,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// The negative errno-style value returned to user space.
    pub fn to_errno(self) -> i32 {
        match self {
            KernelError::OutOfMemory => -12,
            KernelError::InvalidAddress { .. } => -14,
            KernelError::InvalidArgument { .. } => -22,
            KernelError::ResourceExhausted { .. } => -23,
            KernelError::BadFileDescriptor => -9,
            KernelError::Io => -5,
            KernelError::NotSupported => -95,
            KernelError::Interrupted => -4,
            KernelError::Timeout { .. } => -110,
            KernelError::NotFound => -2,
            KernelError::AlreadyExists => -17,
            KernelError::BrokenPipe => -32,
            KernelError::PermissionDenied => -1,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidAddress { addr } => write!(f, "invalid address {:#x}", addr),
            Self::InvalidArgument { name } => write!(f, "invalid argument '{}'", name),
            Self::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            Self::BadFileDescriptor => write!(f, "bad file descriptor"),
            Self::Io => write!(f, "I/O error"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Timeout { operation } => write!(f, "timeout during {}", operation),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::PermissionDenied => write!(f, "permission denied"),
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_negative() {
        let all = [
            KernelError::OutOfMemory,
            KernelError::InvalidAddress { addr: 0 },
            KernelError::InvalidArgument { name: "n" },
            KernelError::ResourceExhausted { resource: "r" },
            KernelError::BadFileDescriptor,
            KernelError::Io,
            KernelError::NotSupported,
            KernelError::Interrupted,
            KernelError::Timeout { operation: "op" },
            KernelError::NotFound,
            KernelError::AlreadyExists,
            KernelError::BrokenPipe,
            KernelError::PermissionDenied,
        ];
        for e in all {
            assert!(e.to_errno() < 0, "{} must map to a negative errno", e);
        }
    }
}
