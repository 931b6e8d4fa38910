//! Error handling module for kernel ports

use core::fmt;

/// Error returned by the kernel ports (flash, loader, scheduler)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No such file, device or object
    NotFound,
    /// Input/output error
    IoError,
    /// Invalid argument
    InvalidArgument,
    /// Not enough memory
    OutOfMemory,
    /// Resource busy
    Busy,
    /// Short read or write at end of partition
    UnexpectedEof,
    /// No such process
    NoProcess,
    /// Operation not supported
    NotSupported,
    /// Unknown error
    Unknown(i32),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NotFound => write!(f, "No such file or directory"),
            KernelError::IoError => write!(f, "Input/output error"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::OutOfMemory => write!(f, "Not enough memory"),
            KernelError::Busy => write!(f, "Resource busy"),
            KernelError::UnexpectedEof => write!(f, "Unexpected end of partition"),
            KernelError::NoProcess => write!(f, "No such process"),
            KernelError::NotSupported => write!(f, "Operation not supported"),
            KernelError::Unknown(code) => write!(f, "Unknown error: {}", code),
        }
    }
}

/// Result type for kernel port operations
pub type KernelResult<T> = core::result::Result<T, KernelError>;
