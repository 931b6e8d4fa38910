//! Error handling for the binary manager
//!
//! Every component returns [`Result`]. The request gateway is the only place
//! that turns an [`Error`] into a wire-level [`ResultCode`].

use core::fmt;

use alloc::string::String;
use nos_api::KernelError;

/// Binary manager error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed input, rejected without side effects
    InvalidParameter(String),
    /// Allocation or fixed-capacity table exhausted
    OutOfMemory,
    /// No such binary, bank or record
    NotFound(String),
    /// Subscription already present for this task
    AlreadyRegistered,
    /// Every requested group is already on its newest image
    AlreadyUpdated,
    /// An operation ran but did not succeed
    OperationFailed(String),
    /// Header or record failed its structural or CRC check
    Validation(String),
    /// Partition I/O failed
    Io(KernelError),
    /// A bounded wait expired
    Timeout,
    /// A scheduler or loader port reported an error
    Kernel(KernelError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::AlreadyRegistered => write!(f, "Already registered"),
            Error::AlreadyUpdated => write!(f, "Already updated"),
            Error::OperationFailed(msg) => write!(f, "Operation failed: {}", msg),
            Error::Validation(msg) => write!(f, "Validation failed: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Kernel(err) => write!(f, "Kernel error: {}", err),
        }
    }
}

impl From<KernelError> for Error {
    fn from(err: KernelError) -> Self {
        Error::Kernel(err)
    }
}

/// Result type for binary manager operations
pub type Result<T> = core::result::Result<T, Error>;

/// Closed set of result codes carried in every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    OperationFailed = -2,
    InvalidParameter = -3,
    OutOfMemory = -4,
    NotFound = -6,
    AlreadyRegistered = -7,
    AlreadyUpdated = -8,
}

impl ResultCode {
    /// Raw wire value
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Returns true for [`ResultCode::Ok`]
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

impl From<&Error> for ResultCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidParameter(_) => ResultCode::InvalidParameter,
            Error::OutOfMemory => ResultCode::OutOfMemory,
            Error::NotFound(_) => ResultCode::NotFound,
            Error::AlreadyRegistered => ResultCode::AlreadyRegistered,
            Error::AlreadyUpdated => ResultCode::AlreadyUpdated,
            Error::OperationFailed(_)
            | Error::Validation(_)
            | Error::Io(_)
            | Error::Timeout
            | Error::Kernel(_) => ResultCode::OperationFailed,
        }
    }
}

impl<T> From<&Result<T>> for ResultCode {
    fn from(res: &Result<T>) -> Self {
        match res {
            Ok(_) => ResultCode::Ok,
            Err(err) => ResultCode::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_result_code_translation() {
        assert_eq!(ResultCode::from(&Error::OutOfMemory), ResultCode::OutOfMemory);
        assert_eq!(ResultCode::from(&Error::AlreadyRegistered), ResultCode::AlreadyRegistered);
        assert_eq!(
            ResultCode::from(&Error::Validation("crc".to_string())),
            ResultCode::OperationFailed
        );
        assert_eq!(ResultCode::from(&Error::Io(KernelError::IoError)), ResultCode::OperationFailed);
        assert_eq!(ResultCode::from(&Ok::<(), Error>(())), ResultCode::Ok);
        assert_eq!(ResultCode::NotFound.as_raw(), -6);
    }
}
