//! Board control interface

/// Why the board was reset, recorded for the next boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RebootReason {
    /// A faulted binary could not be quarantined or reloaded
    BinaryRecoveryFail,
}

impl RebootReason {
    /// Numeric reason code written to the reboot-reason register
    pub fn code(self) -> u8 {
        match self {
            RebootReason::BinaryRecoveryFail => 0x33,
        }
    }
}

/// Board-level operations
pub trait Board: Send + Sync {
    /// Resets the board. On hardware this does not return.
    fn reset(&self, reason: RebootReason);
}
