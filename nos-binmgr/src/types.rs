//! Binary manager types and constants

use alloc::format;
use alloc::string::ToString;
use bitflags::bitflags;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Maximum binary name length, terminator included
pub const BIN_NAME_MAX: usize = 16;
/// Maximum version string length, terminator included
pub const BIN_VER_MAX: usize = 16;
/// Maximum kernel version string length, terminator included
pub const KERNEL_VER_MAX: usize = 8;
/// Maximum device path length
pub const DEVICE_PATH_MAX: usize = 32;

/// Number of banks behind each logical binary
pub const BANK_COUNT: usize = 2;
/// Binary table index of the kernel
pub const KERNEL_BIN_IDX: usize = 0;
/// Name of the kernel entry
pub const KERNEL_NAME: &str = "kernel";

/// Binary table index
pub type BinIdx = usize;

/// Fixed-capacity binary name
pub type BinName = heapless::String<BIN_NAME_MAX>;
/// Fixed-capacity version string
pub type BinVersion = heapless::String<BIN_VER_MAX>;
/// Fixed-capacity kernel version string
pub type KernelVersion = heapless::String<KERNEL_VER_MAX>;
/// Fixed-capacity device path
pub type DevicePath = heapless::String<DEVICE_PATH_MAX>;

/// Copies `s` into a fixed-capacity string, rejecting overlong input
///
/// One byte of the capacity is kept for the on-flash terminator.
pub fn fixed_str<const N: usize>(s: &str) -> Result<heapless::String<N>> {
    let mut out = heapless::String::new();
    if s.len() >= N || out.push_str(s).is_err() {
        return Err(Error::InvalidParameter(format!("'{}' longer than {} bytes", s, N - 1)));
    }
    Ok(out)
}

/// Formats the device path of partition `part_num`
pub fn device_path(prefix: &str, part_num: u32) -> Result<DevicePath> {
    use core::fmt::Write;

    let mut path = DevicePath::new();
    write!(path, "{}{}", prefix, part_num)
        .map_err(|_| Error::InvalidParameter("device path too long".to_string()))?;
    Ok(path)
}

// ============================================================================
// Binary classification
// ============================================================================

/// Kind of a binary table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    /// The kernel image, slot 0
    Kernel,
    /// An application with its own task context
    User,
    /// Shared library binary whose code runs inside user binaries
    Common,
}

/// Partition types known to the partition registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// Boot parameter area
    BootParam,
    /// Kernel bank
    Kernel,
    /// Resource bank
    Resource,
    /// Application bank
    App,
    /// Shared library bank
    Common,
}

impl PartitionType {
    /// Classifies a partition type string from the partition table
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bootparam" => Some(PartitionType::BootParam),
            "kernel" => Some(PartitionType::Kernel),
            "resource" => Some(PartitionType::Resource),
            "app" => Some(PartitionType::App),
            "common" => Some(PartitionType::Common),
            _ => None,
        }
    }
}

/// Image type declared in a binary header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BinaryType {
    /// Loadable application (ELF)
    Elf = 1,
    /// Kernel image
    Kernel = 2,
    /// Resource image
    Resource = 3,
}

impl BinaryType {
    /// Decodes the raw header field
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(BinaryType::Elf),
            2 => Some(BinaryType::Kernel),
            3 => Some(BinaryType::Resource),
            _ => None,
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryState {
    /// Registered but not loaded
    #[default]
    Inactive,
    /// Loaded and running
    Running,
    /// About to be killed for a reload
    ReadyToUnload,
    /// Killed, not yet reloaded
    Unloaded,
    /// Crashed, tasks quarantined
    Fault,
    /// Reload after a fault in progress
    Reloading,
}

impl BinaryState {
    /// Returns true while a fault recovery owns the binary
    pub fn is_recovering(self) -> bool {
        matches!(self, BinaryState::Fault | BinaryState::Reloading)
    }
}

bitflags! {
    /// Groups of images an update request may switch
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BinaryGroup: u8 {
        /// Kernel banks
        const KERNEL = 0x01;
        /// Resource banks
        const RESOURCE = 0x02;
        /// Every user application
        const APP = 0x04;
        /// Shared library binary
        const COMMON = 0x08;
    }
}
