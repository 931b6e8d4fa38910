//! Binary table
//!
//! The in-memory registry of every known binary. Slot 0 is always the kernel.
//! Each entry records both banks, the header fields of the authoritative bank,
//! the running process and the callback subscribers owned by that binary.
//!
//! Tasks are not linked into the table. "Tasks of binary N" is answered by
//! filtering the scheduler's task snapshot on `TaskInfo::owner`.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use nos_api::Pid;

use crate::error::{Error, Result};
use crate::types::{
    BANK_COUNT, BinIdx, BinName, BinVersion, BinaryKind, BinaryState, KERNEL_BIN_IDX, KERNEL_NAME,
    KernelVersion, fixed_str,
};

/// Table shared between the gateway, loading thread and recovery path
pub type SharedTable = Arc<spin::Mutex<BinaryTable>>;

/// One state-callback subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackSubscription {
    /// Subscribing task
    pub pid: Pid,
    /// Opaque token echoed back in every notification
    pub token: usize,
}

/// One logical binary
#[derive(Debug, Clone)]
pub struct BinaryEntry {
    /// Running main task, if loaded
    pub id: Option<Pid>,
    /// Stable logical name
    pub name: BinName,
    /// Kernel, user or shared library
    pub kind: BinaryKind,
    /// Image payload size
    pub size: u32,
    /// RAM needed by the image
    pub ram_size: u32,
    /// Offset of the payload within the partition
    pub offset: u32,
    /// Partition numbers of bank A and bank B
    pub partitions: [Option<u32>; BANK_COUNT],
    /// Size of one partition of this binary
    pub part_size: u32,
    /// Authoritative bank
    pub in_use_bank: usize,
    /// Update version of the authoritative image
    pub version: BinVersion,
    /// Kernel version the image was built against
    pub kernel_version: KernelVersion,
    /// Lifecycle state
    pub state: BinaryState,
    /// Set once a header of this binary has been validated
    pub info_valid: bool,
    /// Subscribers living in this binary, in registration order
    pub subscribers: Vec<CallbackSubscription>,
}

impl BinaryEntry {
    /// Create an entry with bank A set
    pub fn new(name: BinName, kind: BinaryKind, part_num: u32, part_size: u32) -> Self {
        Self {
            id: None,
            name,
            kind,
            size: 0,
            ram_size: 0,
            offset: 0,
            partitions: [Some(part_num), None],
            part_size,
            in_use_bank: 0,
            version: BinVersion::new(),
            kernel_version: KernelVersion::new(),
            state: BinaryState::Inactive,
            info_valid: false,
            subscribers: Vec::new(),
        }
    }

    /// Partition of the authoritative bank
    pub fn active_partition(&self) -> Option<u32> {
        self.partitions[self.in_use_bank]
    }

    /// Partition of the other bank, if the binary has one
    pub fn inactive_partition(&self) -> Option<u32> {
        self.partitions[1 - self.in_use_bank]
    }

    /// Space available for a new image, or -1 without a second bank
    pub fn available_size(&self) -> i64 {
        match self.inactive_partition() {
            Some(_) => self.part_size as i64,
            None => -1,
        }
    }

    /// Number of banks with a partition
    pub fn bank_count(&self) -> usize {
        self.partitions.iter().filter(|p| p.is_some()).count()
    }
}

/// Banks of the resource image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceBanks {
    /// Partition numbers of bank A and bank B
    pub partitions: [Option<u32>; BANK_COUNT],
    /// Size of one resource partition
    pub part_size: u32,
}

/// Registry of all binaries
#[derive(Debug)]
pub struct BinaryTable {
    entries: Vec<BinaryEntry>,
    capacity: usize,
    /// Resource image banks
    pub resource: ResourceBanks,
    /// Partition holding the boot parameters
    pub bootparam_part: Option<u32>,
}

impl BinaryTable {
    /// Create a table with the kernel slot reserved
    pub fn new(capacity: usize) -> Self {
        let mut kernel = BinaryEntry::new(
            // KERNEL_NAME always fits
            fixed_str(KERNEL_NAME).unwrap_or_default(),
            BinaryKind::Kernel,
            0,
            0,
        );
        kernel.partitions = [None, None];
        let mut entries = Vec::with_capacity(capacity.max(1));
        entries.push(kernel);
        Self {
            entries,
            capacity: capacity.max(1),
            resource: ResourceBanks::default(),
            bootparam_part: None,
        }
    }

    /// Number of entries, kernel included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if only the kernel slot exists
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Number of user and common binaries
    pub fn user_count(&self) -> usize {
        self.entries.len() - 1
    }

    /// Indices of every non-kernel binary
    pub fn user_indices(&self) -> Range<BinIdx> {
        1..self.entries.len()
    }

    /// Get an entry
    pub fn get(&self, idx: BinIdx) -> Option<&BinaryEntry> {
        self.entries.get(idx)
    }

    /// Get a mutable entry
    pub fn get_mut(&mut self, idx: BinIdx) -> Option<&mut BinaryEntry> {
        self.entries.get_mut(idx)
    }

    /// Get an entry or a `NotFound` error
    pub fn entry(&self, idx: BinIdx) -> Result<&BinaryEntry> {
        self.entries
            .get(idx)
            .ok_or_else(|| Error::NotFound(format!("binary index {}", idx)))
    }

    /// Get a mutable entry or a `NotFound` error
    pub fn entry_mut(&mut self, idx: BinIdx) -> Result<&mut BinaryEntry> {
        self.entries
            .get_mut(idx)
            .ok_or_else(|| Error::NotFound(format!("binary index {}", idx)))
    }

    /// Kernel entry
    pub fn kernel(&self) -> &BinaryEntry {
        &self.entries[KERNEL_BIN_IDX]
    }

    /// Mutable kernel entry
    pub fn kernel_mut(&mut self) -> &mut BinaryEntry {
        &mut self.entries[KERNEL_BIN_IDX]
    }

    /// Look up a binary by name
    pub fn index_of(&self, name: &str) -> Option<BinIdx> {
        self.entries.iter().position(|e| e.name.as_str() == name)
    }

    /// Look up a binary by name or return `NotFound`
    pub fn require(&self, name: &str) -> Result<BinIdx> {
        self.index_of(name)
            .ok_or_else(|| Error::NotFound(format!("binary '{}'", name)))
    }

    /// Index of the shared library binary, if registered
    pub fn common_index(&self) -> Option<BinIdx> {
        self.entries.iter().position(|e| e.kind == BinaryKind::Common)
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = &BinaryEntry> {
        self.entries.iter()
    }

    /// Append a new entry
    pub fn push(&mut self, entry: BinaryEntry) -> Result<BinIdx> {
        if self.entries.len() >= self.capacity {
            return Err(Error::OutOfMemory);
        }
        if self.index_of(entry.name.as_str()).is_some() {
            return Err(Error::InvalidParameter(format!("duplicate binary '{}'", entry.name)));
        }
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    /// Set the lifecycle state of a binary
    pub fn set_state(&mut self, idx: BinIdx, state: BinaryState) -> Result<BinaryState> {
        let entry = self.entry_mut(idx)?;
        let old = entry.state;
        entry.state = state;
        Ok(old)
    }

    /// Find the binary owning a main task pid
    pub fn index_of_pid(&self, pid: Pid) -> Option<BinIdx> {
        self.entries.iter().position(|e| e.id == Some(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> BinName {
        fixed_str(s).unwrap()
    }

    #[test]
    fn test_kernel_slot_reserved() {
        let table = BinaryTable::new(4);
        assert_eq!(table.len(), 1);
        assert_eq!(table.kernel().name.as_str(), "kernel");
        assert_eq!(table.index_of("kernel"), Some(KERNEL_BIN_IDX));
        assert!(table.is_empty());
    }

    #[test]
    fn test_push_enforces_capacity_and_unique_names() {
        let mut table = BinaryTable::new(3);
        assert_eq!(table.push(BinaryEntry::new(name("app1"), BinaryKind::User, 4, 4096)).unwrap(), 1);
        assert!(matches!(
            table.push(BinaryEntry::new(name("app1"), BinaryKind::User, 5, 4096)),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(table.push(BinaryEntry::new(name("app2"), BinaryKind::User, 6, 4096)).unwrap(), 2);
        assert_eq!(
            table.push(BinaryEntry::new(name("app3"), BinaryKind::User, 7, 4096)),
            Err(Error::OutOfMemory)
        );
        assert_eq!(table.user_indices(), 1..3);
    }

    #[test]
    fn test_available_size_tracks_inactive_bank() {
        let mut entry = BinaryEntry::new(name("app1"), BinaryKind::User, 4, 8192);
        assert_eq!(entry.available_size(), -1);
        entry.partitions[1] = Some(5);
        assert_eq!(entry.available_size(), 8192);
        entry.in_use_bank = 1;
        assert_eq!(entry.inactive_partition(), Some(4));
    }
}
