//! Partition registry
//!
//! Called once per partition while the partition table is parsed at boot.
//! Builds the binary table: the first partition of a binary becomes bank A,
//! a second partition with the same name becomes bank B.

use alloc::format;
use alloc::string::{String, ToString};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::table::{BinaryEntry, SharedTable};
use crate::types::{BinIdx, BinaryKind, PartitionType, fixed_str};

/// Records which partitions back each logical binary
pub struct PartitionRegistry {
    table: SharedTable,
    kernel_version: String,
    common_name: Option<String>,
}

impl PartitionRegistry {
    /// Create a registry filling `table`
    pub fn new(table: SharedTable, kernel_version: &str) -> Self {
        Self {
            table,
            kernel_version: kernel_version.to_string(),
            common_name: None,
        }
    }

    /// Treat `app` partitions called `name` as the shared library binary
    pub fn with_common_name(mut self, name: &str) -> Self {
        self.common_name = Some(name.to_string());
        self
    }

    /// Register one partition
    ///
    /// Malformed input is logged and reported but never panics; whether a
    /// rejected partition is fatal is left to the caller.
    pub fn register_partition(
        &self,
        part_num: i32,
        part_type: PartitionType,
        name: &str,
        size: i32,
    ) -> Result<()> {
        let res = self.try_register(part_num, part_type, name, size);
        if let Err(err) = &res {
            warn!(
                "binmgr: ignoring partition {} ({:?} '{}', {} bytes): {}",
                part_num, part_type, name, size, err
            );
        }
        res
    }

    fn try_register(&self, part_num: i32, part_type: PartitionType, name: &str, size: i32) -> Result<()> {
        if part_num < 0 {
            return Err(Error::InvalidParameter(format!("partition number {}", part_num)));
        }
        if size <= 0 {
            return Err(Error::InvalidParameter(format!("partition size {}", size)));
        }
        let part = part_num as u32;
        let size = size as u32;

        match part_type {
            PartitionType::BootParam => {
                let mut table = self.table.lock();
                if table.bootparam_part.is_some() {
                    return Err(Error::InvalidParameter("second boot parameter partition".to_string()));
                }
                table.bootparam_part = Some(part);
                debug!("binmgr: bootparam on partition {}", part);
                Ok(())
            }
            PartitionType::Kernel => self.register_kernel(part, size),
            PartitionType::Resource => {
                let mut table = self.table.lock();
                let banks = &mut table.resource;
                if banks.partitions[0].is_none() {
                    banks.partitions[0] = Some(part);
                    banks.part_size = size;
                } else if banks.partitions[1].is_none() {
                    banks.partitions[1] = Some(part);
                } else {
                    return Err(Error::InvalidParameter("third resource partition".to_string()));
                }
                Ok(())
            }
            PartitionType::App if self.common_name.as_deref() == Some(name) => {
                self.register_user(part, BinaryKind::Common, name, size).map(|_| ())
            }
            PartitionType::App => self.register_user(part, BinaryKind::User, name, size).map(|_| ()),
            PartitionType::Common => self.register_user(part, BinaryKind::Common, name, size).map(|_| ()),
        }
    }

    fn register_kernel(&self, part: u32, size: u32) -> Result<()> {
        let mut table = self.table.lock();
        let kernel = table.kernel_mut();
        if kernel.partitions[0].is_none() {
            kernel.partitions[0] = Some(part);
            kernel.part_size = size;
            kernel.version = fixed_str(&self.kernel_version)?;
            debug!("binmgr: kernel bank A on partition {}", part);
        } else if kernel.partitions[1].is_none() {
            kernel.partitions[1] = Some(part);
            debug!("binmgr: kernel bank B on partition {}", part);
        } else {
            return Err(Error::InvalidParameter("third kernel partition".to_string()));
        }
        Ok(())
    }

    fn register_user(&self, part: u32, kind: BinaryKind, name: &str, size: u32) -> Result<BinIdx> {
        if name.is_empty() {
            return Err(Error::InvalidParameter("empty binary name".to_string()));
        }
        let bin_name = fixed_str(name)?;
        let mut table = self.table.lock();

        if let Some(idx) = table.index_of(name) {
            let entry = table.entry_mut(idx)?;
            if entry.kind != kind {
                return Err(Error::InvalidParameter(format!("'{}' registered as {:?}", name, entry.kind)));
            }
            if entry.partitions[1].is_some() {
                return Err(Error::InvalidParameter(format!("third partition for '{}'", name)));
            }
            entry.partitions[1] = Some(part);
            debug!("binmgr: '{}' bank B on partition {}", name, part);
            return Ok(idx);
        }

        let idx = table.push(BinaryEntry::new(bin_name, kind, part, size))?;
        debug!("binmgr: '{}' bank A on partition {} as binary {}", name, part, idx);
        Ok(idx)
    }
}
