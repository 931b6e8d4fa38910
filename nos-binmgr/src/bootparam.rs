//! Boot parameters
//!
//! The boot parameter partition holds two slots of [`BOOTPARAM_RECORD_SIZE`]
//! bytes, slot `i` at offset `i * slot_size`. The bootloader picks the valid
//! slot with the higher update version. A new record is always written to the
//! slot that is *not* authoritative, so a power loss mid-write leaves the
//! previous record intact.
//!
//! Record layout, little endian:
//!
//! ```text
//! crc u32 | format u8 | version u32 | kernel_idx u8 | kernel_addr [u32; 2] |
//! resource_idx u8 | app_count u8 | app_banks [u8; MAX_APP_SLOTS]
//! ```
//!
//! The CRC covers every byte after itself.

use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{error, info, warn};
use nos_api::{FlashDevice, OpenFlags};
use static_assertions::const_assert;

use crate::crc::crc32;
use crate::error::{Error, Result, ResultCode};
use crate::loader::ImageLoader;
use crate::types::{BANK_COUNT, BinIdx, BinaryGroup, BinaryKind, DevicePath, KERNEL_BIN_IDX};

/// Current record format
pub const BOOTPARAM_FORMAT_VERSION: u8 = 1;
/// Number of per-application bank indices in a record
pub const MAX_APP_SLOTS: usize = 8;
/// Encoded record size
pub const BOOTPARAM_RECORD_SIZE: usize = 4 + 1 + 4 + 1 + 2 * 4 + 1 + 1 + MAX_APP_SLOTS;

const_assert!(BOOTPARAM_RECORD_SIZE <= crate::config::DEFAULT_BOOTPARAM_SIZE as usize / 2);

/// One boot parameter record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootParamRecord {
    /// Record format, zero marks an erased slot
    pub format_version: u8,
    /// Monotonic update counter
    pub update_version: u32,
    /// Bank the bootloader starts the kernel from
    pub active_kernel_bank: u8,
    /// Load address of each kernel bank
    pub kernel_address: [u32; BANK_COUNT],
    /// Authoritative resource bank
    pub active_resource_bank: u8,
    /// Number of applications described
    pub app_count: u8,
    /// Authoritative bank of each application, indexed by binary index - 1
    pub app_banks: [u8; MAX_APP_SLOTS],
}

impl Default for BootParamRecord {
    fn default() -> Self {
        Self {
            format_version: BOOTPARAM_FORMAT_VERSION,
            update_version: 0,
            active_kernel_bank: 0,
            kernel_address: [0; BANK_COUNT],
            active_resource_bank: 0,
            app_count: 0,
            app_banks: [0; MAX_APP_SLOTS],
        }
    }
}

impl BootParamRecord {
    /// Encode with a fresh CRC
    pub fn encode(&self) -> [u8; BOOTPARAM_RECORD_SIZE] {
        let mut buf = [0u8; BOOTPARAM_RECORD_SIZE];
        let mut at = 4;
        let mut put = |bytes: &[u8]| {
            buf[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&[self.format_version]);
        put(&self.update_version.to_le_bytes());
        put(&[self.active_kernel_bank]);
        for addr in self.kernel_address {
            put(&addr.to_le_bytes());
        }
        put(&[self.active_resource_bank]);
        put(&[self.app_count]);
        put(&self.app_banks);

        let crc = crc32(&buf[4..]);
        buf[..4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode and check CRC, format and bank indices
    pub fn decode(buf: &[u8; BOOTPARAM_RECORD_SIZE]) -> Result<Self> {
        let stored = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let computed = crc32(&buf[4..]);
        if stored != computed {
            return Err(Error::Validation(format!(
                "bootparam crc {:#010x} != stored {:#010x}",
                computed, stored
            )));
        }

        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut app_banks = [0u8; MAX_APP_SLOTS];
        app_banks.copy_from_slice(&buf[20..20 + MAX_APP_SLOTS]);
        let record = Self {
            format_version: buf[4],
            update_version: u32_at(5),
            active_kernel_bank: buf[9],
            kernel_address: [u32_at(10), u32_at(14)],
            active_resource_bank: buf[18],
            app_count: buf[19],
            app_banks,
        };

        if record.format_version == 0 {
            return Err(Error::Validation("bootparam slot erased".to_string()));
        }
        if record.active_kernel_bank as usize >= BANK_COUNT
            || record.active_resource_bank as usize >= BANK_COUNT
            || record.app_banks.iter().any(|&b| b as usize >= BANK_COUNT)
        {
            return Err(Error::Validation("bootparam bank index out of range".to_string()));
        }
        Ok(record)
    }

    /// Authoritative bank of binary `idx`
    pub fn app_bank(&self, idx: BinIdx) -> Option<usize> {
        let slot = idx.checked_sub(1)?;
        self.app_banks.get(slot).map(|&b| b as usize)
    }

    fn flip_app_bank(&mut self, idx: BinIdx) -> bool {
        match idx.checked_sub(1).and_then(|slot| self.app_banks.get_mut(slot)) {
            Some(bank) => {
                *bank = 1 - *bank;
                true
            }
            None => false,
        }
    }
}

/// One binary the update pass may switch
#[derive(Debug, Clone, Copy)]
pub struct UpdateTarget {
    /// Binary table index
    pub idx: BinIdx,
    /// Kind of the binary
    pub kind: BinaryKind,
}

/// Owns the boot parameter partition
pub struct BootParamManager {
    flash: Arc<dyn FlashDevice>,
    path: Option<DevicePath>,
    slot_size: u32,
    kernel_banks: usize,
    current: Option<BootParamRecord>,
    inuse_idx: Option<usize>,
}

impl BootParamManager {
    /// Create a manager; `path` is `None` when no partition was registered
    ///
    /// `kernel_banks` is the number of registered kernel partitions; a record
    /// selecting a kernel bank beyond it is invalid.
    pub fn new(
        flash: Arc<dyn FlashDevice>,
        path: Option<DevicePath>,
        slot_size: u32,
        kernel_banks: usize,
    ) -> Self {
        Self {
            flash,
            path,
            slot_size,
            kernel_banks: kernel_banks.max(1),
            current: None,
            inuse_idx: None,
        }
    }

    /// Authoritative record, if one was found or written
    pub fn current(&self) -> Option<&BootParamRecord> {
        self.current.as_ref()
    }

    /// Slot holding the authoritative record
    pub fn inuse_idx(&self) -> Option<usize> {
        self.inuse_idx
    }

    fn path(&self) -> Result<&str> {
        self.path
            .as_deref()
            .ok_or_else(|| Error::NotFound("boot parameter partition".to_string()))
    }

    fn read_slot(&self, slot: usize) -> Result<BootParamRecord> {
        let mut dev = self.flash.open(self.path()?, OpenFlags::READ).map_err(Error::Io)?;
        dev.seek(slot as u64 * self.slot_size as u64).map_err(Error::Io)?;
        let mut buf = [0u8; BOOTPARAM_RECORD_SIZE];
        dev.read_exact(&mut buf).map_err(Error::Io)?;
        let record = BootParamRecord::decode(&buf)?;
        if record.active_kernel_bank as usize >= self.kernel_banks {
            return Err(Error::Validation(format!(
                "kernel bank {} of {}",
                record.active_kernel_bank, self.kernel_banks
            )));
        }
        Ok(record)
    }

    /// Reads both slots and adopts the valid one with the higher version
    pub fn scan(&mut self) -> Result<BootParamRecord> {
        let mut best: Option<(usize, BootParamRecord)> = None;
        for slot in 0..BANK_COUNT {
            match self.read_slot(slot) {
                Ok(record) => {
                    if best.map_or(true, |(_, b)| record.update_version > b.update_version) {
                        best = Some((slot, record));
                    }
                }
                Err(Error::NotFound(msg)) => return Err(Error::NotFound(msg)),
                Err(err) => warn!("binmgr: bootparam slot {} unusable: {}", slot, err),
            }
        }

        let (slot, record) = best.ok_or_else(|| Error::NotFound("valid boot parameters".to_string()))?;
        info!(
            "binmgr: bootparam slot {} version {} kernel bank {}",
            slot, record.update_version, record.active_kernel_bank
        );
        self.current = Some(record);
        self.inuse_idx = Some(slot);
        Ok(record)
    }

    /// Writes `record` to the non-authoritative slot and adopts it
    ///
    /// The update version must move forward. On error the authoritative
    /// record is unchanged.
    pub fn write(&mut self, record: BootParamRecord) -> Result<()> {
        if let Some(current) = &self.current {
            if record.update_version <= current.update_version {
                return Err(Error::InvalidParameter(format!(
                    "bootparam version {} not above {}",
                    record.update_version, current.update_version
                )));
            }
        }
        let target = match self.inuse_idx {
            Some(slot) => 1 - slot,
            None => 0,
        };

        let raw = record.encode();
        let mut dev = self.flash.open(self.path()?, OpenFlags::READ_WRITE).map_err(Error::Io)?;
        dev.seek(target as u64 * self.slot_size as u64).map_err(Error::Io)?;
        dev.write_all(&raw).map_err(Error::Io)?;

        self.current = Some(record);
        self.inuse_idx = Some(target);
        info!("binmgr: bootparam version {} written to slot {}", record.update_version, target);
        Ok(())
    }

    /// Switches every requested group whose other bank holds a newer image
    ///
    /// Works on a copy of the authoritative record and writes at most once.
    /// Returns a code per requested group: `Ok` if switched, `AlreadyUpdated`
    /// if the other bank is not newer, `NotFound` if the group has no binary.
    /// When the write fails every switched group reports `OperationFailed`.
    pub fn update(
        &mut self,
        images: &ImageLoader,
        targets: &[UpdateTarget],
        groups: BinaryGroup,
    ) -> Result<Vec<(BinaryGroup, ResultCode)>> {
        if groups.is_empty() {
            return Err(Error::InvalidParameter("no update group".to_string()));
        }
        let base = self.current.unwrap_or_default();
        let mut work = base;
        work.app_count = targets.iter().filter(|t| t.kind == BinaryKind::User).count() as u8;
        let mut results = Vec::new();

        for group in [BinaryGroup::KERNEL, BinaryGroup::RESOURCE, BinaryGroup::APP, BinaryGroup::COMMON] {
            if !groups.contains(group) {
                continue;
            }
            let code = if group == BinaryGroup::KERNEL {
                let active = work.active_kernel_bank as usize;
                if newer_in_other_bank(active, |bank| images.bank_version(KERNEL_BIN_IDX, bank)) {
                    work.active_kernel_bank = (1 - active) as u8;
                    ResultCode::Ok
                } else {
                    ResultCode::AlreadyUpdated
                }
            } else if group == BinaryGroup::RESOURCE {
                let active = work.active_resource_bank as usize;
                if newer_in_other_bank(active, |bank| images.resource_bank_version(bank)) {
                    work.active_resource_bank = (1 - active) as u8;
                    ResultCode::Ok
                } else {
                    ResultCode::AlreadyUpdated
                }
            } else {
                let kind = if group == BinaryGroup::APP {
                    BinaryKind::User
                } else {
                    BinaryKind::Common
                };
                let members: Vec<BinIdx> = targets.iter().filter(|t| t.kind == kind).map(|t| t.idx).collect();
                if members.is_empty() {
                    ResultCode::NotFound
                } else {
                    let mut switched = false;
                    for idx in members {
                        let Some(active) = work.app_bank(idx) else {
                            warn!("binmgr: binary {} has no bootparam slot", idx);
                            continue;
                        };
                        if newer_in_other_bank(active, |bank| images.bank_version(idx, bank)) {
                            switched |= work.flip_app_bank(idx);
                        }
                    }
                    if switched {
                        ResultCode::Ok
                    } else {
                        ResultCode::AlreadyUpdated
                    }
                }
            };
            results.push((group, code));
        }

        if results.iter().any(|(_, code)| code.is_ok()) {
            work.update_version = base.update_version.wrapping_add(1);
            if let Err(err) = self.write(work) {
                error!("binmgr: bootparam update failed: {}", err);
                for (_, code) in results.iter_mut().filter(|(_, code)| code.is_ok()) {
                    *code = ResultCode::OperationFailed;
                }
            }
        }
        Ok(results)
    }
}

fn newer_in_other_bank(active: usize, version_of: impl Fn(usize) -> Option<u32>) -> bool {
    let other = 1 - active.min(1);
    match (version_of(other), version_of(active)) {
        (Some(candidate), Some(current)) => candidate > current,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_decode_inverts_encode() {
        let mut record = BootParamRecord::default();
        record.update_version = 7;
        record.active_kernel_bank = 1;
        record.kernel_address = [0x0400_0000, 0x0480_0000];
        record.app_count = 2;
        record.app_banks[1] = 1;
        assert_eq!(BootParamRecord::decode(&record.encode()).unwrap(), record);
        assert_eq!(record.app_bank(2), Some(1));
        assert_eq!(record.app_bank(0), None);
    }

    #[test]
    fn test_record_rejects_erased_and_corrupt() {
        assert!(BootParamRecord::decode(&[0xFF; BOOTPARAM_RECORD_SIZE]).is_err());

        let mut raw = BootParamRecord::default().encode();
        raw[6] ^= 0x01;
        assert!(matches!(BootParamRecord::decode(&raw), Err(Error::Validation(_))));
    }

    #[test]
    fn test_newer_in_other_bank() {
        assert!(newer_in_other_bank(0, |b| Some([3, 7][b])));
        assert!(!newer_in_other_bank(1, |b| Some([3, 7][b])));
        assert!(!newer_in_other_bank(0, |b| Some([5, 5][b])));
        assert!(newer_in_other_bank(0, |b| if b == 1 { Some(1) } else { None }));
        assert!(!newer_in_other_bank(0, |b| if b == 0 { Some(1) } else { None }));
    }
}
