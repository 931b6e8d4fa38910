//! Image selection and process loading
//!
//! Picks the authoritative bank of a binary from its two headers, hands the
//! image to the process loader and kills every task of a binary on unload.
//! Flash I/O never happens with the table lock held: bank coordinates are
//! snapshotted first and results are written back afterwards.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info, warn};
use nos_api::{FlashDevice, LoadRequest, Pid, ProcessLoader, Scheduler};

use crate::error::{Error, Result};
use crate::header::{self, BinaryHeader};
use crate::table::SharedTable;
use crate::types::{BANK_COUNT, BinIdx, BinaryKind, BinaryType, DevicePath, device_path};

/// Bank coordinates of one binary, taken under the table lock
#[derive(Debug, Clone, Copy)]
struct BankSnapshot {
    partitions: [Option<u32>; BANK_COUNT],
    part_size: u32,
    kind: BinaryKind,
}

/// Reads headers and drives the process loader
pub struct ImageLoader {
    table: SharedTable,
    flash: Arc<dyn FlashDevice>,
    loader: Arc<dyn ProcessLoader>,
    sched: Arc<dyn Scheduler>,
    prefix: String,
    scratch_len: usize,
}

impl ImageLoader {
    pub fn new(
        table: SharedTable,
        flash: Arc<dyn FlashDevice>,
        loader: Arc<dyn ProcessLoader>,
        sched: Arc<dyn Scheduler>,
        prefix: &str,
        scratch_len: usize,
    ) -> Self {
        Self {
            table,
            flash,
            loader,
            sched,
            prefix: prefix.to_string(),
            scratch_len,
        }
    }

    /// Device path of a partition number
    pub fn partition_path(&self, part: u32) -> Result<DevicePath> {
        device_path(&self.prefix, part)
    }

    fn snapshot(&self, idx: BinIdx) -> Result<BankSnapshot> {
        let table = self.table.lock();
        let entry = table.entry(idx)?;
        Ok(BankSnapshot {
            partitions: entry.partitions,
            part_size: entry.part_size,
            kind: entry.kind,
        })
    }

    /// Reads and validates the header in `bank` of binary `idx`
    pub fn read_header(&self, idx: BinIdx, bank: usize) -> Result<BinaryHeader> {
        let snap = self.snapshot(idx)?;
        let part = snap
            .partitions
            .get(bank)
            .copied()
            .flatten()
            .ok_or_else(|| Error::NotFound(format!("bank {} of binary {}", bank, idx)))?;
        let expected = match snap.kind {
            BinaryKind::Kernel => BinaryType::Kernel,
            BinaryKind::User | BinaryKind::Common => BinaryType::Elf,
        };
        let path = self.partition_path(part)?;
        header::read_header(self.flash.as_ref(), &path, snap.part_size, expected, self.scratch_len)
    }

    /// Reads and validates the header in `bank` of the resource image
    pub fn read_resource_header(&self, bank: usize) -> Result<BinaryHeader> {
        let banks = self.table.lock().resource;
        let part = banks
            .partitions
            .get(bank)
            .copied()
            .flatten()
            .ok_or_else(|| Error::NotFound(format!("resource bank {}", bank)))?;
        let path = self.partition_path(part)?;
        header::read_header(self.flash.as_ref(), &path, banks.part_size, BinaryType::Resource, self.scratch_len)
    }

    /// Numeric version in `bank` of binary `idx`, `None` if the bank is unusable
    pub fn bank_version(&self, idx: BinIdx, bank: usize) -> Option<u32> {
        self.read_header(idx, bank).ok()?.version_number()
    }

    /// Numeric version in `bank` of the resource image
    pub fn resource_bank_version(&self, bank: usize) -> Option<u32> {
        self.read_resource_header(bank).ok()?.version_number()
    }

    /// Selects the authoritative bank of binary `idx` and records its header
    ///
    /// Only a strictly higher version wins. Two valid banks with the same
    /// version are ambiguous and reported as `NotFound`, as is a binary with no
    /// valid bank at all. The table is left untouched on failure.
    pub fn load_binary_info(&self, idx: BinIdx) -> Result<()> {
        let snap = self.snapshot(idx)?;
        let name = self.table.lock().entry(idx)?.name.clone();

        let mut best: Option<(usize, BinaryHeader, u32)> = None;
        let mut tied = false;
        for bank in 0..BANK_COUNT {
            if snap.partitions[bank].is_none() {
                continue;
            }
            let header = match self.read_header(idx, bank) {
                Ok(header) => header,
                Err(err) => {
                    warn!("binmgr: '{}' bank {} invalid: {}", name, bank, err);
                    continue;
                }
            };
            if header.bin_name != name {
                warn!("binmgr: '{}' bank {} holds image '{}'", name, bank, header.bin_name);
                continue;
            }
            let Some(version) = header.version_number() else {
                warn!("binmgr: '{}' bank {} has version '{}'", name, bank, header.bin_ver);
                continue;
            };
            match &best {
                Some((_, _, current)) if version < *current => {}
                Some((_, _, current)) if version == *current => tied = true,
                _ => {
                    best = Some((bank, header, version));
                    tied = false;
                }
            }
        }

        let (bank, header, _) = match best {
            Some(_) if tied => {
                return Err(Error::NotFound(format!("'{}' has two banks with one version", name)));
            }
            Some(best) => best,
            None => return Err(Error::NotFound(format!("'{}' has no valid bank", name))),
        };

        let mut table = self.table.lock();
        let entry = table.entry_mut(idx)?;
        entry.size = header.bin_size;
        entry.ram_size = header.ram_size;
        entry.offset = header.payload_offset();
        entry.version = header.bin_ver.clone();
        entry.kernel_version = header.kernel_ver.clone();
        entry.in_use_bank = bank;
        entry.info_valid = true;
        debug!("binmgr: '{}' uses bank {} version {}", name, bank, header.bin_ver);
        Ok(())
    }

    /// Loads the authoritative image of binary `idx` as a new process
    ///
    /// Requires a prior successful [`ImageLoader::load_binary_info`]. On
    /// failure the binary's pid is cleared.
    pub fn load_binary(&self, idx: BinIdx) -> Result<Pid> {
        let (path, size, offset, ram_size, name) = {
            let table = self.table.lock();
            let entry = table.entry(idx)?;
            if !entry.info_valid {
                return Err(Error::InvalidParameter(format!("'{}' has no validated header", entry.name)));
            }
            let part = entry
                .active_partition()
                .ok_or_else(|| Error::NotFound(format!("'{}' active bank", entry.name)))?;
            (
                self.partition_path(part)?,
                entry.size,
                entry.offset,
                entry.ram_size,
                entry.name.clone(),
            )
        };

        let req = LoadRequest {
            path: &path,
            bin_idx: idx,
            size,
            offset,
            ram_size,
        };
        let res = self.loader.load_binary(&req);

        let mut table = self.table.lock();
        let entry = table.entry_mut(idx)?;
        match res {
            Ok(pid) => {
                entry.id = Some(pid);
                info!("binmgr: '{}' loaded from {} as pid {}", name, path, pid);
                Ok(pid)
            }
            Err(err) => {
                entry.id = None;
                Err(Error::OperationFailed(format!("load '{}' from {}: {}", name, path, err)))
            }
        }
    }

    /// Re-selects the bank and loads binary `idx`
    pub fn load(&self, idx: BinIdx) -> Result<Pid> {
        self.load_binary_info(idx)?;
        self.load_binary(idx)
    }

    /// Terminates every task of binary `idx`
    ///
    /// Stops at the first task that cannot be terminated.
    pub fn kill_binary(&self, idx: BinIdx) -> Result<()> {
        let victims: Vec<Pid> = self
            .sched
            .tasks()
            .into_iter()
            .filter(|t| t.is_owned_by(idx))
            .map(|t| t.pid)
            .collect();

        for pid in victims {
            self.sched
                .terminate(pid)
                .map_err(|err| Error::OperationFailed(format!("terminate pid {}: {}", pid, err)))?;
        }

        self.table.lock().entry_mut(idx)?.id = None;
        Ok(())
    }
}
