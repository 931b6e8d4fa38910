//! Shared fixtures for the binary manager integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nos_binmgr::header::{BINARY_HEADER_SIZE, BinaryHeader, encode_image};
use nos_binmgr::testing::{MemFlash, SimBoard, SimLoader, SimScheduler};
use nos_binmgr::types::fixed_str;
use nos_binmgr::{BinaryManager, BinaryType, BinmgrConfig, PartitionType, Ports};

pub const PREFIX: &str = "/dev/mtdblock";
pub const PART_SIZE: usize = 4096;
pub const BOOTPARAM_SIZE: usize = 8192;

pub const BOOTPARAM_PART: u32 = 0;
pub const KERNEL_A: u32 = 1;
pub const KERNEL_B: u32 = 2;
pub const APP1_A: u32 = 3;
pub const APP1_B: u32 = 4;
pub const APP2_A: u32 = 5;
pub const COMMON_A: u32 = 6;
pub const RESOURCE_A: u32 = 7;
pub const RESOURCE_B: u32 = 8;

pub fn path(part: u32) -> String {
    format!("{}{}", PREFIX, part)
}

pub fn header(bin_type: BinaryType, name: &str, version: &str) -> BinaryHeader {
    BinaryHeader {
        header_size: BINARY_HEADER_SIZE as u16,
        bin_type,
        bin_size: 0,
        bin_name: fixed_str(name).unwrap(),
        bin_ver: fixed_str(version).unwrap(),
        ram_size: if bin_type == BinaryType::Elf { 0x2000 } else { 0 },
        kernel_ver: fixed_str("2.0").unwrap(),
        jump_addr: 0,
    }
}

/// Writes a valid image into partition `part`
pub fn write_image(flash: &MemFlash, part: u32, bin_type: BinaryType, name: &str, version: &str) {
    let payload: Vec<u8> = (0..256u32).map(|i| (i * 7 + version.len() as u32) as u8).collect();
    let image = encode_image(&header(bin_type, name, version), &payload);
    flash.program(&path(part), 0, &image);
}

pub fn write_app(flash: &MemFlash, part: u32, name: &str, version: &str) {
    write_image(flash, part, BinaryType::Elf, name, version);
}

pub fn config() -> BinmgrConfig {
    BinmgrConfig::default()
        .with_device_prefix(PREFIX)
        .with_kernel_version("2.0")
        .with_crc_buffer_size(64)
        .with_callback_ack_timeout(Duration::from_millis(100))
        .with_response_timeout(Duration::from_secs(5))
}

/// Simulated device: flash, scheduler, loader and board
pub struct Fixture {
    pub flash: MemFlash,
    pub sched: SimScheduler,
    pub loader: Arc<SimLoader>,
    pub board: Arc<SimBoard>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_load_delay(Duration::ZERO)
    }

    pub fn with_load_delay(delay: Duration) -> Self {
        let flash = MemFlash::new();
        flash.add_partition(&path(BOOTPARAM_PART), BOOTPARAM_SIZE);
        for part in KERNEL_A..=RESOURCE_B {
            flash.add_partition(&path(part), PART_SIZE);
        }
        let sched = SimScheduler::new();
        Self {
            flash,
            loader: Arc::new(SimLoader::with_delay(sched.clone(), delay)),
            sched,
            board: Arc::new(SimBoard::new()),
        }
    }

    pub fn ports(&self) -> Ports {
        Ports {
            flash: Arc::new(self.flash.clone()),
            loader: self.loader.clone(),
            sched: Arc::new(self.sched.clone()),
            board: self.board.clone(),
        }
    }

    /// Manager with bootparam, a single-bank kernel, two apps and no images
    pub fn manager(&self) -> BinaryManager {
        let binmgr = BinaryManager::new(config(), self.ports());
        binmgr
            .register_partition(BOOTPARAM_PART as i32, PartitionType::BootParam, "bootparam", BOOTPARAM_SIZE as i32)
            .unwrap();
        binmgr
            .register_partition(KERNEL_A as i32, PartitionType::Kernel, "kernel", PART_SIZE as i32)
            .unwrap();
        binmgr
            .register_partition(APP1_A as i32, PartitionType::App, "app1", PART_SIZE as i32)
            .unwrap();
        binmgr
            .register_partition(APP1_B as i32, PartitionType::App, "app1", PART_SIZE as i32)
            .unwrap();
        binmgr
            .register_partition(APP2_A as i32, PartitionType::App, "app2", PART_SIZE as i32)
            .unwrap();
        binmgr
    }

    /// [`Fixture::manager`] with images written, started and idle
    pub fn started(&self) -> BinaryManager {
        write_app(&self.flash, APP1_A, "app1", "3");
        write_app(&self.flash, APP2_A, "app2", "1");
        let mut binmgr = self.manager();
        binmgr.start().unwrap();
        assert!(binmgr.wait_idle(Duration::from_secs(5)));
        binmgr
    }
}

/// Polls `cond` until it holds or `timeout` expires
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
