//! On-flash image header
//!
//! Layout of every bank, little endian:
//!
//! ```text
//! +--------+-------------------------------+------------------+
//! | crc32  | header (BINARY_HEADER_SIZE)   | payload bin_size |
//! +--------+-------------------------------+------------------+
//! ```
//!
//! The CRC covers the header bytes followed by the payload, never itself.

use alloc::format;
use alloc::string::ToString;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;

use nos_api::{FlashDevice, OpenFlags};
use static_assertions::const_assert_eq;

use crate::crc::Crc32;
use crate::error::{Error, Result};
use crate::types::{
    BIN_NAME_MAX, BIN_VER_MAX, BinName, BinVersion, BinaryType, KERNEL_VER_MAX, KernelVersion,
    fixed_str,
};

/// Size of the CRC field in front of the header
pub const CHECKSUM_SIZE: usize = size_of::<u32>();

/// Encoded header size
pub const BINARY_HEADER_SIZE: usize = 2 + 2 + 4 + BIN_NAME_MAX + BIN_VER_MAX + 4 + KERNEL_VER_MAX + 4;

const_assert_eq!(BINARY_HEADER_SIZE, 56);

/// Decoded image header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryHeader {
    /// Header size as written by the packer
    pub header_size: u16,
    /// Declared image type
    pub bin_type: BinaryType,
    /// Payload size
    pub bin_size: u32,
    /// Binary name
    pub bin_name: BinName,
    /// Update version, a decimal number
    pub bin_ver: BinVersion,
    /// RAM needed by the image
    pub ram_size: u32,
    /// Kernel version the image was built against
    pub kernel_ver: KernelVersion,
    /// Entry point offset
    pub jump_addr: u32,
}

impl BinaryHeader {
    /// Encode to the on-flash representation
    pub fn encode(&self) -> [u8; BINARY_HEADER_SIZE] {
        let mut buf = [0u8; BINARY_HEADER_SIZE];
        let mut at = 0;
        put(&mut buf, &mut at, &self.header_size.to_le_bytes());
        put(&mut buf, &mut at, &(self.bin_type as u16).to_le_bytes());
        put(&mut buf, &mut at, &self.bin_size.to_le_bytes());
        put_str(&mut buf, &mut at, self.bin_name.as_str(), BIN_NAME_MAX);
        put_str(&mut buf, &mut at, self.bin_ver.as_str(), BIN_VER_MAX);
        put(&mut buf, &mut at, &self.ram_size.to_le_bytes());
        put_str(&mut buf, &mut at, self.kernel_ver.as_str(), KERNEL_VER_MAX);
        put(&mut buf, &mut at, &self.jump_addr.to_le_bytes());
        buf
    }

    /// Decode and structurally validate a header
    pub fn decode(buf: &[u8; BINARY_HEADER_SIZE]) -> Result<Self> {
        let mut at = 0;
        let header_size = u16::from_le_bytes(take(buf, &mut at));
        let raw_type = u16::from_le_bytes(take(buf, &mut at));
        let bin_size = u32::from_le_bytes(take(buf, &mut at));
        let bin_name = header_field(take_str(buf, &mut at, BIN_NAME_MAX)?, "binary name")?;
        let bin_ver = header_field(take_str(buf, &mut at, BIN_VER_MAX)?, "binary version")?;
        let ram_size = u32::from_le_bytes(take(buf, &mut at));
        let kernel_ver = header_field(take_str(buf, &mut at, KERNEL_VER_MAX)?, "kernel version")?;
        let jump_addr = u32::from_le_bytes(take(buf, &mut at));

        if header_size as usize != BINARY_HEADER_SIZE {
            return Err(Error::Validation(format!("header size {}", header_size)));
        }
        let bin_type = BinaryType::from_raw(raw_type)
            .ok_or_else(|| Error::Validation(format!("binary type {}", raw_type)))?;

        Ok(Self {
            header_size,
            bin_type,
            bin_size,
            bin_name,
            bin_ver,
            ram_size,
            kernel_ver,
            jump_addr,
        })
    }

    /// Numeric update version, if the version string is a decimal number
    pub fn version_number(&self) -> Option<u32> {
        parse_version(self.bin_ver.as_str())
    }

    /// Offset of the payload within the partition
    pub fn payload_offset(&self) -> u32 {
        (CHECKSUM_SIZE + self.header_size as usize) as u32
    }
}

/// Packs a header and payload into a bank image with its leading CRC
///
/// `bin_size` is taken from the payload length.
pub fn encode_image(header: &BinaryHeader, payload: &[u8]) -> Vec<u8> {
    let mut header = header.clone();
    header.bin_size = payload.len() as u32;
    let raw = header.encode();

    let mut crc = Crc32::new();
    crc.update(&raw);
    crc.update(payload);

    let mut image = Vec::with_capacity(CHECKSUM_SIZE + raw.len() + payload.len());
    image.extend_from_slice(&crc.finalize().to_le_bytes());
    image.extend_from_slice(&raw);
    image.extend_from_slice(payload);
    image
}

/// Parses a decimal update version
pub fn parse_version(s: &str) -> Option<u32> {
    s.trim().parse::<u32>().ok()
}

fn put(buf: &mut [u8], at: &mut usize, bytes: &[u8]) {
    buf[*at..*at + bytes.len()].copy_from_slice(bytes);
    *at += bytes.len();
}

fn put_str(buf: &mut [u8], at: &mut usize, s: &str, width: usize) {
    let n = s.len().min(width - 1);
    buf[*at..*at + n].copy_from_slice(&s.as_bytes()[..n]);
    *at += width;
}

fn take<const N: usize>(buf: &[u8], at: &mut usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[*at..*at + N]);
    *at += N;
    out
}

fn take_str<'a>(buf: &'a [u8], at: &mut usize, width: usize) -> Result<&'a str> {
    let field = &buf[*at..*at + width];
    *at += width;
    let len = field
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Validation("unterminated string field".to_string()))?;
    core::str::from_utf8(&field[..len]).map_err(|_| Error::Validation("non-utf8 string field".to_string()))
}

/// A string field read from flash; anything that does not fit is corrupt data
fn header_field<const N: usize>(raw: &str, field: &str) -> Result<heapless::String<N>> {
    fixed_str(raw).map_err(|_| Error::Validation(format!("{} field too long", field)))
}

/// Reads and validates the header of one bank
///
/// `part_size` bounds the declared payload; the payload is streamed through a
/// scratch buffer of `scratch_len` bytes so memory use does not depend on the
/// image size. A CRC mismatch is a `Validation` error for this bank only.
pub fn read_header(
    flash: &dyn FlashDevice,
    path: &str,
    part_size: u32,
    expected: BinaryType,
    scratch_len: usize,
) -> Result<BinaryHeader> {
    let mut dev = flash.open(path, OpenFlags::READ).map_err(Error::Io)?;
    dev.seek(0).map_err(Error::Io)?;

    let mut crc_field = [0u8; CHECKSUM_SIZE];
    dev.read_exact(&mut crc_field).map_err(Error::Io)?;
    let stored_crc = u32::from_le_bytes(crc_field);

    let mut raw = [0u8; BINARY_HEADER_SIZE];
    dev.read_exact(&mut raw).map_err(Error::Io)?;
    let header = BinaryHeader::decode(&raw)?;

    if header.bin_type != expected {
        return Err(Error::Validation(format!(
            "{}: type {:?}, expected {:?}",
            path, header.bin_type, expected
        )));
    }
    let image_end = header.payload_offset() as u64 + header.bin_size as u64;
    if header.bin_size == 0 || image_end > part_size as u64 {
        return Err(Error::Validation(format!(
            "{}: image size {} does not fit partition of {}",
            path, header.bin_size, part_size
        )));
    }
    if expected == BinaryType::Elf && header.ram_size == 0 {
        return Err(Error::Validation(format!("{}: zero ram size", path)));
    }

    let mut crc = Crc32::new();
    crc.update(&raw);
    let mut scratch = vec![0u8; scratch_len.max(1)];
    let mut remaining = header.bin_size as usize;
    while remaining > 0 {
        let chunk = remaining.min(scratch.len());
        dev.read_exact(&mut scratch[..chunk]).map_err(Error::Io)?;
        crc.update(&scratch[..chunk]);
        remaining -= chunk;
    }

    let computed = crc.finalize();
    if computed != stored_crc {
        return Err(Error::Validation(format!(
            "{}: crc {:#010x} != stored {:#010x}",
            path, computed, stored_crc
        )));
    }
    Ok(header)
}
