//! Flash partition interface
//!
//! Partitions are addressed by a device path such as `/dev/mtdblock3`. The
//! binary manager only ever needs a seekable byte stream over one partition.

use alloc::boxed::Box;
use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Access mode requested when opening a partition
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading
        const READ = 0x1;
        /// Open for writing
        const WRITE = 0x2;
        /// Open for reading and writing
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Open handle onto one partition
pub trait PartitionHandle: Send {
    /// Moves the cursor to an absolute byte offset
    fn seek(&mut self, offset: u64) -> KernelResult<()>;

    /// Reads up to `buf.len()` bytes, returning how many were read
    fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize>;

    /// Writes up to `buf.len()` bytes, returning how many were written
    fn write(&mut self, buf: &[u8]) -> KernelResult<usize>;

    /// Reads exactly `buf.len()` bytes
    fn read_exact(&mut self, buf: &mut [u8]) -> KernelResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(KernelError::UnexpectedEof),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Writes the whole buffer
    fn write_all(&mut self, buf: &[u8]) -> KernelResult<()> {
        let mut written = 0;
        while written < buf.len() {
            match self.write(&buf[written..])? {
                0 => return Err(KernelError::UnexpectedEof),
                n => written += n,
            }
        }
        Ok(())
    }
}

/// Block device layer exposing partitions by path
pub trait FlashDevice: Send + Sync {
    /// Opens the partition node at `path`
    fn open(&self, path: &str, flags: OpenFlags) -> KernelResult<Box<dyn PartitionHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    /// Hands out at most three bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
    }

    impl PartitionHandle for Trickle {
        fn seek(&mut self, offset: u64) -> KernelResult<()> {
            self.pos = offset as usize;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
            let n = buf.len().min(3).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
            let n = buf.len().min(3).min(self.data.len() - self.pos);
            self.data[self.pos..self.pos + n].copy_from_slice(&buf[..n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_exact_spans_short_reads() {
        let mut part = Trickle {
            data: (0..10).collect(),
            pos: 2,
        };
        let mut buf = [0u8; 7];
        part.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(part.read_exact(&mut buf), Err(KernelError::UnexpectedEof));
    }

    #[test]
    fn test_write_all_stops_at_partition_end() {
        let mut part = Trickle {
            data: vec![0xFF; 8],
            pos: 0,
        };
        part.write_all(&[1; 8]).unwrap();
        assert_eq!(part.data, vec![1; 8]);
        part.seek(4).unwrap();
        assert_eq!(part.write_all(&[2; 5]), Err(KernelError::UnexpectedEof));
    }
}
