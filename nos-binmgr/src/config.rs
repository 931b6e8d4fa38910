//! Binary manager configuration

use std::time::Duration;

/// Default prefix of partition device nodes
pub const DEFAULT_DEVICE_PREFIX: &str = "/dev/mtdblock";
/// Default name of the shared library binary
pub const DEFAULT_COMMON_NAME: &str = "common";
/// Default number of binary table slots, kernel included
pub const DEFAULT_MAX_BINARIES: usize = 8;
/// Default boot parameter partition size (two slots)
pub const DEFAULT_BOOTPARAM_SIZE: u32 = 8192;
/// Default CRC scratch buffer size
pub const DEFAULT_CRC_BUFFER_SIZE: usize = 512;
/// Default number of real-time tasks a fault may freeze
pub const DEFAULT_FROZEN_TASK_CAPACITY: usize = 64;

/// Binary manager configuration
#[derive(Debug, Clone)]
pub struct BinmgrConfig {
    /// Prefix of partition device paths, the partition number is appended
    pub device_prefix: String,
    /// Kernel version stamped on the kernel entry at registration
    pub kernel_version: String,
    /// Name of the shared library binary
    pub common_name: String,
    /// Binary table capacity, kernel slot included
    pub max_binaries: usize,
    /// Size of the boot parameter area, split in two slots
    pub bootparam_size: u32,
    /// Scratch buffer used while streaming an image through the CRC
    pub crc_buffer_size: usize,
    /// Depth of the shared request queue
    pub request_queue_depth: usize,
    /// Depth of each per-requester response queue
    pub response_queue_depth: usize,
    /// Depth of each subscriber callback queue
    pub callback_queue_depth: usize,
    /// How long a synchronous notification waits for each acknowledgment
    pub callback_ack_timeout: Duration,
    /// How long a client waits for its response
    pub response_timeout: Duration,
    /// Real-time tasks a fault report can freeze before the board is reset
    pub frozen_task_capacity: usize,
}

impl Default for BinmgrConfig {
    fn default() -> Self {
        Self {
            device_prefix: DEFAULT_DEVICE_PREFIX.to_string(),
            kernel_version: env!("CARGO_PKG_VERSION").to_string(),
            common_name: DEFAULT_COMMON_NAME.to_string(),
            max_binaries: DEFAULT_MAX_BINARIES,
            bootparam_size: DEFAULT_BOOTPARAM_SIZE,
            crc_buffer_size: DEFAULT_CRC_BUFFER_SIZE,
            request_queue_depth: 16,
            response_queue_depth: 4,
            callback_queue_depth: 8,
            callback_ack_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_secs(5),
            frozen_task_capacity: DEFAULT_FROZEN_TASK_CAPACITY,
        }
    }
}

impl BinmgrConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device path prefix
    pub fn with_device_prefix(mut self, prefix: &str) -> Self {
        self.device_prefix = prefix.to_string();
        self
    }

    /// Set the kernel version
    pub fn with_kernel_version(mut self, version: &str) -> Self {
        self.kernel_version = version.to_string();
        self
    }

    /// Set the shared library binary name
    pub fn with_common_name(mut self, name: &str) -> Self {
        self.common_name = name.to_string();
        self
    }

    /// Set the binary table capacity
    pub fn with_max_binaries(mut self, max: usize) -> Self {
        self.max_binaries = max;
        self
    }

    /// Set the boot parameter area size
    pub fn with_bootparam_size(mut self, size: u32) -> Self {
        self.bootparam_size = size;
        self
    }

    /// Set the CRC scratch buffer size
    pub fn with_crc_buffer_size(mut self, size: usize) -> Self {
        self.crc_buffer_size = size.max(1);
        self
    }

    /// Set the synchronous notification acknowledgment timeout
    pub fn with_callback_ack_timeout(mut self, timeout: Duration) -> Self {
        self.callback_ack_timeout = timeout;
        self
    }

    /// Set the client response timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the capacity of the frozen real-time task record
    pub fn with_frozen_task_capacity(mut self, capacity: usize) -> Self {
        self.frozen_task_capacity = capacity.max(1);
        self
    }

    /// Size of one boot parameter slot
    pub fn bootparam_slot_size(&self) -> u32 {
        self.bootparam_size / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BinmgrConfig::default();
        assert_eq!(config.device_prefix, "/dev/mtdblock");
        assert_eq!(config.max_binaries, 8);
        assert_eq!(config.bootparam_slot_size(), 4096);
        assert_eq!(config.frozen_task_capacity, 64);
    }

    #[test]
    fn test_builder() {
        let config = BinmgrConfig::new()
            .with_common_name("libc")
            .with_bootparam_size(2048)
            .with_crc_buffer_size(0)
            .with_frozen_task_capacity(0);
        assert_eq!(config.common_name, "libc");
        assert_eq!(config.bootparam_slot_size(), 1024);
        assert_eq!(config.crc_buffer_size, 1);
        assert_eq!(config.frozen_task_capacity, 1);
    }
}
