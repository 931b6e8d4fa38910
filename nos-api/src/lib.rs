//! NOS API - Kernel port interfaces and types shared by NOS subsystems
//!
//! This crate provides the narrow interfaces through which kernel-resident
//! subsystems reach the parts of the kernel they do not own. The binary
//! manager, for example, needs to read flash partitions, ask the process
//! loader to instantiate an image, walk the scheduler's task lists and reset
//! the board, but it implements none of these itself.
//!
//! # Architecture
//!
//! The API is organized into a few small modules:
//!
//! - **Core**: Fundamental identifier types and signal numbers
//! - **Error**: The kernel-level error type returned by every port
//! - **Flash**: Seekable partition handles addressed by device path
//! - **Process**: Process loader and scheduler ports, task snapshots
//! - **Board**: Board reset with a recorded reboot reason
//!
//! # Design Principles
//!
//! - **Dependency Inversion**: Subsystems depend on these traits, the kernel
//!   (or a test double) provides the implementation
//! - **Interface Segregation**: One trait per collaborator
//!
//! # Usage
//!
//! ```rust
//! use nos_api::board::{Board, RebootReason};
//!
//! struct Halt;
//!
//! impl Board for Halt {
//!     fn reset(&self, reason: RebootReason) {
//!         let _ = reason.code();
//!     }
//! }
//!
//! Halt.reset(RebootReason::BinaryRecoveryFail);
//! ```

#![no_std]

extern crate alloc;

// Core modules
pub mod core;
pub mod error;
pub mod flash;
pub mod process;
pub mod board;

// Re-export commonly used types
pub use crate::core::types::*;
pub use crate::error::{KernelError, KernelResult};
pub use crate::flash::{FlashDevice, OpenFlags, PartitionHandle};
pub use crate::process::{LoadRequest, MqWait, ProcessLoader, Scheduler, TaskInfo, TaskList, WaitObject};
pub use crate::board::{Board, RebootReason};
