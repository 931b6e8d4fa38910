//! NOS Binary Manager
//!
//! Kernel subsystem that owns every loadable binary on the device: the kernel
//! image, the user applications and the shared library binary they link
//! against. Each binary lives in up to two flash partitions (A/B banks).
//!
//! # Architecture
//!
//! - **Partition registry**: builds the binary table from the partition table
//! - **Image loader**: validates bank headers, picks the newest bank, starts
//!   and kills processes
//! - **Loading thread**: serializes every load, reload and kill
//! - **Boot parameters**: dual-slot, CRC-protected record read by the
//!   bootloader; updates only ever overwrite the non-authoritative slot
//! - **Recovery**: quarantines a faulted binary and reloads it, or resets
//!   the board when that is impossible
//! - **Gateway**: single request/response endpoint for user tasks
//! - **Callbacks**: lifecycle notifications to subscribed tasks
//!
//! The kernel services it depends on are reached through the `nos-api` ports
//! ([`FlashDevice`](nos_api::FlashDevice), [`ProcessLoader`](nos_api::ProcessLoader),
//! [`Scheduler`](nos_api::Scheduler), [`Board`](nos_api::Board)).
//!
//! # Usage
//!
//! The host doubles in `testing` are built for unit tests and with the
//! `testing` feature.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nos_binmgr::testing::{MemFlash, SimBoard, SimLoader, SimScheduler};
//! use nos_binmgr::{BinaryManager, BinmgrConfig, PartitionType, Ports};
//!
//! let sched = SimScheduler::new();
//! let ports = Ports {
//!     flash: Arc::new(MemFlash::new()),
//!     loader: Arc::new(SimLoader::new(sched.clone())),
//!     sched: Arc::new(sched),
//!     board: Arc::new(SimBoard::new()),
//! };
//! let mut binmgr = BinaryManager::new(BinmgrConfig::default(), ports);
//! binmgr.register_partition(1, PartitionType::Kernel, "kernel", 0x10000).unwrap();
//! binmgr.register_partition(4, PartitionType::App, "app1", 0x8000).unwrap();
//! binmgr.start().unwrap();
//!
//! let client = binmgr.client(200);
//! let info = client.get_info("app1");
//! ```

extern crate alloc;

pub mod bootparam;
pub mod callback;
pub mod client;
pub mod config;
pub mod crc;
pub mod error;
pub mod fault;
pub mod gateway;
pub mod header;
pub mod ipc;
pub mod loader;
pub mod loading;
pub mod manager;
pub mod partition;
pub mod recovery;
pub mod sync;
pub mod table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use bootparam::{BootParamManager, BootParamRecord};
pub use callback::{CallbackMessage, NotifyReport};
pub use client::BinmgrClient;
pub use config::BinmgrConfig;
pub use error::{Error, Result, ResultCode};
pub use fault::FaultHandler;
pub use gateway::{BinaryInfo, Command, Payload, Request, Response};
pub use header::BinaryHeader;
pub use loading::LoadingRequest;
pub use manager::{BinaryManager, Ports};
pub use types::{BinaryGroup, BinaryKind, BinaryState, BinaryType, PartitionType};
