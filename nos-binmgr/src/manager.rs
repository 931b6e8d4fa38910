//! Binary manager assembly
//!
//! [`BinaryManager`] owns the binary table and wires the kernel ports into the
//! components. Partitions are registered first; [`BinaryManager::start`] then
//! adopts the boot parameters, starts the loading thread, the fault sender and
//! the gateway, and queues the initial load of every user binary.

use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use std::thread::JoinHandle;

use log::{error, info, warn};
use nos_api::{Board, FlashDevice, PID_NONE, Pid, ProcessLoader, Scheduler};

use crate::bootparam::BootParamManager;
use crate::callback::{CallbackAck, CallbackMessage, Notifier};
use crate::client::{BinmgrClient, ClientQueues};
use crate::config::BinmgrConfig;
use crate::error::{Error, Result};
use crate::fault::{FaultChannel, FaultHandler, FaultSender, stop_sender};
use crate::gateway::{Command, Gateway, Request, Response};
use crate::ipc::{MessageQueue, NamedQueues, PRIO_NORMAL};
use crate::loader::ImageLoader;
use crate::loading::{LoadingQueue, LoadingRequest, LoadingThread};
use crate::partition::PartitionRegistry;
use crate::recovery::{FrozenTasks, Recovery};
use crate::table::{BinaryTable, SharedTable};
use crate::types::{BinaryState, PartitionType};

/// Kernel services the binary manager depends on
#[derive(Clone)]
pub struct Ports {
    pub flash: Arc<dyn FlashDevice>,
    pub loader: Arc<dyn ProcessLoader>,
    pub sched: Arc<dyn Scheduler>,
    pub board: Arc<dyn Board>,
}

struct Running {
    bootparam: Arc<spin::Mutex<BootParamManager>>,
    fault_channel: Arc<FaultChannel>,
    fault: FaultHandler,
    threads: Vec<JoinHandle<()>>,
}

/// The binary manager subsystem
pub struct BinaryManager {
    config: BinmgrConfig,
    ports: Ports,
    table: SharedTable,
    registry: PartitionRegistry,
    images: Arc<ImageLoader>,
    loading: Arc<LoadingQueue>,
    notifier: Arc<Notifier>,
    recovery: Arc<Recovery>,
    frozen: Arc<FrozenTasks>,
    requests: Arc<MessageQueue<Request>>,
    responses: Arc<NamedQueues<Response>>,
    callbacks: Arc<NamedQueues<CallbackMessage>>,
    acks: Arc<MessageQueue<CallbackAck>>,
    running: Option<Running>,
}

impl BinaryManager {
    /// Create a stopped manager with an empty table
    pub fn new(config: BinmgrConfig, ports: Ports) -> Self {
        let table: SharedTable = Arc::new(spin::Mutex::new(BinaryTable::new(config.max_binaries)));
        let registry =
            PartitionRegistry::new(table.clone(), &config.kernel_version).with_common_name(&config.common_name);
        let images = Arc::new(ImageLoader::new(
            table.clone(),
            ports.flash.clone(),
            ports.loader.clone(),
            ports.sched.clone(),
            &config.device_prefix,
            config.crc_buffer_size,
        ));
        let callbacks = Arc::new(NamedQueues::new());
        let acks = Arc::new(MessageQueue::new(config.callback_queue_depth * config.max_binaries));
        let notifier = Arc::new(Notifier::new(
            table.clone(),
            ports.sched.clone(),
            callbacks.clone(),
            acks.clone(),
            config.callback_ack_timeout,
        ));
        let loading = Arc::new(LoadingQueue::new());
        let frozen = Arc::new(FrozenTasks::new(config.frozen_task_capacity));
        let recovery = Arc::new(Recovery::new(
            table.clone(),
            ports.sched.clone(),
            ports.board.clone(),
            loading.clone(),
            notifier.clone(),
            frozen.clone(),
        ));

        Self {
            requests: Arc::new(MessageQueue::new(config.request_queue_depth)),
            responses: Arc::new(NamedQueues::new()),
            config,
            ports,
            table,
            registry,
            images,
            loading,
            notifier,
            recovery,
            frozen,
            callbacks,
            acks,
            running: None,
        }
    }

    /// Register one partition found in the partition table
    pub fn register_partition(&self, part_num: i32, part_type: PartitionType, name: &str, size: i32) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::InvalidParameter("partitions are fixed once started".to_string()));
        }
        self.registry.register_partition(part_num, part_type, name, size)
    }

    /// Register a partition whose type is given as in the partition table
    pub fn register_partition_str(&self, part_num: i32, part_type: &str, name: &str, size: i32) -> Result<()> {
        let part_type = PartitionType::parse(part_type)
            .ok_or_else(|| Error::InvalidParameter(format!("partition type '{}'", part_type)))?;
        self.register_partition(part_num, part_type, name, size)
    }

    /// Adopt the boot parameters and start the worker threads
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::InvalidParameter("already started".to_string()));
        }

        let (bootparam_path, kernel_banks, bin_count) = {
            let table = self.table.lock();
            let path = match table.bootparam_part {
                Some(part) => Some(self.images.partition_path(part)?),
                None => None,
            };
            (path, table.kernel().bank_count(), table.len())
        };

        let mut bootparam = BootParamManager::new(
            self.ports.flash.clone(),
            bootparam_path,
            self.config.bootparam_slot_size(),
            kernel_banks,
        );
        match bootparam.scan() {
            Ok(record) => {
                self.table.lock().kernel_mut().in_use_bank = record.active_kernel_bank as usize;
            }
            Err(Error::NotFound(msg)) => warn!("binmgr: {} not found, using defaults", msg),
            Err(err) => return Err(err),
        }
        // The kernel is running by the time partitions are known
        self.table.lock().kernel_mut().state = BinaryState::Running;
        let bootparam = Arc::new(spin::Mutex::new(bootparam));

        let fault_channel = Arc::new(FaultChannel::new(bin_count.saturating_sub(1)));
        let fault = FaultHandler::new(
            fault_channel.clone(),
            self.ports.sched.clone(),
            self.ports.board.clone(),
            self.frozen.clone(),
            bin_count,
        );

        let mut threads = Vec::new();
        let started = LoadingThread::new(
            self.loading.clone(),
            self.images.clone(),
            self.table.clone(),
            self.ports.board.clone(),
            self.notifier.clone(),
        )
        .spawn()
        .and_then(|handle| {
            threads.push(handle);
            FaultSender::new(fault_channel.clone(), self.requests.clone()).spawn()
        })
        .and_then(|handle| {
            threads.push(handle);
            Gateway::new(
                self.requests.clone(),
                self.responses.clone(),
                self.table.clone(),
                self.ports.sched.clone(),
                self.images.clone(),
                self.loading.clone(),
                bootparam.clone(),
                self.recovery.clone(),
                self.notifier.clone(),
            )
            .spawn()
        });

        let running = match started {
            Ok(handle) => {
                threads.push(handle);
                Running {
                    bootparam,
                    fault_channel,
                    fault,
                    threads,
                }
            }
            Err(err) => {
                error!("binmgr: start failed: {}", err);
                self.running = Some(Running {
                    bootparam,
                    fault_channel,
                    fault,
                    threads,
                });
                self.shutdown();
                return Err(err);
            }
        };
        self.running = Some(running);

        self.loading.enqueue(LoadingRequest::LoadAll)?;
        info!("binmgr: started with {} binaries", bin_count);
        Ok(())
    }

    /// API handle for task `pid`
    pub fn client(&self, pid: Pid) -> BinmgrClient {
        BinmgrClient::new(
            pid,
            ClientQueues {
                requests: self.requests.clone(),
                responses: self.responses.clone(),
                callbacks: self.callbacks.clone(),
                acks: self.acks.clone(),
                response_depth: self.config.response_queue_depth,
                callback_depth: self.config.callback_queue_depth,
                timeout: self.config.response_timeout,
            },
        )
    }

    /// Fault entry point, available once started
    pub fn fault_handler(&self) -> Option<FaultHandler> {
        self.running.as_ref().map(|r| r.fault.clone())
    }

    /// The binary table
    pub fn table(&self) -> SharedTable {
        self.table.clone()
    }

    /// The boot parameter manager, available once started
    pub fn bootparam(&self) -> Option<Arc<spin::Mutex<BootParamManager>>> {
        self.running.as_ref().map(|r| r.bootparam.clone())
    }

    /// Blocks until the loading thread has nothing to do
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.loading.wait_idle(timeout)
    }

    /// Stops and joins every worker thread
    pub fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.requests.send(
            Request {
                cmd: Command::Shutdown,
                requester: PID_NONE,
            },
            PRIO_NORMAL,
        );
        self.loading.shutdown();
        stop_sender(&running.fault_channel);
        for handle in running.threads {
            if handle.join().is_err() {
                error!("binmgr: worker thread panicked");
            }
        }
        info!("binmgr: stopped");
    }
}

impl Drop for BinaryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
