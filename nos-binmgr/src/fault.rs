//! Fault reporting
//!
//! [`FaultHandler::notify_fault`] runs in fault context: it may not allocate,
//! block or take the table lock. Frozen tasks go into a preallocated
//! [`FrozenTasks`] record, messages come from a pool filled once at start and
//! travel over a lock-free queue, and the fault sender thread is woken with
//! `unpark`. The sender turns each message into a highest-priority gateway
//! request.

use alloc::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, Thread};

use crossbeam_queue::ArrayQueue;
use log::{error, info};
use nos_api::{Board, PID_NONE, RebootReason, Scheduler};

use crate::error::{Error, Result};
use crate::gateway::{Command, Request};
use crate::ipc::{MessageQueue, PRIO_FAULT};
use crate::recovery::{FrozenTasks, deactivate_realtime};
use crate::types::BinIdx;

/// One fault report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultMessage {
    /// Faulting binary
    pub bin_idx: BinIdx,
}

/// Preallocated fault messages and the sender's wake-up handle
pub struct FaultChannel {
    free: ArrayQueue<FaultMessage>,
    used: ArrayQueue<FaultMessage>,
    sender: spin::Once<Thread>,
    stop: AtomicBool,
}

impl FaultChannel {
    /// Create a pool of `capacity` messages
    pub fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity.max(1));
        let used = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity {
            let _ = free.push(FaultMessage::default());
        }
        Self {
            free,
            used,
            sender: spin::Once::new(),
            stop: AtomicBool::new(false),
        }
    }

    /// Messages available to fault context
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Messages waiting for the sender
    pub fn pending(&self) -> usize {
        self.used.len()
    }

    fn wake(&self) {
        if let Some(sender) = self.sender.get() {
            sender.unpark();
        }
    }
}

/// Entry point for fault context
#[derive(Clone)]
pub struct FaultHandler {
    channel: Arc<FaultChannel>,
    sched: Arc<dyn Scheduler>,
    board: Arc<dyn Board>,
    frozen: Arc<FrozenTasks>,
    bin_count: usize,
}

impl FaultHandler {
    /// `bin_count` is the table length, fixed once partitions are registered
    pub fn new(
        channel: Arc<FaultChannel>,
        sched: Arc<dyn Scheduler>,
        board: Arc<dyn Board>,
        frozen: Arc<FrozenTasks>,
        bin_count: usize,
    ) -> Self {
        Self {
            channel,
            sched,
            board,
            frozen,
            bin_count,
        }
    }

    /// Reports a fault in binary `bin_idx`
    ///
    /// Real-time tasks of every user binary are frozen first so that nothing
    /// time-critical keeps running on possibly corrupted shared state; the
    /// recovery releases those of unaffected binaries. Without room to record
    /// a frozen task, a free message or a running sender the board is reset.
    pub fn notify_fault(&self, bin_idx: BinIdx) {
        for idx in 1..self.bin_count {
            match deactivate_realtime(self.sched.as_ref(), idx, &self.frozen) {
                Ok(_) => {}
                Err(Error::OutOfMemory) => {
                    error!("binmgr: frozen task record full on fault in binary {}", bin_idx);
                    self.board.reset(RebootReason::BinaryRecoveryFail);
                    return;
                }
                Err(err) => error!("binmgr: freeze of binary {} failed: {}", idx, err),
            }
        }

        if self.channel.sender.get().is_none() {
            error!("binmgr: fault in binary {} before the fault sender runs", bin_idx);
            self.board.reset(RebootReason::BinaryRecoveryFail);
            return;
        }
        let Some(mut msg) = self.channel.free.pop() else {
            error!("binmgr: no fault message left for binary {}", bin_idx);
            self.board.reset(RebootReason::BinaryRecoveryFail);
            return;
        };
        msg.bin_idx = bin_idx;
        if self.channel.used.push(msg).is_err() {
            self.board.reset(RebootReason::BinaryRecoveryFail);
            return;
        }
        self.channel.wake();
    }
}

/// Body of the fault sender thread
pub struct FaultSender {
    channel: Arc<FaultChannel>,
    requests: Arc<MessageQueue<Request>>,
}

impl FaultSender {
    pub fn new(channel: Arc<FaultChannel>, requests: Arc<MessageQueue<Request>>) -> Self {
        Self { channel, requests }
    }

    /// Start the thread
    ///
    /// Fault reports are accepted as soon as this returns.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let channel = self.channel.clone();
        let handle = thread::Builder::new()
            .name("binmgr_faultsend".into())
            .spawn(move || self.run())
            .map_err(|err| Error::OperationFailed(alloc::format!("spawn fault sender: {}", err)))?;
        channel.sender.call_once(|| handle.thread().clone());
        Ok(handle)
    }

    fn run(&self) {
        info!("binmgr: fault sender started");
        loop {
            while let Some(msg) = self.channel.used.pop() {
                self.requests.send(
                    Request {
                        cmd: Command::Fault { bin_idx: msg.bin_idx },
                        requester: PID_NONE,
                    },
                    PRIO_FAULT,
                );
                let _ = self.channel.free.push(FaultMessage::default());
            }
            if self.channel.stop.load(Ordering::Acquire) {
                break;
            }
            thread::park();
        }
        info!("binmgr: fault sender stopped");
    }
}

/// Stops the fault sender once the pending messages are forwarded
pub fn stop_sender(channel: &FaultChannel) {
    channel.stop.store(true, Ordering::Release);
    channel.wake();
}
