//! State-change callbacks
//!
//! Tasks subscribe to lifecycle changes of *other* binaries. A notification is
//! a [`CallbackMessage`] on the subscriber's `binmgr_cb_<pid>` queue followed
//! by `SIGBM`. Synchronous notifications then wait, with a bounded timeout
//! per subscriber, for acknowledgments on the shared ack queue.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use log::{debug, warn};
use nos_api::{Pid, SIGBM, Scheduler};

use crate::error::{Error, Result};
use crate::ipc::{MessageQueue, NamedQueues, PRIO_NORMAL, callback_queue_name};
use crate::table::{CallbackSubscription, SharedTable};
use crate::types::{BinIdx, BinName, BinaryState, KERNEL_BIN_IDX};

/// Delivered to subscribers on a state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackMessage {
    /// Binary whose state changed
    pub bin_name: BinName,
    /// New state
    pub state: BinaryState,
    /// Token given at registration
    pub token: usize,
    /// Set when the sender waits for [`CallbackAck`]
    pub needs_ack: bool,
}

/// Acknowledgment of a synchronous notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackAck {
    /// Acknowledging task
    pub pid: Pid,
}

/// Outcome of one notification round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Subscribers that were queued and signalled
    pub sent: usize,
    /// Acknowledgments received
    pub acked: usize,
    /// Subscribers that could not be reached or did not acknowledge
    pub failed: usize,
}

/// Subscription bookkeeping and delivery
pub struct Notifier {
    table: SharedTable,
    sched: Arc<dyn Scheduler>,
    queues: Arc<NamedQueues<CallbackMessage>>,
    acks: Arc<MessageQueue<CallbackAck>>,
    ack_timeout: Duration,
}

impl Notifier {
    pub fn new(
        table: SharedTable,
        sched: Arc<dyn Scheduler>,
        queues: Arc<NamedQueues<CallbackMessage>>,
        acks: Arc<MessageQueue<CallbackAck>>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            table,
            sched,
            queues,
            acks,
            ack_timeout,
        }
    }

    fn owner_of(&self, pid: Pid) -> Result<BinIdx> {
        let task = self
            .sched
            .task(pid)
            .ok_or_else(|| Error::InvalidParameter(format!("no task {}", pid)))?;
        Ok(task.owner.unwrap_or(KERNEL_BIN_IDX))
    }

    /// Subscribe `pid` to state changes of every other binary
    ///
    /// The subscription is filed under the binary owning `pid`. A second
    /// registration by the same task fails and keeps the first one.
    pub fn register(&self, pid: Pid, token: usize) -> Result<()> {
        let owner = self.owner_of(pid)?;
        let mut table = self.table.lock();
        if table.iter().any(|e| e.subscribers.iter().any(|s| s.pid == pid)) {
            return Err(Error::AlreadyRegistered);
        }
        let entry = table.entry_mut(owner)?;
        entry.subscribers.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        entry.subscribers.push(CallbackSubscription { pid, token });
        debug!("binmgr: pid {} subscribed under '{}'", pid, entry.name);
        Ok(())
    }

    /// Remove the subscription of `pid`, returning whether one existed
    pub fn unregister(&self, pid: Pid) -> Result<bool> {
        let mut table = self.table.lock();
        let mut removed = false;
        for idx in 0..table.len() {
            let entry = table.entry_mut(idx)?;
            let before = entry.subscribers.len();
            entry.subscribers.retain(|s| s.pid != pid);
            removed |= entry.subscribers.len() != before;
        }
        Ok(removed)
    }

    /// Tell every subscriber outside binary `source` about its new state
    ///
    /// Failures are counted, never propagated: a notification must not stop
    /// the lifecycle change it reports.
    pub fn notify(&self, source: BinIdx, state: BinaryState, sync: bool) -> NotifyReport {
        let (bin_name, targets) = {
            let table = self.table.lock();
            let Some(entry) = table.get(source) else {
                return NotifyReport::default();
            };
            let targets: Vec<CallbackSubscription> = table
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != source)
                .flat_map(|(_, e)| e.subscribers.iter().copied())
                .collect();
            (entry.name.clone(), targets)
        };

        // Late acks from an earlier round must not count for this one
        while self.acks.try_receive().is_some() {}

        let total = targets.len();
        let mut report = NotifyReport::default();
        for sub in targets {
            let Some(queue) = self.queues.open(&callback_queue_name(sub.pid)) else {
                report.failed += 1;
                continue;
            };
            let msg = CallbackMessage {
                bin_name: bin_name.clone(),
                state,
                token: sub.token,
                needs_ack: sync,
            };
            if queue.try_send(msg, PRIO_NORMAL).is_err() || self.sched.signal(sub.pid, SIGBM).is_err() {
                report.failed += 1;
                continue;
            }
            report.sent += 1;
        }

        if sync {
            while report.acked < report.sent {
                if self.acks.receive_timeout(self.ack_timeout).is_none() {
                    break;
                }
                report.acked += 1;
            }
            report.failed += report.sent - report.acked;
        }

        if report.failed > 0 {
            warn!(
                "binmgr: '{}' {:?}: {} of {} subscribers not reached",
                bin_name, state, report.failed, total
            );
        }
        report
    }
}
