//! Fault quarantine and recovery
//!
//! A fault first freezes the real-time tasks of every user binary, straight
//! from fault context, and records them in [`FrozenTasks`]. The gateway then
//! runs the full deactivation of the faulted binary (waits cancelled,
//! watchdogs stopped, every task parked on the inactive list, held semaphores
//! returned), queues a reload and releases the frozen tasks of the binaries
//! left untouched. Whenever the system cannot be brought back into a known
//! state the board is reset.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use crossbeam_queue::ArrayQueue;
use log::{error, info, warn};
use nos_api::{Board, Pid, RebootReason, Scheduler, SemId, TaskList, WaitObject};

use crate::callback::Notifier;
use crate::error::{Error, Result};
use crate::loading::{LoadingQueue, LoadingRequest};
use crate::sync::CriticalSection;
use crate::table::SharedTable;
use crate::types::{BinIdx, BinaryKind, BinaryState};

/// Real-time tasks frozen by fault reports and not yet released
pub struct FrozenTasks {
    pids: ArrayQueue<Pid>,
}

impl FrozenTasks {
    pub fn new(capacity: usize) -> Self {
        Self {
            pids: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Number of recorded tasks
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// Moves every runnable real-time task of binary `idx` to the inactive list
///
/// Usable from fault context: takes no table lock and does not allocate.
/// Each moved task is recorded in `frozen`; a full record is `OutOfMemory`
/// after the freeze, since the overflowing tasks could never be released.
pub fn deactivate_realtime(sched: &dyn Scheduler, idx: BinIdx, frozen: &FrozenTasks) -> Result<usize> {
    let mut lost = 0usize;
    let moved = sched.deactivate_realtime(idx, &mut |pid| {
        if frozen.pids.push(pid).is_err() {
            lost += 1;
        }
    })?;
    if lost > 0 {
        return Err(Error::OutOfMemory);
    }
    Ok(moved)
}

/// Drives deactivation and reload of faulted binaries
pub struct Recovery {
    table: SharedTable,
    sched: Arc<dyn Scheduler>,
    board: Arc<dyn Board>,
    loading: Arc<LoadingQueue>,
    notifier: Arc<Notifier>,
    frozen: Arc<FrozenTasks>,
}

impl Recovery {
    pub fn new(
        table: SharedTable,
        sched: Arc<dyn Scheduler>,
        board: Arc<dyn Board>,
        loading: Arc<LoadingQueue>,
        notifier: Arc<Notifier>,
        frozen: Arc<FrozenTasks>,
    ) -> Self {
        Self {
            table,
            sched,
            board,
            loading,
            notifier,
            frozen,
        }
    }

    /// Quarantines every task of binary `idx`
    ///
    /// Marks the binary `Fault`. The shared library owns no tasks of its own,
    /// so for it only the state changes. Each task leaves whatever it was
    /// waiting on, loses its watchdog and is moved to the inactive list, all
    /// inside one critical section. Semaphores still held by those tasks are
    /// released afterwards so that waiters in other binaries can proceed.
    pub fn deactivate(&self, idx: BinIdx) -> Result<()> {
        let kind = {
            let mut table = self.table.lock();
            let kind = table.entry(idx)?.kind;
            if kind == BinaryKind::Kernel {
                return Err(Error::InvalidParameter("kernel cannot be deactivated".into()));
            }
            table.set_state(idx, BinaryState::Fault)?;
            kind
        };
        if kind == BinaryKind::Common {
            return Ok(());
        }

        {
            let _cs = CriticalSection::enter(self.sched.as_ref());
            for task in self.sched.tasks() {
                if !task.is_owned_by(idx) {
                    continue;
                }
                match task.wait {
                    Some(WaitObject::Semaphore(sem)) => self.sched.sem_cancel_wait(sem, task.pid)?,
                    Some(WaitObject::MessageQueue(mq, dir)) => self.sched.mq_cancel_wait(mq, task.pid, dir)?,
                    None => {}
                }
                if let Some(wdog) = task.watchdog {
                    self.sched.wdog_cancel(wdog)?;
                }
                self.sched.move_to_list(task.pid, TaskList::Inactive)?;
            }
        }

        // Includes tasks already frozen from fault context
        let held: Vec<(SemId, Pid)> = self
            .sched
            .tasks()
            .into_iter()
            .filter(|t| t.is_owned_by(idx))
            .flat_map(|t| t.held_sems.into_iter().map(move |sem| (sem, t.pid)))
            .collect();
        for (sem, pid) in held {
            self.sched.sem_release(sem, pid)?;
        }
        info!("binmgr: binary {} deactivated", idx);
        Ok(())
    }

    /// Handles a fault report for binary `idx`
    ///
    /// A faulted shared library takes every user binary down with it and
    /// reloads them all; any other binary is reloaded alone. Once the reload
    /// is queued, frozen real-time tasks of the other binaries run again.
    /// Failure to deactivate or to queue the reload resets the board.
    pub fn recover(&self, idx: BinIdx) -> Result<()> {
        let res = self.try_recover(idx);
        if let Err(err) = &res {
            error!("binmgr: recovery of binary {} failed: {}", idx, err);
            self.board.reset(RebootReason::BinaryRecoveryFail);
        }
        res
    }

    fn try_recover(&self, idx: BinIdx) -> Result<()> {
        let (kind, name, users) = {
            let table = self.table.lock();
            let entry = table.entry(idx)?;
            (entry.kind, entry.name.clone(), table.user_indices())
        };
        warn!("binmgr: fault in '{}' ({:?})", name, kind);

        let (request, quarantined) = match kind {
            BinaryKind::Kernel => {
                return Err(Error::OperationFailed(format!("fault reported for '{}'", name)));
            }
            BinaryKind::Common => {
                for user in users.clone() {
                    self.deactivate(user)?;
                }
                (LoadingRequest::ReloadAll, users)
            }
            BinaryKind::User => {
                self.deactivate(idx)?;
                (LoadingRequest::Reload(name), idx..idx + 1)
            }
        };

        self.notifier.notify(idx, BinaryState::Fault, false);
        self.loading.enqueue(request)?;

        let released = self.release_frozen(&quarantined);
        if released > 0 {
            info!("binmgr: {} frozen real-time tasks released", released);
        }
        Ok(())
    }

    /// Drains the frozen record, putting tasks outside `quarantined` back on
    /// the ready list
    ///
    /// Tasks that exited or were moved elsewhere since the freeze are skipped.
    fn release_frozen(&self, quarantined: &Range<BinIdx>) -> usize {
        let mut released = 0;
        while let Some(pid) = self.frozen.pids.pop() {
            let Some(task) = self.sched.task(pid) else {
                continue;
            };
            let bystander = task.owner.is_some_and(|owner| !quarantined.contains(&owner));
            if !bystander || task.list != TaskList::Inactive {
                continue;
            }
            match self.sched.move_to_list(pid, TaskList::ReadyToRun) {
                Ok(()) => released += 1,
                Err(err) => warn!("binmgr: pid {} stays frozen: {}", pid, err),
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimScheduler;

    #[test]
    fn test_deactivate_realtime_only_touches_runnable_realtime_tasks() {
        let sched = SimScheduler::new();
        let rt = sched.spawn(Some(1), true);
        let normal = sched.spawn(Some(1), false);
        let other = sched.spawn(Some(2), true);

        let frozen = FrozenTasks::new(4);

        assert_eq!(deactivate_realtime(&sched, 1, &frozen).unwrap(), 1);
        assert_eq!(sched.task(rt).unwrap().list, TaskList::Inactive);
        assert_eq!(sched.task(normal).unwrap().list, TaskList::ReadyToRun);
        assert_eq!(sched.task(other).unwrap().list, TaskList::ReadyToRun);
        assert_eq!(frozen.pids.pop(), Some(rt));
        assert!(frozen.is_empty());
    }

    #[test]
    fn test_full_frozen_record_is_out_of_memory() {
        let sched = SimScheduler::new();
        let first = sched.spawn(Some(1), true);
        let second = sched.spawn(Some(1), true);
        let frozen = FrozenTasks::new(1);

        assert_eq!(deactivate_realtime(&sched, 1, &frozen), Err(Error::OutOfMemory));
        // Both are frozen, only one can be released later
        assert_eq!(sched.task(first).unwrap().list, TaskList::Inactive);
        assert_eq!(sched.task(second).unwrap().list, TaskList::Inactive);
        assert_eq!(frozen.len(), 1);
    }
}
