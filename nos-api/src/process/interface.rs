//! Process management interface

use alloc::vec::Vec;

use crate::core::types::{IrqState, MqId, Pid, SemId, Signo, WdogId};
use crate::error::KernelResult;
use crate::process::types::{LoadRequest, MqWait, TaskInfo, TaskList};

/// Trait for the process loader that maps an image into a new task
pub trait ProcessLoader: Send + Sync {
    /// Loads the image described by `req` and returns the main task pid
    fn load_binary(&self, req: &LoadRequest<'_>) -> KernelResult<Pid>;
}

/// Trait for the scheduler operations a kernel subsystem may use
///
/// Every method acts on the live task-control-block arena. Callers that need
/// several operations to be atomic wrap them in `enter_critical_section` /
/// `leave_critical_section`.
pub trait Scheduler: Send + Sync {
    /// Snapshots every task in the system
    fn tasks(&self) -> Vec<TaskInfo>;

    /// Snapshots one task
    fn task(&self, pid: Pid) -> Option<TaskInfo> {
        self.tasks().into_iter().find(|t| t.pid == pid)
    }

    /// Disables preemption
    fn sched_lock(&self);

    /// Re-enables preemption
    fn sched_unlock(&self);

    /// Disables interrupts and returns the previous state
    fn enter_critical_section(&self) -> IrqState;

    /// Restores the interrupt state
    fn leave_critical_section(&self, state: IrqState);

    /// Moves every runnable real-time task of binary `owner` to the inactive list
    ///
    /// Callable from fault context, so implementations must not allocate or
    /// block. `frozen` is told each pid moved; the count is returned.
    fn deactivate_realtime(&self, owner: usize, frozen: &mut dyn FnMut(Pid)) -> KernelResult<usize>;

    /// Moves a task control block onto another scheduler list
    fn move_to_list(&self, pid: Pid, list: TaskList) -> KernelResult<()>;

    /// Cancels a pending semaphore wait, restoring the count
    fn sem_cancel_wait(&self, sem: SemId, pid: Pid) -> KernelResult<()>;

    /// Releases a semaphore on behalf of a holder that can no longer run
    fn sem_release(&self, sem: SemId, holder: Pid) -> KernelResult<()>;

    /// Drops a task from a message queue wait counter
    fn mq_cancel_wait(&self, mq: MqId, pid: Pid, wait: MqWait) -> KernelResult<()>;

    /// Cancels a watchdog timer
    fn wdog_cancel(&self, wdog: WdogId) -> KernelResult<()>;

    /// Terminates a task and waits for it to be reaped
    fn terminate(&self, pid: Pid) -> KernelResult<()>;

    /// Raises a signal on a task
    fn signal(&self, pid: Pid, signo: Signo) -> KernelResult<()>;
}
