//! Process management types

use alloc::vec::Vec;

use crate::core::types::{MqId, Pid, SemId, WdogId};

/// Scheduler list a task control block currently sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskList {
    /// Ready to run, not currently executing
    ReadyToRun,
    /// Currently executing
    Running,
    /// Blocked behind a scheduler lock
    Pending,
    /// Waiting on a semaphore
    WaitSem,
    /// Waiting for a signal
    WaitSig,
    /// Waiting for a message queue to become non-empty
    WaitMqNotEmpty,
    /// Waiting for a message queue to become non-full
    WaitMqNotFull,
    /// Removed from scheduling
    Inactive,
}

impl TaskList {
    /// Returns true for the lists the scheduler picks tasks from
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskList::ReadyToRun | TaskList::Running | TaskList::Pending)
    }
}

/// Direction of a message queue wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqWait {
    /// Receiver waiting for a message
    NotEmpty,
    /// Sender waiting for room
    NotFull,
}

/// Kernel object a task is blocked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    /// Pending `sem_wait`
    Semaphore(SemId),
    /// Pending `mq_send`/`mq_receive`
    MessageQueue(MqId, MqWait),
}

/// Snapshot of one task control block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task identifier
    pub pid: Pid,
    /// Index of the binary the task belongs to, `None` for kernel threads
    pub owner: Option<usize>,
    /// Scheduling priority
    pub priority: u8,
    /// Real-time priority class
    pub realtime: bool,
    /// Current scheduler list
    pub list: TaskList,
    /// Object the task is blocked on, if any
    pub wait: Option<WaitObject>,
    /// Armed watchdog timer, if any
    pub watchdog: Option<WdogId>,
    /// Semaphores currently held by the task
    pub held_sems: Vec<SemId>,
}

impl TaskInfo {
    /// Returns true if the task belongs to binary `bin_idx`
    pub fn is_owned_by(&self, bin_idx: usize) -> bool {
        self.owner == Some(bin_idx)
    }
}

/// Parameters handed to the process loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRequest<'a> {
    /// Device path of the partition holding the image
    pub path: &'a str,
    /// Binary table index the new process will belong to
    pub bin_idx: usize,
    /// Image payload size in bytes
    pub size: u32,
    /// Byte offset of the payload within the partition
    pub offset: u32,
    /// RAM the process needs
    pub ram_size: u32,
}
