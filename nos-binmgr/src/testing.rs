//! Host implementations of the kernel ports
//!
//! [`MemFlash`], [`SimScheduler`], [`SimLoader`] and [`SimBoard`] stand in for
//! the block device layer, the scheduler, the ELF loader and the board so the
//! binary manager can run as ordinary threads. Each one records what was asked
//! of it and can be told to fail.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::thread;

use hashbrown::{HashMap, HashSet};
use nos_api::{
    Board, FlashDevice, IrqState, KernelError, KernelResult, LoadRequest, MqId, MqWait, OpenFlags,
    PartitionHandle, Pid, ProcessLoader, RebootReason, Scheduler, SemId, Signo, TaskInfo, TaskList,
    WaitObject, WdogId,
};

// ============================================================================
// Flash
// ============================================================================

/// One write that reached flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub path: String,
    pub offset: u64,
    pub len: usize,
}

#[derive(Default)]
struct FlashState {
    parts: HashMap<String, Vec<u8>>,
    writes: Vec<WriteRecord>,
    write_budget: Option<usize>,
}

/// RAM-backed partitions addressed by device path
#[derive(Clone, Default)]
pub struct MemFlash {
    state: Arc<spin::Mutex<FlashState>>,
}

impl MemFlash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an erased partition
    pub fn add_partition(&self, path: &str, size: usize) {
        self.state.lock().parts.insert(path.to_string(), vec![0xFF; size]);
    }

    /// Place bytes without going through a handle or the write log
    pub fn program(&self, path: &str, offset: usize, bytes: &[u8]) {
        let mut state = self.state.lock();
        if let Some(part) = state.parts.get_mut(path) {
            part[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Copy out a range
    pub fn read_at(&self, path: &str, offset: usize, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        state
            .parts
            .get(path)
            .map(|p| p[offset..offset + len].to_vec())
            .unwrap_or_default()
    }

    /// Writes issued through partition handles
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    /// Simulate power loss: after `bytes` more bytes every write fails
    pub fn fail_writes_after(&self, bytes: usize) {
        self.state.lock().write_budget = Some(bytes);
    }

    /// Power restored
    pub fn clear_faults(&self) {
        self.state.lock().write_budget = None;
    }
}

struct MemPartition {
    state: Arc<spin::Mutex<FlashState>>,
    path: String,
    pos: u64,
    flags: OpenFlags,
}

impl PartitionHandle for MemPartition {
    fn seek(&mut self, offset: u64) -> KernelResult<()> {
        let state = self.state.lock();
        let len = state.parts.get(&self.path).map_or(0, |p| p.len()) as u64;
        if offset > len {
            return Err(KernelError::InvalidArgument);
        }
        self.pos = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(KernelError::InvalidArgument);
        }
        let state = self.state.lock();
        let part = state.parts.get(&self.path).ok_or(KernelError::NotFound)?;
        let start = (self.pos as usize).min(part.len());
        let n = buf.len().min(part.len() - start);
        buf[..n].copy_from_slice(&part[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(KernelError::InvalidArgument);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let allowed = match state.write_budget {
            Some(0) => return Err(KernelError::IoError),
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        let part = state.parts.get_mut(&self.path).ok_or(KernelError::NotFound)?;
        let start = self.pos as usize;
        let n = allowed.min(part.len().saturating_sub(start));
        part[start..start + n].copy_from_slice(&buf[..n]);
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= n;
        }
        state.writes.push(WriteRecord {
            path: self.path.clone(),
            offset: self.pos,
            len: n,
        });
        self.pos += n as u64;
        Ok(n)
    }
}

impl FlashDevice for MemFlash {
    fn open(&self, path: &str, flags: OpenFlags) -> KernelResult<Box<dyn PartitionHandle>> {
        if !self.state.lock().parts.contains_key(path) {
            return Err(KernelError::NotFound);
        }
        Ok(Box::new(MemPartition {
            state: self.state.clone(),
            path: path.to_string(),
            pos: 0,
            flags,
        }))
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Semaphore as seen by the simulated scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimSem {
    /// Negative values count waiters
    pub count: i32,
    pub waiters: VecDeque<Pid>,
}

#[derive(Default)]
struct SchedState {
    tasks: Vec<TaskInfo>,
    next_pid: Pid,
    sems: HashMap<SemId, SimSem>,
    mq_waiters: HashMap<(MqId, bool), u32>,
    wdogs: HashSet<WdogId>,
    signals: Vec<(Pid, Signo)>,
    terminated: Vec<Pid>,
    fail_terminate: HashSet<Pid>,
    lock_depth: i32,
    irq_depth: u32,
}

impl SchedState {
    fn task_mut(&mut self, pid: Pid) -> KernelResult<&mut TaskInfo> {
        self.tasks.iter_mut().find(|t| t.pid == pid).ok_or(KernelError::NoProcess)
    }
}

/// Task arena with just enough scheduling semantics for recovery
#[derive(Clone, Default)]
pub struct SimScheduler {
    state: Arc<spin::Mutex<SchedState>>,
}

impl SimScheduler {
    pub fn new() -> Self {
        let sched = Self::default();
        sched.state.lock().next_pid = 100;
        sched
    }

    /// Add a ready task owned by binary `owner`
    pub fn spawn(&self, owner: Option<usize>, realtime: bool) -> Pid {
        let mut state = self.state.lock();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.tasks.push(TaskInfo {
            pid,
            owner,
            priority: if realtime { 200 } else { 100 },
            realtime,
            list: TaskList::ReadyToRun,
            wait: None,
            watchdog: None,
            held_sems: Vec::new(),
        });
        pid
    }

    /// Create a semaphore with an initial count
    pub fn create_sem(&self, sem: SemId, count: i32) {
        self.state.lock().sems.insert(
            sem,
            SimSem {
                count,
                waiters: VecDeque::new(),
            },
        );
    }

    /// `sem_wait` by `pid`: takes the semaphore or blocks on it
    pub fn sem_take(&self, pid: Pid, sem: SemId) -> bool {
        let mut state = self.state.lock();
        let Some(s) = state.sems.get_mut(&sem) else {
            return false;
        };
        s.count -= 1;
        let acquired = s.count >= 0;
        if !acquired {
            s.waiters.push_back(pid);
        }
        if let Ok(task) = state.task_mut(pid) {
            if acquired {
                task.held_sems.push(sem);
            } else {
                task.list = TaskList::WaitSem;
                task.wait = Some(WaitObject::Semaphore(sem));
            }
        }
        acquired
    }

    /// Block `pid` on a message queue
    pub fn mq_block(&self, pid: Pid, mq: MqId, dir: MqWait) {
        let mut state = self.state.lock();
        *state.mq_waiters.entry((mq, dir == MqWait::NotEmpty)).or_insert(0) += 1;
        if let Ok(task) = state.task_mut(pid) {
            task.list = match dir {
                MqWait::NotEmpty => TaskList::WaitMqNotEmpty,
                MqWait::NotFull => TaskList::WaitMqNotFull,
            };
            task.wait = Some(WaitObject::MessageQueue(mq, dir));
        }
    }

    /// Arm watchdog `wdog` for `pid`
    pub fn arm_wdog(&self, pid: Pid, wdog: WdogId) {
        let mut state = self.state.lock();
        state.wdogs.insert(wdog);
        if let Ok(task) = state.task_mut(pid) {
            task.watchdog = Some(wdog);
        }
    }

    /// Make `terminate(pid)` fail
    pub fn fail_terminate(&self, pid: Pid) {
        self.state.lock().fail_terminate.insert(pid);
    }

    pub fn sem(&self, sem: SemId) -> Option<SimSem> {
        self.state.lock().sems.get(&sem).cloned()
    }

    pub fn mq_waiters(&self, mq: MqId, dir: MqWait) -> u32 {
        self.state
            .lock()
            .mq_waiters
            .get(&(mq, dir == MqWait::NotEmpty))
            .copied()
            .unwrap_or(0)
    }

    pub fn wdog_armed(&self, wdog: WdogId) -> bool {
        self.state.lock().wdogs.contains(&wdog)
    }

    pub fn signals(&self) -> Vec<(Pid, Signo)> {
        self.state.lock().signals.clone()
    }

    pub fn terminated(&self) -> Vec<Pid> {
        self.state.lock().terminated.clone()
    }

    /// Tasks owned by binary `idx`
    pub fn tasks_of(&self, idx: usize) -> Vec<TaskInfo> {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|t| t.is_owned_by(idx))
            .cloned()
            .collect()
    }

    /// True when every lock and critical section was left again
    pub fn balanced(&self) -> bool {
        let state = self.state.lock();
        state.lock_depth == 0 && state.irq_depth == 0
    }
}

impl Scheduler for SimScheduler {
    fn tasks(&self) -> Vec<TaskInfo> {
        self.state.lock().tasks.clone()
    }

    fn sched_lock(&self) {
        self.state.lock().lock_depth += 1;
    }

    fn sched_unlock(&self) {
        self.state.lock().lock_depth -= 1;
    }

    fn enter_critical_section(&self) -> IrqState {
        let mut state = self.state.lock();
        state.irq_depth += 1;
        IrqState(state.irq_depth - 1)
    }

    fn leave_critical_section(&self, irq: IrqState) {
        self.state.lock().irq_depth = irq.0;
    }

    fn deactivate_realtime(&self, owner: usize, frozen: &mut dyn FnMut(Pid)) -> KernelResult<usize> {
        let mut state = self.state.lock();
        let mut moved = 0;
        for task in state.tasks.iter_mut() {
            if task.is_owned_by(owner) && task.realtime && task.list.is_runnable() {
                task.list = TaskList::Inactive;
                frozen(task.pid);
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn move_to_list(&self, pid: Pid, list: TaskList) -> KernelResult<()> {
        self.state.lock().task_mut(pid)?.list = list;
        Ok(())
    }

    fn sem_cancel_wait(&self, sem: SemId, pid: Pid) -> KernelResult<()> {
        let mut state = self.state.lock();
        let s = state.sems.get_mut(&sem).ok_or(KernelError::NotFound)?;
        let pos = s.waiters.iter().position(|&w| w == pid).ok_or(KernelError::NotFound)?;
        s.waiters.remove(pos);
        s.count += 1;
        let task = state.task_mut(pid)?;
        task.wait = None;
        task.list = TaskList::ReadyToRun;
        Ok(())
    }

    fn sem_release(&self, sem: SemId, holder: Pid) -> KernelResult<()> {
        let mut state = self.state.lock();
        let task = state.task_mut(holder)?;
        let pos = task.held_sems.iter().position(|&s| s == sem).ok_or(KernelError::NotFound)?;
        task.held_sems.remove(pos);

        let s = state.sems.get_mut(&sem).ok_or(KernelError::NotFound)?;
        s.count += 1;
        if let Some(next) = s.waiters.pop_front() {
            let task = state.task_mut(next)?;
            task.wait = None;
            task.list = TaskList::ReadyToRun;
            task.held_sems.push(sem);
        }
        Ok(())
    }

    fn mq_cancel_wait(&self, mq: MqId, pid: Pid, wait: MqWait) -> KernelResult<()> {
        let mut state = self.state.lock();
        let count = state
            .mq_waiters
            .get_mut(&(mq, wait == MqWait::NotEmpty))
            .filter(|c| **c > 0)
            .ok_or(KernelError::NotFound)?;
        *count -= 1;
        let task = state.task_mut(pid)?;
        task.wait = None;
        task.list = TaskList::ReadyToRun;
        Ok(())
    }

    fn wdog_cancel(&self, wdog: WdogId) -> KernelResult<()> {
        let mut state = self.state.lock();
        if !state.wdogs.remove(&wdog) {
            return Err(KernelError::NotFound);
        }
        for task in state.tasks.iter_mut().filter(|t| t.watchdog == Some(wdog)) {
            task.watchdog = None;
        }
        Ok(())
    }

    fn terminate(&self, pid: Pid) -> KernelResult<()> {
        let mut state = self.state.lock();
        if state.fail_terminate.contains(&pid) {
            return Err(KernelError::Busy);
        }
        let pos = state.tasks.iter().position(|t| t.pid == pid).ok_or(KernelError::NoProcess)?;
        state.tasks.remove(pos);
        state.terminated.push(pid);
        Ok(())
    }

    fn signal(&self, pid: Pid, signo: Signo) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.task_mut(pid)?;
        state.signals.push((pid, signo));
        Ok(())
    }
}

// ============================================================================
// Loader
// ============================================================================

/// One call into the process loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCall {
    pub path: String,
    pub bin_idx: usize,
    pub size: u32,
    pub offset: u32,
    pub ram_size: u32,
}

/// Loader that spawns a task in a [`SimScheduler`] per load
pub struct SimLoader {
    sched: SimScheduler,
    calls: spin::Mutex<Vec<LoadCall>>,
    failing: spin::Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl SimLoader {
    pub fn new(sched: SimScheduler) -> Self {
        Self::with_delay(sched, Duration::ZERO)
    }

    /// Each load takes at least `delay`
    pub fn with_delay(sched: SimScheduler, delay: Duration) -> Self {
        Self {
            sched,
            calls: spin::Mutex::new(Vec::new()),
            failing: spin::Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay,
        }
    }

    /// Make loads from `path` fail
    pub fn fail_path(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    pub fn calls(&self) -> Vec<LoadCall> {
        self.calls.lock().clone()
    }

    /// Largest number of loads ever running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ProcessLoader for SimLoader {
    fn load_binary(&self, req: &LoadRequest<'_>) -> KernelResult<Pid> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.calls.lock().push(LoadCall {
            path: req.path.to_string(),
            bin_idx: req.bin_idx,
            size: req.size,
            offset: req.offset,
            ram_size: req.ram_size,
        });
        let res = if self.failing.lock().contains(req.path) {
            Err(KernelError::IoError)
        } else {
            Ok(self.sched.spawn(Some(req.bin_idx), false))
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }
}

// ============================================================================
// Board
// ============================================================================

/// Board that records resets instead of performing them
#[derive(Default)]
pub struct SimBoard {
    resets: spin::Mutex<Vec<RebootReason>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resets(&self) -> Vec<RebootReason> {
        self.resets.lock().clone()
    }
}

impl Board for SimBoard {
    fn reset(&self, reason: RebootReason) {
        log::error!("board reset: {:?} ({:#x})", reason, reason.code());
        self.resets.lock().push(reason);
    }
}
