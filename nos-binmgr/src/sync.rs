//! Synchronization helpers
//!
//! Short critical sections over shared tables use `spin::Mutex`. Anything a
//! thread may sleep on (the loading semaphore, message queues) is built on
//! the standard blocking primitives.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nos_api::{IrqState, Scheduler};

/// Locks a std mutex, ignoring poisoning
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Counting semaphore
// ============================================================================

/// Counting semaphore
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with an initial count
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Increment the count, waking one waiter
    pub fn post(&self) {
        let mut count = lock(&self.count);
        *count += 1;
        self.cond.notify_one();
    }

    /// Block until the count is positive, then decrement it
    pub fn wait(&self) {
        let mut count = lock(&self.count);
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    /// Like [`Semaphore::wait`] but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = lock(&self.count);
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .cond
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *count -= 1;
        true
    }

    /// Current count
    pub fn count(&self) -> usize {
        *lock(&self.count)
    }
}

// ============================================================================
// Scheduler guards
// ============================================================================

/// Holds the scheduler lock (preemption disabled) for its lifetime
pub struct SchedLock<'a> {
    sched: &'a dyn Scheduler,
}

impl<'a> SchedLock<'a> {
    /// Disable preemption
    pub fn new(sched: &'a dyn Scheduler) -> Self {
        sched.sched_lock();
        Self { sched }
    }
}

impl Drop for SchedLock<'_> {
    fn drop(&mut self) {
        self.sched.sched_unlock();
    }
}

/// Holds a critical section (interrupts disabled) for its lifetime
pub struct CriticalSection<'a> {
    sched: &'a dyn Scheduler,
    state: IrqState,
}

impl<'a> CriticalSection<'a> {
    /// Disable interrupts
    pub fn enter(sched: &'a dyn Scheduler) -> Self {
        let state = sched.enter_critical_section();
        Self { sched, state }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.sched.leave_critical_section(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(1);
        sem.wait();
        assert_eq!(sem.count(), 0);
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
        sem.post();
        assert!(sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_semaphore_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait())
        };
        sem.post();
        waiter.join().unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_guards_restore_scheduler() {
        let sched = crate::testing::SimScheduler::new();
        {
            let _lock = SchedLock::new(&sched);
            let _outer = CriticalSection::enter(&sched);
            let _inner = CriticalSection::enter(&sched);
            assert!(!sched.balanced());
        }
        assert!(sched.balanced());
    }
}
