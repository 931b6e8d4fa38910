//! Message queues
//!
//! A bounded priority queue in the spirit of POSIX `mq_*`: higher priority
//! messages are received first, equal priorities in send order. Queues are
//! found by name through [`NamedQueues`], which is how a requester's private
//! response queue is derived from its pid.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use nos_api::Pid;

use crate::error::{Error, Result};
use crate::sync::lock;

/// Well-known request queue
pub const BINMGR_REQUEST_MQ: &str = "binmgr_req";
/// Prefix of per-requester response queues
pub const BINMGR_RESPONSE_MQ_PREFIX: &str = "binmgr_resp_";
/// Prefix of per-subscriber callback queues
pub const BINMGR_CALLBACK_MQ_PREFIX: &str = "binmgr_cb_";
/// Shared queue carrying callback acknowledgments
pub const BINMGR_CALLBACK_ACK_MQ: &str = "binmgr_cb_ack";

/// Priority of routine requests
pub const PRIO_NORMAL: u8 = 10;
/// Priority of fault requests
pub const PRIO_FAULT: u8 = u8::MAX;

/// Name of the response queue of `pid`
pub fn response_queue_name(pid: Pid) -> String {
    format!("{}{}", BINMGR_RESPONSE_MQ_PREFIX, pid)
}

/// Name of the callback queue of `pid`
pub fn callback_queue_name(pid: Pid) -> String {
    format!("{}{}", BINMGR_CALLBACK_MQ_PREFIX, pid)
}

struct Slot<T> {
    prio: u8,
    seq: u64,
    msg: T,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.prio == other.prio && self.seq == other.seq
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then older first
        self.prio
            .cmp(&other.prio)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct MqState<T> {
    heap: BinaryHeap<Slot<T>>,
    seq: u64,
}

/// Bounded priority message queue
pub struct MessageQueue<T> {
    state: Mutex<MqState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> MessageQueue<T> {
    /// Create a queue holding at most `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MqState {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, state: &mut MqState<T>, msg: T, prio: u8) {
        let seq = state.seq;
        state.seq += 1;
        state.heap.push(Slot { prio, seq, msg });
        self.not_empty.notify_one();
    }

    fn pop(&self, state: &mut MqState<T>) -> Option<T> {
        let slot = state.heap.pop()?;
        self.not_full.notify_one();
        Some(slot.msg)
    }

    /// Send, blocking while the queue is full
    pub fn send(&self, msg: T, prio: u8) {
        let mut state = lock(&self.state);
        while state.heap.len() >= self.capacity {
            state = self.not_full.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        self.push(&mut state, msg, prio);
    }

    /// Send without blocking
    pub fn try_send(&self, msg: T, prio: u8) -> Result<()> {
        let mut state = lock(&self.state);
        if state.heap.len() >= self.capacity {
            return Err(Error::OperationFailed("message queue full".to_string()));
        }
        self.push(&mut state, msg, prio);
        Ok(())
    }

    /// Receive, blocking while the queue is empty
    pub fn receive(&self) -> T {
        let mut state = lock(&self.state);
        loop {
            if let Some(msg) = self.pop(&mut state) {
                return msg;
            }
            state = self.not_empty.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Receive, giving up after `timeout`
    pub fn receive_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(msg) = self.pop(&mut state) {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Receive without blocking
    pub fn try_receive(&self) -> Option<T> {
        let mut state = lock(&self.state);
        self.pop(&mut state)
    }

    /// Messages currently queued
    pub fn len(&self) -> usize {
        lock(&self.state).heap.len()
    }

    /// Returns true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Queues looked up by name
pub struct NamedQueues<T> {
    queues: spin::Mutex<HashMap<String, Arc<MessageQueue<T>>>>,
}

impl<T> Default for NamedQueues<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NamedQueues<T> {
    /// Create an empty namespace
    pub fn new() -> Self {
        Self {
            queues: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Open `name`, creating it with `capacity` if absent
    pub fn open_or_create(&self, name: &str, capacity: usize) -> Arc<MessageQueue<T>> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MessageQueue::new(capacity)))
            .clone()
    }

    /// Open an existing queue
    pub fn open(&self, name: &str) -> Option<Arc<MessageQueue<T>>> {
        self.queues.lock().get(name).cloned()
    }

    /// Remove a queue name; holders of the queue keep their handle
    pub fn unlink(&self, name: &str) -> bool {
        self.queues.lock().remove(name).is_some()
    }
}
