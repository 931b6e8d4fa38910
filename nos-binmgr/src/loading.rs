//! Loading thread
//!
//! One dedicated thread owns every load, kill and reload, so two of them
//! never overlap. Requests arrive through [`LoadingQueue`]: a FIFO guarded by
//! a counting semaphore that the thread sleeps on.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use nos_api::{Board, Pid, RebootReason};

use crate::callback::Notifier;
use crate::error::{Error, Result};
use crate::loader::ImageLoader;
use crate::sync::{Semaphore, lock};
use crate::table::SharedTable;
use crate::types::{BinIdx, BinName, BinaryKind, BinaryState};

/// Work item for the loading thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadingRequest {
    /// Load every user binary, shared library first
    LoadAll,
    /// Kill and reload one binary
    Reload(BinName),
    /// Kill and reload every user binary after a shared library fault
    ReloadAll,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<LoadingRequest>,
    busy: bool,
    shutdown: bool,
}

/// Requests waiting for the loading thread
#[derive(Default)]
pub struct LoadingQueue {
    state: Mutex<QueueState>,
    ready: Semaphore,
    idle: Condvar,
}

impl LoadingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request and wake the loading thread
    pub fn enqueue(&self, req: LoadingRequest) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.shutdown {
                return Err(Error::OperationFailed("loading thread stopped".to_string()));
            }
            state.pending.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
            state.pending.push_back(req);
        }
        self.ready.post();
        Ok(())
    }

    /// Requests not yet picked up
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    fn next(&self) -> Option<LoadingRequest> {
        loop {
            self.ready.wait();
            let mut state = lock(&self.state);
            if state.shutdown {
                return None;
            }
            if let Some(req) = state.pending.pop_front() {
                state.busy = true;
                return Some(req);
            }
        }
    }

    fn done(&self) {
        let mut state = lock(&self.state);
        state.busy = false;
        if state.pending.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Blocks until nothing is queued or running, or `timeout` expires
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.busy || !state.pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Stop the loading thread after its current request
    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.ready.post();
        self.idle.notify_all();
    }
}

/// Body of the loading thread
pub struct LoadingThread {
    queue: Arc<LoadingQueue>,
    images: Arc<ImageLoader>,
    table: SharedTable,
    board: Arc<dyn Board>,
    notifier: Arc<Notifier>,
}

impl LoadingThread {
    pub fn new(
        queue: Arc<LoadingQueue>,
        images: Arc<ImageLoader>,
        table: SharedTable,
        board: Arc<dyn Board>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            queue,
            images,
            table,
            board,
            notifier,
        }
    }

    /// Start the thread
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("binmgr_loader".to_string())
            .spawn(move || self.run())
            .map_err(|err| Error::OperationFailed(format!("spawn loading thread: {}", err)))
    }

    fn run(&self) {
        info!("binmgr: loading thread started");
        while let Some(req) = self.queue.next() {
            if let Err(err) = self.handle(&req) {
                warn!("binmgr: {:?} failed: {}", req, err);
            }
            self.queue.done();
        }
        info!("binmgr: loading thread stopped");
    }

    /// Execute one request
    pub fn handle(&self, req: &LoadingRequest) -> Result<()> {
        match req {
            LoadingRequest::LoadAll => self.load_all().map(|_| ()),
            LoadingRequest::Reload(name) => self.reload(name).map(|_| ()),
            LoadingRequest::ReloadAll => self.reload_all(),
        }
    }

    fn set_state(&self, idx: BinIdx, state: BinaryState) -> Result<()> {
        self.table.lock().set_state(idx, state).map(|_| ())
    }

    /// User binaries in load order: the shared library before its consumers
    fn load_order(&self) -> Vec<BinIdx> {
        let table = self.table.lock();
        let mut order: Vec<BinIdx> = table.user_indices().collect();
        order.sort_by_key(|&idx| table.get(idx).map_or(true, |e| e.kind != BinaryKind::Common));
        order
    }

    fn start(&self, idx: BinIdx) -> Result<Pid> {
        let pid = self.images.load(idx)?;
        self.set_state(idx, BinaryState::Running)?;
        self.notifier.notify(idx, BinaryState::Running, false);
        Ok(pid)
    }

    /// Loads every user binary
    ///
    /// A binary that fails is logged and skipped. Succeeds if at least one
    /// binary is running, or if there is nothing to load.
    pub fn load_all(&self) -> Result<usize> {
        let order = self.load_order();
        let mut loaded = 0;
        for &idx in &order {
            match self.start(idx) {
                Ok(_) => loaded += 1,
                Err(err) => error!("binmgr: binary {} not loaded: {}", idx, err),
            }
        }
        if loaded == 0 && !order.is_empty() {
            return Err(Error::OperationFailed("no binary could be loaded".to_string()));
        }
        info!("binmgr: {} of {} binaries loaded", loaded, order.len());
        Ok(loaded)
    }

    /// Kills and reloads binary `name`
    ///
    /// A routine reload tells subscribers before the kill and waits for them.
    /// A reload that is part of fault recovery skips that handshake, and any
    /// failure along the way resets the board.
    pub fn reload(&self, name: &str) -> Result<Pid> {
        let (idx, recovering) = {
            let table = self.table.lock();
            let idx = table.require(name)?;
            let entry = table.entry(idx)?;
            if entry.kind == BinaryKind::Kernel {
                return Err(Error::InvalidParameter("kernel cannot be reloaded".to_string()));
            }
            (idx, entry.state.is_recovering())
        };

        if recovering {
            self.set_state(idx, BinaryState::Reloading)?;
            self.notifier.notify(idx, BinaryState::Reloading, false);
        } else {
            self.set_state(idx, BinaryState::ReadyToUnload)?;
            self.notifier.notify(idx, BinaryState::ReadyToUnload, true);
        }

        let res = self.images.kill_binary(idx).and_then(|_| {
            if !recovering {
                self.set_state(idx, BinaryState::Unloaded)?;
                self.notifier.notify(idx, BinaryState::Unloaded, false);
            }
            self.start(idx)
        });

        match res {
            Ok(pid) => {
                info!("binmgr: '{}' reloaded as pid {}", name, pid);
                Ok(pid)
            }
            Err(err) if recovering => {
                error!("binmgr: recovery reload of '{}' failed: {}", name, err);
                self.board.reset(RebootReason::BinaryRecoveryFail);
                Err(err)
            }
            Err(err) => {
                self.set_state(idx, BinaryState::Inactive)?;
                Err(err)
            }
        }
    }

    /// Kills every user binary, then loads them all again
    pub fn reload_all(&self) -> Result<()> {
        let res = self.try_reload_all();
        if let Err(err) = &res {
            error!("binmgr: reload of all binaries failed: {}", err);
            self.board.reset(RebootReason::BinaryRecoveryFail);
        }
        res
    }

    fn try_reload_all(&self) -> Result<()> {
        let order = self.load_order();
        for &idx in order.iter().rev() {
            self.set_state(idx, BinaryState::Reloading)?;
            self.images.kill_binary(idx)?;
        }
        for &idx in &order {
            self.start(idx)?;
        }
        Ok(())
    }
}
