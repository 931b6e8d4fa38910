//! Request gateway
//!
//! A single thread receives every [`Request`] on the `binmgr_req` queue,
//! executes it and answers on the requester's private `binmgr_resp_<pid>`
//! queue. Every response carries a [`ResultCode`]; a requester whose queue
//! cannot be found is logged and dropped.

use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use nos_api::{PID_NONE, Pid, Scheduler};

use crate::bootparam::{BootParamManager, UpdateTarget};
use crate::callback::Notifier;
use crate::error::{Error, Result, ResultCode};
use crate::ipc::{MessageQueue, NamedQueues, PRIO_FAULT, PRIO_NORMAL, response_queue_name};
use crate::loader::ImageLoader;
use crate::loading::{LoadingQueue, LoadingRequest};
use crate::recovery::Recovery;
use crate::sync::SchedLock;
use crate::table::{BinaryEntry, SharedTable};
use crate::types::{BinIdx, BinName, BinVersion, BinaryGroup, BinaryKind, BinaryState, DevicePath};

/// Operation requested from the binary manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Version and update space of one binary
    GetInfo { name: BinName },
    /// [`Command::GetInfo`] for every binary, kernel first
    GetInfoAll,
    /// Lifecycle state of one binary
    GetState { name: BinName },
    /// Device path of the bank an update should be written to
    GetPath { name: BinName },
    /// Kill and reload one binary
    Reload { name: BinName },
    /// Switch groups to their newer bank at next boot
    Update { groups: BinaryGroup },
    /// Subscribe the requester to state changes
    RegisterCallback { token: usize },
    /// Drop the requester's subscription
    UnregisterCallback,
    /// Fault report, only accepted from the fault sender
    Fault { bin_idx: BinIdx },
    /// Stop the gateway, only accepted from the kernel
    Shutdown,
}

impl Command {
    /// Queue priority of the command
    pub fn priority(&self) -> u8 {
        match self {
            Command::Fault { .. } => PRIO_FAULT,
            _ => PRIO_NORMAL,
        }
    }

    fn is_internal(&self) -> bool {
        matches!(self, Command::Fault { .. } | Command::Shutdown)
    }
}

/// A command and who sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: Command,
    /// Requesting task, [`PID_NONE`] for the kernel itself
    pub requester: Pid,
}

/// Version and update space of a binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
    pub name: BinName,
    pub version: BinVersion,
    /// Bytes available for a new image, -1 without a second bank
    pub available_size: i64,
}

impl BinaryInfo {
    fn from_entry(entry: &BinaryEntry) -> Self {
        Self {
            name: entry.name.clone(),
            version: entry.version.clone(),
            available_size: entry.available_size(),
        }
    }
}

/// Result data of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Info(BinaryInfo),
    InfoAll(Vec<BinaryInfo>),
    State(BinaryState),
    Path(DevicePath),
    Update(Vec<(BinaryGroup, ResultCode)>),
}

/// Answer to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub result: ResultCode,
    pub payload: Payload,
}

impl Response {
    fn from_result(res: Result<Payload>) -> Self {
        match res {
            Ok(payload) => Self {
                result: ResultCode::Ok,
                payload,
            },
            Err(err) => Self {
                result: ResultCode::from(&err),
                payload: Payload::None,
            },
        }
    }
}

/// Everything the gateway dispatches to
pub struct Gateway {
    requests: Arc<MessageQueue<Request>>,
    responses: Arc<NamedQueues<Response>>,
    table: SharedTable,
    sched: Arc<dyn Scheduler>,
    images: Arc<ImageLoader>,
    loading: Arc<LoadingQueue>,
    bootparam: Arc<spin::Mutex<BootParamManager>>,
    recovery: Arc<Recovery>,
    notifier: Arc<Notifier>,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requests: Arc<MessageQueue<Request>>,
        responses: Arc<NamedQueues<Response>>,
        table: SharedTable,
        sched: Arc<dyn Scheduler>,
        images: Arc<ImageLoader>,
        loading: Arc<LoadingQueue>,
        bootparam: Arc<spin::Mutex<BootParamManager>>,
        recovery: Arc<Recovery>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            requests,
            responses,
            table,
            sched,
            images,
            loading,
            bootparam,
            recovery,
            notifier,
        }
    }

    /// Start the gateway thread
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("binmgr_gateway".to_string())
            .spawn(move || self.run())
            .map_err(|err| Error::OperationFailed(format!("spawn gateway: {}", err)))
    }

    fn run(&self) {
        info!("binmgr: gateway started");
        loop {
            let req = self.requests.receive();
            if req.cmd == Command::Shutdown && req.requester == PID_NONE {
                break;
            }
            if let Some(resp) = self.dispatch(&req) {
                self.reply(req.requester, resp);
            }
        }
        info!("binmgr: gateway stopped");
    }

    fn reply(&self, requester: Pid, resp: Response) {
        match self.responses.open(&response_queue_name(requester)) {
            Some(queue) => {
                if queue.try_send(resp, PRIO_NORMAL).is_err() {
                    warn!("binmgr: response queue of pid {} full", requester);
                }
            }
            None => warn!("binmgr: no response queue for pid {}", requester),
        }
    }

    /// Execute one request, returning the response to deliver
    ///
    /// Fault reports produce no response.
    pub fn dispatch(&self, req: &Request) -> Option<Response> {
        if req.cmd.is_internal() && req.requester != PID_NONE {
            warn!("binmgr: pid {} sent internal command {:?}", req.requester, req.cmd);
            return Some(Response::from_result(Err(Error::InvalidParameter(
                "internal command".to_string(),
            ))));
        }
        debug!("binmgr: pid {} requests {:?}", req.requester, req.cmd);

        let res = match &req.cmd {
            Command::GetInfo { name } => self.get_info(name).map(Payload::Info),
            Command::GetInfoAll => Ok(Payload::InfoAll(self.get_info_all())),
            Command::GetState { name } => self.get_state(name).map(Payload::State),
            Command::GetPath { name } => self.get_path(name).map(Payload::Path),
            Command::Reload { name } => self.reload(name).map(|_| Payload::None),
            Command::Update { groups } => return Some(self.update(*groups)),
            Command::RegisterCallback { token } => {
                self.notifier.register(req.requester, *token).map(|_| Payload::None)
            }
            Command::UnregisterCallback => match self.notifier.unregister(req.requester) {
                Ok(true) => Ok(Payload::None),
                Ok(false) => Err(Error::NotFound(format!("subscription of pid {}", req.requester))),
                Err(err) => Err(err),
            },
            Command::Fault { bin_idx } => {
                // recover() resets the board itself on failure
                let _ = self.recovery.recover(*bin_idx);
                return None;
            }
            Command::Shutdown => Ok(Payload::None),
        };
        Some(Response::from_result(res))
    }

    fn get_info(&self, name: &str) -> Result<BinaryInfo> {
        let _lock = SchedLock::new(self.sched.as_ref());
        let table = self.table.lock();
        let idx = table.require(name)?;
        Ok(BinaryInfo::from_entry(table.entry(idx)?))
    }

    fn get_info_all(&self) -> Vec<BinaryInfo> {
        let _lock = SchedLock::new(self.sched.as_ref());
        self.table.lock().iter().map(BinaryInfo::from_entry).collect()
    }

    fn get_state(&self, name: &str) -> Result<BinaryState> {
        let table = self.table.lock();
        let idx = table.require(name)?;
        Ok(table.entry(idx)?.state)
    }

    fn get_path(&self, name: &str) -> Result<DevicePath> {
        let part = {
            let table = self.table.lock();
            let idx = table.require(name)?;
            table
                .entry(idx)?
                .inactive_partition()
                .ok_or_else(|| Error::NotFound(format!("second bank of '{}'", name)))?
        };
        self.images.partition_path(part)
    }

    fn reload(&self, name: &BinName) -> Result<()> {
        {
            let table = self.table.lock();
            let entry = table.entry(table.require(name)?)?;
            if entry.kind == BinaryKind::Kernel {
                return Err(Error::InvalidParameter("kernel cannot be reloaded".to_string()));
            }
            if entry.state.is_recovering() {
                return Err(Error::OperationFailed(format!("'{}' is recovering", name)));
            }
        }
        self.loading.enqueue(LoadingRequest::Reload(name.clone()))
    }

    /// The per-group codes travel with every outcome, failed ones included
    fn update(&self, groups: BinaryGroup) -> Response {
        let targets: Vec<UpdateTarget> = {
            let table = self.table.lock();
            table
                .user_indices()
                .filter_map(|idx| table.get(idx).map(|e| UpdateTarget { idx, kind: e.kind }))
                .collect()
        };
        let results = match self.bootparam.lock().update(&self.images, &targets, groups) {
            Ok(results) => results,
            Err(err) => return Response::from_result(Err(err)),
        };

        let result = if results.iter().any(|(_, code)| *code == ResultCode::OperationFailed) {
            ResultCode::OperationFailed
        } else if results.iter().any(|(_, code)| code.is_ok()) {
            ResultCode::Ok
        } else if results.iter().any(|(_, code)| *code == ResultCode::AlreadyUpdated) {
            ResultCode::AlreadyUpdated
        } else {
            ResultCode::NotFound
        };
        Response {
            result,
            payload: Payload::Update(results),
        }
    }
}
