//! Requester side of the gateway
//!
//! A [`BinmgrClient`] belongs to one task. It owns the task's response queue
//! and, once registered, its callback queue. Dropping the client unlinks both.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use nos_api::Pid;

use crate::callback::{CallbackAck, CallbackMessage};
use crate::error::{Error, Result, ResultCode};
use crate::gateway::{BinaryInfo, Command, Payload, Request, Response};
use crate::ipc::{MessageQueue, NamedQueues, PRIO_NORMAL, callback_queue_name, response_queue_name};
use crate::types::{BinaryGroup, BinaryState, DevicePath, fixed_str};

/// Queues a client is wired to
#[derive(Clone)]
pub struct ClientQueues {
    pub requests: Arc<MessageQueue<Request>>,
    pub responses: Arc<NamedQueues<Response>>,
    pub callbacks: Arc<NamedQueues<CallbackMessage>>,
    pub acks: Arc<MessageQueue<CallbackAck>>,
    pub response_depth: usize,
    pub callback_depth: usize,
    pub timeout: Duration,
}

/// Binary manager API for one task
pub struct BinmgrClient {
    pid: Pid,
    queues: ClientQueues,
    reply: Arc<MessageQueue<Response>>,
}

fn check(resp: &Response, what: &str) -> Result<()> {
    match resp.result {
        ResultCode::Ok => Ok(()),
        ResultCode::OperationFailed => Err(Error::OperationFailed(what.into())),
        ResultCode::InvalidParameter => Err(Error::InvalidParameter(what.into())),
        ResultCode::OutOfMemory => Err(Error::OutOfMemory),
        ResultCode::NotFound => Err(Error::NotFound(what.into())),
        ResultCode::AlreadyRegistered => Err(Error::AlreadyRegistered),
        ResultCode::AlreadyUpdated => Err(Error::AlreadyUpdated),
    }
}

fn unexpected(what: &str) -> Error {
    Error::OperationFailed(format!("unexpected payload for {}", what))
}

impl BinmgrClient {
    /// Create the client of task `pid`
    pub fn new(pid: Pid, queues: ClientQueues) -> Self {
        let reply = queues
            .responses
            .open_or_create(&response_queue_name(pid), queues.response_depth);
        Self { pid, queues, reply }
    }

    /// Task this client speaks for
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a command and wait for its response
    pub fn call(&self, cmd: Command) -> Result<Response> {
        let prio = cmd.priority();
        self.queues.requests.send(
            Request {
                cmd,
                requester: self.pid,
            },
            prio,
        );
        self.reply
            .receive_timeout(self.queues.timeout)
            .ok_or(Error::Timeout)
    }

    /// Version and update space of `name`
    pub fn get_info(&self, name: &str) -> Result<BinaryInfo> {
        let resp = self.call(Command::GetInfo { name: fixed_str(name)? })?;
        check(&resp, name)?;
        match resp.payload {
            Payload::Info(info) => Ok(info),
            _ => Err(unexpected("get_info")),
        }
    }

    /// Info rows of every binary, kernel first
    pub fn get_info_all(&self) -> Result<Vec<BinaryInfo>> {
        let resp = self.call(Command::GetInfoAll)?;
        check(&resp, "all binaries")?;
        match resp.payload {
            Payload::InfoAll(rows) => Ok(rows),
            _ => Err(unexpected("get_info_all")),
        }
    }

    /// Lifecycle state of `name`
    pub fn get_state(&self, name: &str) -> Result<BinaryState> {
        let resp = self.call(Command::GetState { name: fixed_str(name)? })?;
        check(&resp, name)?;
        match resp.payload {
            Payload::State(state) => Ok(state),
            _ => Err(unexpected("get_state")),
        }
    }

    /// Device path to write a new image of `name` to
    pub fn get_path(&self, name: &str) -> Result<DevicePath> {
        let resp = self.call(Command::GetPath { name: fixed_str(name)? })?;
        check(&resp, name)?;
        match resp.payload {
            Payload::Path(path) => Ok(path),
            _ => Err(unexpected("get_path")),
        }
    }

    /// Ask for `name` to be killed and reloaded
    ///
    /// Returns once the reload is queued, not once it completes.
    pub fn reload(&self, name: &str) -> Result<()> {
        let resp = self.call(Command::Reload { name: fixed_str(name)? })?;
        check(&resp, name)
    }

    /// Switch `groups` to their newer bank at next boot
    ///
    /// Per-group codes are returned even when the overall result is an error.
    pub fn update(&self, groups: BinaryGroup) -> Result<(ResultCode, Vec<(BinaryGroup, ResultCode)>)> {
        let resp = self.call(Command::Update { groups })?;
        match resp.payload {
            Payload::Update(results) => Ok((resp.result, results)),
            Payload::None => {
                check(&resp, "update")?;
                Ok((resp.result, Vec::new()))
            }
            _ => Err(unexpected("update")),
        }
    }

    /// Subscribe to state changes of other binaries
    pub fn register_callback(&self, token: usize) -> Result<()> {
        let name = callback_queue_name(self.pid);
        let existed = self.queues.callbacks.open(&name).is_some();
        self.queues.callbacks.open_or_create(&name, self.queues.callback_depth);
        let resp = self.call(Command::RegisterCallback { token })?;
        let res = check(&resp, "register callback");
        if res.is_err() && !existed {
            self.queues.callbacks.unlink(&name);
        }
        res
    }

    /// Drop the subscription
    pub fn unregister_callback(&self) -> Result<()> {
        let resp = self.call(Command::UnregisterCallback)?;
        check(&resp, "unregister callback")?;
        self.queues.callbacks.unlink(&callback_queue_name(self.pid));
        Ok(())
    }

    /// Next notification, waiting at most `timeout`
    pub fn next_callback(&self, timeout: Duration) -> Option<CallbackMessage> {
        self.queues
            .callbacks
            .open(&callback_queue_name(self.pid))?
            .receive_timeout(timeout)
    }

    /// Acknowledge a notification that asked for it
    pub fn ack_callback(&self) -> Result<()> {
        self.queues.acks.try_send(CallbackAck { pid: self.pid }, PRIO_NORMAL)
    }
}

impl Drop for BinmgrClient {
    fn drop(&mut self) {
        self.queues.responses.unlink(&response_queue_name(self.pid));
        self.queues.callbacks.unlink(&callback_queue_name(self.pid));
    }
}
